use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};

use super::{
    database::DatabaseConfig,
    jobs::JobSpec,
    observability::ObservabilityConfig,
    scheduler_worker::{SchedulerConfig, WorkerConfig},
    timeouts::TimeoutsConfig,
};

/// 环境变量前缀, 层级之间用 `__` 分隔: `CRONPOOL__WORKER__POLL_INTERVAL_SECONDS=10`
pub const ENV_PREFIX: &str = "CRONPOOL";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub timeouts: TimeoutsConfig,
    pub jobs: HashMap<String, JobSpec>,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: CRONPOOL__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with_env(config_path, None)
    }

    /// 同 [`AppConfig::load`], 但可以用给定的键值代替进程环境变量
    pub fn load_with_env(
        config_path: Option<&str>,
        env: Option<Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/cronpool.toml",
                "cronpool.toml",
                "/etc/cronpool/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.timeouts.validate().context("超时配置验证失败")?;
        for (task_type, spec) in &self.jobs {
            spec.validate(task_type).context("作业配置验证失败")?;
        }
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval_seconds, 5);
        assert_eq!(config.worker.max_consecutive_failures, 5);
        assert!(config.timeouts.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "postgres://localhost/cronpool"

            [worker]
            worker_id = "worker-a"
            poll_interval_seconds = 10

            [jobs.clustering]
            kind = "command"
            program = "cluster"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.worker_id, "worker-a");
        assert_eq!(config.worker.poll_interval_seconds, 10);
        assert_eq!(config.worker.lease_ttl_seconds, 1800);
        assert_eq!(config.database.max_connections, 10);
        assert!(config.jobs.contains_key("clustering"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [timeouts]
            default_seconds = 120

            [worker]
            worker_id = "from-file"
            "#
        )
        .unwrap();

        let mut env = Map::new();
        env.insert("CRONPOOL__WORKER__WORKER_ID".to_string(), "from-env".to_string());
        env.insert("CRONPOOL__TIMEOUTS__ENABLED".to_string(), "false".to_string());
        env.insert(
            "CRONPOOL__TIMEOUTS__OVERRIDES__SCRAPING".to_string(),
            "900".to_string(),
        );

        let path = file.path().to_str().unwrap();
        let config = AppConfig::load_with_env(Some(path), Some(env)).unwrap();

        assert_eq!(config.worker.worker_id, "from-env");
        assert_eq!(config.timeouts.default_seconds, 120);
        assert!(!config.timeouts.enabled);
        assert_eq!(config.timeouts.overrides.get("scraping"), Some(&900));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load(Some("/nonexistent/cronpool.toml")).is_err());
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let result = AppConfig::from_toml(
            r#"
            [scheduler]
            tick_interval_seconds = 0
            "#,
        );
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("调度间隔必须大于0"));
    }
}
