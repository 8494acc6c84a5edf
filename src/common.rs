use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use cronpool_core::AppConfig;
use cronpool_infrastructure::init_metrics;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppMode, Application};
use crate::shutdown::ShutdownManager;

/// 等待当前作业结束的最长时间
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// 通用的应用启动配置, 命令行参数优先于配置文件
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub worker_id: Option<String>,
}

impl StartupConfig {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let get = |name: &str| {
            matches
                .try_get_one::<String>(name)
                .ok()
                .flatten()
                .cloned()
        };
        Self {
            config_path: get("config"),
            log_level: get("log-level"),
            log_format: get("log-format"),
            worker_id: get("worker-id"),
        }
    }
}

/// 初始化日志系统, `RUST_LOG` 优先于 `log_level`
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 加载应用配置并应用命令行覆盖
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let mut config = AppConfig::load(startup_config.config_path.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            startup_config
                .config_path
                .as_deref()
                .unwrap_or("<默认路径>")
        )
    })?;

    if let Some(ref worker_id) = startup_config.worker_id {
        config.worker.worker_id = worker_id.clone();
    }
    if let Some(ref level) = startup_config.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(ref format) = startup_config.log_format {
        config.observability.log_format = format.clone();
    }

    config.validate()?;
    Ok(config)
}

/// 启动应用程序并阻塞到退出
///
/// 收到 SIGINT/SIGTERM 后广播关闭信号, Worker 完成当前作业后退出。
/// 应用自身出错 (存储持续不可用) 时返回错误, 进程以非零状态退出。
pub async fn start_application(
    startup_config: StartupConfig,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config = load_config(&startup_config)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动 {} 服务", service_name);
    info!("运行模式: {:?}", app_mode);
    if let Some(ref path) = startup_config.config_path {
        info!("配置文件: {}", path);
    }

    validate_mode_enabled(app_mode, &config)?;

    if config.observability.metrics_enabled {
        if let Some(ref address) = config.observability.metrics_listen_address {
            init_metrics(address)?;
        }
    }

    let app = Arc::new(Application::new(config, app_mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            // 应用在没有关闭信号时自行退出
            let result = result.context("应用任务异常结束")?;
            if let Err(ref e) = result {
                error!("{} 服务运行失败: {:#}", service_name, e);
            }
            return result;
        }
    }

    shutdown_manager.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, app_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("{} 服务已优雅关闭", service_name);
        }
        Ok(Ok(Err(e))) => {
            error!("{} 服务关闭时发生错误: {:#}", service_name, e);
            return Err(e);
        }
        Ok(Err(e)) => {
            error!("{} 服务任务异常结束: {}", service_name, e);
        }
        Err(_) => {
            warn!("{} 服务关闭超时，强制退出", service_name);
        }
    }

    info!("{} 服务已退出", service_name);
    Ok(())
}

/// 各服务共用的命令行参数
pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("配置文件路径 (默认依次查找 config/cronpool.toml、cronpool.toml)"),
        Arg::new("log-level")
            .short('l')
            .long("log-level")
            .value_name("LEVEL")
            .help("日志级别")
            .value_parser(["trace", "debug", "info", "warn", "error"]),
        Arg::new("log-format")
            .long("log-format")
            .value_name("FORMAT")
            .help("日志格式")
            .value_parser(["json", "pretty"]),
    ]
}

/// 单一模式服务的命令行入口
pub async fn run_cli(
    name: &'static str,
    about: &'static str,
    long_about: Option<&'static str>,
    custom_args: Vec<Arg>,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let mut command = Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .args(common_args())
        .args(custom_args);
    if let Some(long_about) = long_about {
        command = command.long_about(long_about);
    }

    let matches = command.get_matches();
    start_application(StartupConfig::from_matches(&matches), app_mode, service_name).await
}

fn validate_mode_enabled(app_mode: AppMode, config: &AppConfig) -> Result<()> {
    match app_mode {
        AppMode::Scheduler if !config.scheduler.enabled => {
            Err(anyhow::anyhow!("调度器模式被禁用，请检查配置"))
        }
        AppMode::Worker if !config.worker.enabled => {
            Err(anyhow::anyhow!("Worker模式被禁用，请检查配置"))
        }
        _ => Ok(()),
    }
}

/// 解析应用运行模式
pub fn parse_app_mode(mode_str: &str) -> Result<AppMode> {
    match mode_str {
        "scheduler" => Ok(AppMode::Scheduler),
        "worker" => Ok(AppMode::Worker),
        "all" => Ok(AppMode::All),
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode_str}")),
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_app_mode() {
        assert_eq!(parse_app_mode("scheduler").unwrap(), AppMode::Scheduler);
        assert_eq!(parse_app_mode("all").unwrap(), AppMode::All);
        assert!(parse_app_mode("api").is_err());
    }

    #[test]
    fn test_command_line_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"[worker]\nworker_id = \"from-file\"\n[observability]\nlog_level = \"warn\"\n",
        )
        .unwrap();

        let startup = StartupConfig {
            config_path: Some(file.path().to_str().unwrap().to_string()),
            log_level: Some("debug".to_string()),
            log_format: None,
            worker_id: Some("from-cli".to_string()),
        };
        let config = load_config(&startup).unwrap();
        assert_eq!(config.worker.worker_id, "from-cli");
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = AppConfig::load(Some("config/cronpool.toml")).unwrap();
        assert_eq!(config.scheduler.tick_interval_seconds, 5);
        assert_eq!(config.jobs.len(), 4);
        assert_eq!(config.jobs["processing_pipeline"].kind(), "pipeline");
    }

    #[test]
    fn test_disabled_mode_rejected() {
        let mut config = AppConfig::default();
        config.worker.enabled = false;
        assert!(validate_mode_enabled(AppMode::Worker, &config).is_err());
        assert!(validate_mode_enabled(AppMode::Scheduler, &config).is_ok());
    }

    #[test]
    fn test_startup_config_from_matches() {
        let matches = Command::new("test")
            .args(common_args())
            .try_get_matches_from(["test", "-c", "custom.toml", "--log-format", "json"])
            .unwrap();
        let startup = StartupConfig::from_matches(&matches);
        assert_eq!(startup.config_path.as_deref(), Some("custom.toml"));
        assert_eq!(startup.log_format.as_deref(), Some("json"));
        assert_eq!(startup.worker_id, None);
    }
}
