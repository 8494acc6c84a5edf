use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 调度进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_seconds: u64,
    pub stats_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_seconds: 5,
            stats_interval_seconds: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.stats_interval_seconds == 0 {
            return Err(anyhow::anyhow!("统计间隔必须大于0"));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }
}

/// Worker 进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub poll_interval_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub reclaim_interval_seconds: u64,
    /// 连续失败达到该次数后自动暂停, 0 表示不暂停
    pub max_consecutive_failures: u32,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: default_worker_id(),
            poll_interval_seconds: 60,
            lease_ttl_seconds: 1800,
            heartbeat_interval_seconds: 30,
            reclaim_interval_seconds: 180,
            max_consecutive_failures: 5,
            storage_retry_attempts: 5,
            storage_retry_base_delay_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.lease_ttl_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!(
                "租约TTL ({}秒) 必须大于心跳间隔 ({}秒)",
                self.lease_ttl_seconds,
                self.heartbeat_interval_seconds
            ));
        }

        if self.reclaim_interval_seconds == 0 {
            return Err(anyhow::anyhow!("租约回收间隔必须大于0"));
        }

        if self.storage_retry_attempts == 0 {
            return Err(anyhow::anyhow!("存储重试次数必须大于0"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_seconds)
    }

    pub fn storage_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.storage_retry_base_delay_ms)
    }
}

/// 默认 Worker ID: `主机名-进程号`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.lease_ttl(), Duration::from_secs(1800));
        assert!(config.worker_id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_lease_ttl_must_exceed_heartbeat() {
        let config = WorkerConfig {
            lease_ttl_seconds: 30,
            heartbeat_interval_seconds: 30,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let config = SchedulerConfig {
            tick_interval_seconds: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
