use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务定义未找到: {task_type}")]
    TaskNotFound { task_type: String },

    #[error("任务定义未找到: id={id}")]
    TaskIdNotFound { id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("未注册的任务类型: {0}")]
    UnknownTaskType(String),

    #[error("任务执行超时: {seconds}秒")]
    ExecutionTimeout { seconds: u64 },

    #[error("检测到依赖死锁, 无法继续执行: {pending:?}")]
    DependencyDeadlock { pending: Vec<String> },

    #[error("无效的作业配置: {0}")]
    InvalidJobConfig(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 配置类错误对该任务是致命的, 不会被自动重试
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidCron { .. }
                | SchedulerError::UnknownTaskType(_)
                | SchedulerError::DependencyDeadlock { .. }
                | SchedulerError::InvalidJobConfig(_)
                | SchedulerError::Configuration(_)
        )
    }

    /// 存储层错误, 调用方应退避重试
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::DatabaseOperation(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let cron = SchedulerError::InvalidCron {
            expr: "bad".to_string(),
            message: "解析失败".to_string(),
        };
        assert!(cron.is_configuration_error());
        assert!(!cron.is_storage_error());

        let unknown = SchedulerError::UnknownTaskType("mystery".to_string());
        assert!(unknown.is_configuration_error());

        let storage = SchedulerError::DatabaseOperation("连接断开".to_string());
        assert!(storage.is_storage_error());
        assert!(!storage.is_configuration_error());

        let transient = SchedulerError::Network("502".to_string());
        assert!(!transient.is_configuration_error());
        assert!(!transient.is_storage_error());
    }

    #[test]
    fn test_error_messages() {
        let err = SchedulerError::DependencyDeadlock {
            pending: vec!["b".to_string()],
        };
        assert!(err.to_string().contains("依赖死锁"));

        let err = SchedulerError::TaskNotFound {
            task_type: "scraping".to_string(),
        };
        assert_eq!(err.to_string(), "任务定义未找到: scraping");
    }
}
