use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 内置的按作业类别划分的默认超时 (秒)
pub const BUILTIN_TIMEOUTS: &[(&str, u64)] = &[
    ("scraping", 600),
    ("clustering", 180),
    ("reports", 300),
    ("social_media", 240),
    ("images", 900),
    ("audio", 600),
    ("video", 1200),
    ("publishing", 400),
    ("broadcast", 1000),
];

/// 超时守卫配置
///
/// 解析顺序: `enabled = false` 时不设截止时间; 否则依次使用
/// `overrides[任务类型]`、作业自身配置的超时、内置类别默认值、`default_seconds`。
/// 环境变量 `CRONPOOL__TIMEOUTS__OVERRIDES__SCRAPING=900` 可覆盖单个类型,
/// `CRONPOOL__TIMEOUTS__ENABLED=false` 关闭所有截止时间 (本地调试用)。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub enabled: bool,
    pub default_seconds: u64,
    pub overrides: HashMap<String, u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_seconds: 300,
            overrides: HashMap::new(),
        }
    }
}

impl TimeoutsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_seconds == 0 {
            return Err(anyhow::anyhow!("默认超时时间必须大于0"));
        }

        if let Some((task_type, _)) = self.overrides.iter().find(|(_, secs)| **secs == 0) {
            return Err(anyhow::anyhow!("任务类型 {task_type} 的超时时间必须大于0"));
        }

        Ok(())
    }

    /// 内置默认值: 精确匹配类别名, 否则取作为前缀匹配的最长类别
    pub fn builtin_default(task_type: &str) -> Option<u64> {
        BUILTIN_TIMEOUTS
            .iter()
            .find(|(category, _)| *category == task_type)
            .or_else(|| {
                BUILTIN_TIMEOUTS
                    .iter()
                    .filter(|(category, _)| task_type.starts_with(category))
                    .max_by_key(|(category, _)| category.len())
            })
            .map(|(_, secs)| *secs)
    }

    /// 解析任务类型的超时; `None` 表示不设截止时间
    pub fn resolve(&self, task_type: &str, job_default: Option<u64>) -> Option<Duration> {
        if !self.enabled {
            return None;
        }

        let seconds = self
            .overrides
            .get(task_type)
            .copied()
            .or(job_default)
            .or_else(|| Self::builtin_default(task_type))
            .unwrap_or(self.default_seconds);

        Some(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        assert_eq!(TimeoutsConfig::builtin_default("scraping"), Some(600));
        assert_eq!(TimeoutsConfig::builtin_default("video"), Some(1200));
        assert_eq!(TimeoutsConfig::builtin_default("social_media_generation"), Some(240));
        assert_eq!(TimeoutsConfig::builtin_default("unknown"), None);
    }

    #[test]
    fn test_resolution_order() {
        let mut config = TimeoutsConfig::default();
        assert_eq!(config.resolve("clustering", None), Some(Duration::from_secs(180)));
        assert_eq!(config.resolve("clustering", Some(60)), Some(Duration::from_secs(60)));
        assert_eq!(config.resolve("newsletter", None), Some(Duration::from_secs(300)));

        config.overrides.insert("clustering".to_string(), 30);
        assert_eq!(config.resolve("clustering", Some(60)), Some(Duration::from_secs(30)));

        config.enabled = false;
        assert_eq!(config.resolve("clustering", Some(60)), None);
    }

    #[test]
    fn test_zero_override_rejected() {
        let mut config = TimeoutsConfig::default();
        config.overrides.insert("audio".to_string(), 0);
        assert!(config.validate().is_err());
    }
}
