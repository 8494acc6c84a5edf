use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SchedulerError;
use crate::SchedulerResult;

/// 作业函数返回的摘要 (协作方给出的JSON)
///
/// 约定:
/// - 对象中带有非空 `error` 字段视为失败, 由 [`JobSummary::from_value`] 转为错误
/// - `skipped: true` 视为成功, 描述为 `Skipped: <reason>`
/// - 否则依次取 `processed`、`generated`、`count`, 都没有时为 `completed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSummary(pub Value);

impl JobSummary {
    pub fn completed() -> Self {
        Self(Value::Null)
    }

    /// 解析协作方返回的JSON, 带 `error` 的结果返回 [`SchedulerError::TaskExecution`]
    pub fn from_value(value: Value) -> SchedulerResult<Self> {
        if let Some(error) = value.get("error").filter(|e| is_truthy(e)) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(SchedulerError::TaskExecution(message));
        }
        Ok(Self(value))
    }

    pub fn is_skipped(&self) -> bool {
        self.0.get("skipped").is_some_and(is_truthy)
    }

    /// 写入执行日志 `result` 字段的文本
    pub fn describe(&self) -> String {
        if self.is_skipped() {
            let reason = self
                .0
                .get("reason")
                .map(display_value)
                .unwrap_or_else(|| "no reason".to_string());
            return format!("Skipped: {reason}");
        }

        match &self.0 {
            Value::Object(map) => ["processed", "generated", "count"]
                .iter()
                .find_map(|key| map.get(*key))
                .map(display_value)
                .unwrap_or_else(|| "completed".to_string()),
            Value::Null => "completed".to_string(),
            other => display_value(other),
        }
    }
}

impl From<Value> for JobSummary {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
