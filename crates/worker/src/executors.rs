//! 作业种类: HTTP调用、子进程命令和进程内闭包
//!
//! 它们都实现 [`JobFunction`], 由任务注册表按任务类型持有。

use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use cronpool_core::{JobFunction, JobSummary, SchedulerError, SchedulerResult};
use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 错误信息中保留的输出长度
const OUTPUT_TAIL_CHARS: usize = 2000;

/// 调用协作方HTTP接口的作业
pub struct HttpJob {
    client: reqwest::Client,
    endpoint: String,
    method: Method,
    body: Option<Value>,
    headers: HashMap<String, String>,
}

impl HttpJob {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        method: &str,
    ) -> SchedulerResult<Self> {
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| SchedulerError::InvalidJobConfig(format!("不支持的HTTP方法: {method}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            method,
            body: None,
            headers: HashMap::new(),
        })
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl JobFunction for HttpJob {
    fn kind(&self) -> &str {
        "http"
    }

    async fn run(&self) -> SchedulerResult<JobSummary> {
        info!("执行HTTP作业: method={}, url={}", self.method, self.endpoint);

        let mut request_builder = self.client.request(self.method.clone(), &self.endpoint);
        for (key, value) in &self.headers {
            request_builder = request_builder.header(key, value);
        }
        if let Some(body) = &self.body {
            request_builder = request_builder.json(body);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("请求 {} 失败: {e}", self.endpoint)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SchedulerError::Network(format!("读取响应体失败: {e}")))?;

        if !status.is_success() {
            return Err(SchedulerError::TaskExecution(format!(
                "HTTP {}: {}",
                status.as_u16(),
                tail(&text)
            )));
        }

        summary_from_output(&text)
    }
}

/// 启动子进程的作业
///
/// 子进程设置了 `kill_on_drop`, 超时守卫中止作业时子进程随之结束。
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<String>,
}

impl CommandJob {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, working_dir: Option<String>) -> Self {
        self.working_dir = working_dir;
        self
    }
}

#[async_trait]
impl JobFunction for CommandJob {
    fn kind(&self) -> &str {
        "command"
    }

    async fn run(&self) -> SchedulerResult<JobSummary> {
        info!("执行命令作业: program={}, args={:?}", self.program, self.args);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            SchedulerError::TaskExecution(format!("启动命令 {} 失败: {e}", self.program))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                tail(&stdout)
            } else {
                tail(&stderr)
            };
            return Err(SchedulerError::TaskExecution(format!(
                "命令执行失败，退出码: {:?}: {}",
                output.status.code(),
                detail
            )));
        }

        if !stderr.trim().is_empty() {
            debug!("命令 {} 的stderr: {}", self.program, tail(&stderr));
        }
        summary_from_output(&stdout)
    }
}

type JobFn = dyn Fn() -> BoxFuture<'static, SchedulerResult<JobSummary>> + Send + Sync;

/// 进程内闭包作业, 用于编程注册
pub struct FnJob {
    kind: String,
    function: Arc<JobFn>,
}

impl FnJob {
    pub fn new<F, Fut>(kind: impl Into<String>, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<JobSummary>> + Send + 'static,
    {
        Self {
            kind: kind.into(),
            function: Arc::new(move || -> BoxFuture<'static, SchedulerResult<JobSummary>> {
                Box::pin(function())
            }),
        }
    }
}

#[async_trait]
impl JobFunction for FnJob {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn run(&self) -> SchedulerResult<JobSummary> {
        (self.function)().await
    }
}

/// 注册时就能确定无法运行的作业, 每次执行都返回配置错误, 对应任务会被挂起
pub struct MisconfiguredJob {
    message: String,
}

impl MisconfiguredJob {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!("作业配置无效: {}", message);
        Self { message }
    }
}

#[async_trait]
impl JobFunction for MisconfiguredJob {
    fn kind(&self) -> &str {
        "misconfigured"
    }

    async fn run(&self) -> SchedulerResult<JobSummary> {
        Err(SchedulerError::InvalidJobConfig(self.message.clone()))
    }
}

/// 协作方输出为JSON时按摘要约定解析, 否则原样保留
fn summary_from_output(output: &str) -> SchedulerResult<JobSummary> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(JobSummary::completed());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => JobSummary::from_value(value),
        Err(_) => Ok(JobSummary(json!({ "output": tail(trimmed) }))),
    }
}

fn tail(text: &str) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
    }
}
