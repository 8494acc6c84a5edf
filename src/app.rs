use std::sync::Arc;

use anyhow::{Context, Result};
use cronpool_core::AppConfig;
use cronpool_dispatcher::TaskScheduler;
use cronpool_infrastructure::{DatabaseManager, MetricsCollector, StoreHandles, TimeoutGuard};
use cronpool_worker::{TaskRegistry, WorkerService};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅推进调度时间
    Scheduler,
    /// 仅认领并执行任务
    Worker,
    /// 同一进程内运行调度器和 Worker
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: Arc<DatabaseManager>,
    handles: StoreHandles,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Application {
    /// 连接存储并执行迁移
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        info!("连接数据库: {}", mask_database_url(&config.database.url));

        let database = DatabaseManager::connect(&config.database)
            .await
            .context("连接数据库失败")?;
        let handles = database.store_handles();

        let metrics = config
            .observability
            .metrics_enabled
            .then(|| Arc::new(MetricsCollector::new()));

        Ok(Self {
            config,
            mode,
            database: Arc::new(database),
            handles,
            metrics,
        })
    }

    pub fn store_handles(&self) -> &StoreHandles {
        &self.handles
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行直到收到关闭信号; Worker 因存储不可用退出时返回错误
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let result = match self.mode {
            AppMode::Scheduler => self.run_scheduler(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::All => self.run_all_components(shutdown_rx).await,
        };

        self.database.close().await;
        result
    }

    async fn run_scheduler(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动调度器服务");

        let mut scheduler =
            TaskScheduler::new(self.handles.store.clone(), self.config.scheduler.clone())
                .with_admin(self.handles.admin.clone())
                .with_lease_ttl(self.config.worker.lease_ttl());
        if let Some(metrics) = &self.metrics {
            scheduler = scheduler.with_metrics(metrics.clone());
        }

        scheduler.run(shutdown_rx).await.context("调度器异常退出")?;

        info!("调度器服务已停止");
        Ok(())
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Worker服务: {}", self.config.worker.worker_id);

        let client = reqwest::Client::builder()
            .build()
            .context("创建HTTP客户端失败")?;
        let registry = TaskRegistry::from_config(
            &self.config.jobs,
            &self.config.timeouts,
            client,
            self.metrics.clone(),
        );
        if registry.is_empty() {
            warn!("没有注册任何作业，认领到的任务都会被挂起");
        }

        let mut builder = WorkerService::builder(
            self.handles.store.clone(),
            Arc::new(registry),
            self.config.worker.clone(),
        )
        .timeout_guard(TimeoutGuard::new(self.config.timeouts.clone()));
        if let Some(metrics) = &self.metrics {
            builder = builder.metrics(metrics.clone());
        }

        Arc::new(builder.build())
            .run(shutdown_rx)
            .await
            .context("Worker异常退出")?;

        info!("Worker服务已停止");
        Ok(())
    }

    async fn run_all_components(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动所有组件");

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();

        if self.config.scheduler.enabled {
            let app = self.clone_for_mode(AppMode::Scheduler);
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { app.run_scheduler(shutdown_rx).await }));
        }

        if self.config.worker.enabled {
            let app = self.clone_for_mode(AppMode::Worker);
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { app.run_worker(shutdown_rx).await }));
        }

        if handles.is_empty() {
            return Err(anyhow::anyhow!("调度器和Worker都被禁用，请检查配置"));
        }

        // 任一组件出错立即返回
        futures::future::try_join_all(handles.into_iter().map(|handle| async move {
            handle.await.context("组件任务异常结束")?
        }))
        .await?;

        info!("所有组件已停止");
        Ok(())
    }

    fn clone_for_mode(&self, mode: AppMode) -> Self {
        Self {
            config: self.config.clone(),
            mode,
            database: Arc::clone(&self.database),
            handles: self.handles.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// 屏蔽数据库URL中的密码
pub fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if !url[colon_pos + 1..].starts_with("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}
