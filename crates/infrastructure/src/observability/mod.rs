//! Observability module
//!
//! 指标采集以及可选的 Prometheus 导出器。日志初始化在二进制入口完成。

pub mod metrics_collector;

pub use metrics_collector::MetricsCollector;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

/// 安装 Prometheus 导出器, 在 `listen_address` 上提供 `/metrics`
///
/// 必须在 tokio 运行时内调用。
pub fn init_metrics(listen_address: &str) -> Result<()> {
    let address: SocketAddr = listen_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出器已启动: {}", address);
    Ok(())
}
