//! Worker 进程
//!
//! 从共享存储认领到期任务, 在超时守卫下执行对应的作业函数, 然后释放租约。

pub mod executors;
pub mod parallel_executor;
pub mod pipeline;
pub mod registry;
pub mod service;

pub use executors::{CommandJob, FnJob, HttpJob, MisconfiguredJob};
pub use parallel_executor::{JobConfig, JobResult, ParallelJobExecutor};
pub use pipeline::PipelineJob;
pub use registry::{RegisteredJob, TaskRegistry, TaskRegistryBuilder};
pub use service::{run_job_locally, IterationReport, PollResult, WorkerService, WorkerServiceBuilder};
