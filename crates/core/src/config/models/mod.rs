pub mod app_config;
pub mod database;
pub mod jobs;
pub mod observability;
pub mod scheduler_worker;
pub mod timeouts;

pub use app_config::*;
pub use database::*;
pub use jobs::*;
pub use observability::*;
pub use scheduler_worker::*;
pub use timeouts::*;
