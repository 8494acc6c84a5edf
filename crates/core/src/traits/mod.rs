pub mod job_function;
pub mod schedule_store;

pub use job_function::*;
pub use schedule_store::*;
