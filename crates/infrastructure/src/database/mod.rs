pub mod manager;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabasePool, DatabaseType, StoreHandles};
pub use memory::InMemoryScheduleStore;
pub use postgres::PostgresScheduleStore;
pub use sqlite::SqliteScheduleStore;
