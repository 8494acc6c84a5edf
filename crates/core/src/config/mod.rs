//! 配置管理
//!
//! 加载顺序: 内置默认值 → TOML 配置文件 → 环境变量 (`CRONPOOL__SECTION__KEY`)。
//! 每个配置段都有自己的 `validate`, [`AppConfig::validate`] 负责汇总。

pub mod models;

pub use models::*;
