//! Sinks 模块
//!
//! 统一的 [`traits::LogSink`] 接口与 PostgreSQL 实现。

pub mod postgres;
pub mod traits;

pub use postgres::{AuditSink, PostgresSink};
pub use traits::{LogSink, SinkMetadata, SinkType};
