//! PostgreSQL Sink
//!
//! 列写入器、列注册表、建表语句、行写入、关联合并，以及批量与审计两种 sink。

pub mod audit;
pub mod column_writers;
pub mod columns;
pub mod connection;
pub mod helper;
pub mod merger;
pub mod row_writer;
pub mod sink;
pub mod table_creator;

pub use audit::AuditSink;
pub use column_writers::{ColumnKind, ColumnValue, ColumnWriter, PropertyWriteMethod, SqlType};
pub use columns::{ColumnKindName, ColumnOptions};
pub use connection::{Connector, RecordingConnector, StoreConnection};
pub use helper::{FailureCallback, SinkHelper, SinkOptions};
pub use merger::CorrelationOptions;
pub use row_writer::WriteStrategy;
pub use sink::PostgresSink;

#[cfg(feature = "postgres")]
pub use connection::PgConnector;
