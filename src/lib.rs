//! quantum_pg_sink - 批量写入 PostgreSQL 的日志 Sink
//!
//! 日志事件先进入内存队列，由后台任务按批次大小或周期写入 PostgreSQL 表；
//! 列到事件数据的映射可配置，支持 COPY 二进制流和逐行 INSERT 两种写入方式。
//! 同一 span（关联键）内的手动记录事件在写入前合并为一条汇总记录。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use quantum_pg_sink::{init_with_config, shutdown, PostgresSinkConfig};
//! use tracing::{info, warn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostgresSinkConfig {
//!         connection_string: "host=localhost user=postgres dbname=logs".to_string(),
//!         table_name: "app_logs".to_string(),
//!         auto_create_table: true,
//!         ..Default::default()
//!     };
//!     init_with_config(config).await?;
//!
//!     info!(user = "alice", "Application started");
//!     warn!("This is a warning");
//!
//!     // 刷新剩余事件
//!     shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # 直接使用 Sink
//!
//! ```rust
//! use quantum_pg_sink::sinks::postgres::{PostgresSink, RecordingConnector, SinkOptions};
//! use quantum_pg_sink::{LogEvent, LogLevel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> quantum_pg_sink::Result<()> {
//!     let connector = RecordingConnector::new();
//!     let sink = PostgresSink::start(SinkOptions::new("host=unused", "logs"), Arc::new(connector.clone()))?;
//!
//!     sink.emit(LogEvent::new(LogLevel::Error, "disk full"))?;
//!     sink.shutdown().await?;
//!
//!     assert_eq!(connector.recorded().copies.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod diagnostics;
pub mod env_config;
pub mod error;
pub mod sinks;

// 重新导出主要类型
pub use config::{load_config_from_file, load_config_from_str, validate_config, PostgresSinkConfig};
pub use core::event::{ExceptionInfo, LogEvent, LogLevel, MessageTemplate};
pub use core::layer::PostgresLayer;
pub use core::value::{FormatProvider, PropertyValue, ScalarValue};
pub use diagnostics::{get_diagnostics, DiagnosticsSnapshot};
pub use error::{QuantumSinkError, Result};
pub use sinks::postgres::{AuditSink, ColumnOptions, ColumnWriter, PostgresSink, SinkOptions};
pub use sinks::traits::LogSink;

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 全局 sink 实例，供 `shutdown` 刷新
static GLOBAL_SINK: Lazy<Mutex<Option<PostgresSink>>> = Lazy::new(|| Mutex::new(None));

/// 确保全局订阅器只安装一次
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 使用配置初始化：连接 PostgreSQL，启动 sink 并安装全局 tracing 订阅器
///
/// 环境变量 `QUANTUM_PG_CONNECTION_STRING` 和 `QUANTUM_PG_SCHEMA` 优先于配置中的值。
#[cfg(feature = "postgres")]
pub async fn init_with_config(config: PostgresSinkConfig) -> Result<()> {
    let options = config.with_env_overrides().into_options()?;
    let connector = std::sync::Arc::new(sinks::postgres::PgConnector::new(
        options.connection_string.clone(),
    ));
    let sink = PostgresSink::start(options, connector)?;
    if let Err(e) = init_with_sink(sink.clone()) {
        // 没有安装成功，后台任务也一并停止
        let _ = sink.shutdown().await;
        return Err(e);
    }
    Ok(())
}

/// 从 TOML 文件加载配置并初始化
#[cfg(feature = "postgres")]
pub async fn init_from_file(path: &std::path::Path) -> Result<()> {
    init_with_config(load_config_from_file(path)?).await
}

/// 为已经启动的 sink 安装全局 tracing 订阅器
pub fn init_with_sink(sink: PostgresSink) -> Result<()> {
    if IS_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(QuantumSinkError::config("quantum_pg_sink has already been initialized"));
    }

    let subscriber = tracing_subscriber::registry().with(PostgresLayer::new(sink.clone()));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        IS_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(QuantumSinkError::internal(format!(
            "Failed to install global subscriber: {}",
            e
        )));
    }

    if let Ok(mut global) = GLOBAL_SINK.lock() {
        *global = Some(sink);
    }
    Ok(())
}

/// 优雅关闭：停止接收事件并写入剩余事件
///
/// 未初始化时直接返回。
pub async fn shutdown() -> Result<()> {
    let sink = match GLOBAL_SINK.lock() {
        Ok(mut global) => global.take(),
        Err(_) => None,
    };

    if let Some(sink) = sink {
        sink.shutdown().await?;
    }
    Ok(())
}

/// 是否已安装全局订阅器
pub fn is_initialized() -> bool {
    IS_INITIALIZED.load(Ordering::SeqCst)
}
