//! Sink Traits
//!
//! 定义了统一的 Sink trait 接口。批量 sink 与审计 sink 都实现 [`LogSink`]，
//! 调用方可以用 trait 对象统一管理。
//!
//! # 使用示例
//!
//! ```rust
//! use quantum_pg_sink::sinks::traits::{LogSink, SinkMetadata, SinkType};
//! use quantum_pg_sink::core::event::LogEvent;
//! use quantum_pg_sink::Result;
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct CountingSink;
//!
//! #[async_trait]
//! impl LogSink for CountingSink {
//!     async fn emit_event(&self, event: LogEvent) -> Result<()> {
//!         println!("received {}", event.message_template.text());
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&self) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "counting"
//!     }
//!
//!     fn metadata(&self) -> SinkMetadata {
//!         SinkMetadata::new("counting".to_string(), SinkType::Batching)
//!     }
//! }
//! ```

use crate::core::event::LogEvent;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// 日志 Sink trait
#[async_trait]
pub trait LogSink: Send + Sync + Debug {
    /// 提交一个日志事件
    ///
    /// 批量 sink 只入队，不等待写入；审计 sink 写入完成后才返回。
    async fn emit_event(&self, event: LogEvent) -> Result<()>;

    /// 优雅关闭 sink
    ///
    /// 停止接收新事件，尽力写入剩余事件，然后释放资源。
    async fn shutdown(&self) -> Result<()>;

    /// 检查 sink 是否健康
    async fn is_healthy(&self) -> bool {
        true
    }

    /// 获取 sink 的名称
    fn name(&self) -> &'static str;

    /// 获取 sink 的统计信息
    fn stats(&self) -> String {
        format!("Sink: {}, Status: Healthy", self.name())
    }

    /// 获取 sink 的元数据
    fn metadata(&self) -> SinkMetadata;
}

/// Sink 类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkType {
    /// 异步批量写入，失败交给回调
    Batching,
    /// 同步逐条写入，失败返回给调用方
    Audit,
}

/// Sink 元数据
#[derive(Debug, Clone)]
pub struct SinkMetadata {
    /// Sink 名称
    pub name: String,
    /// Sink 类型
    pub sink_type: SinkType,
    /// 是否启用
    pub enabled: bool,
    /// 描述信息
    pub description: Option<String>,
}

impl SinkMetadata {
    /// 创建新的 sink 元数据
    pub fn new(name: String, sink_type: SinkType) -> Self {
        Self {
            name,
            sink_type,
            enabled: true,
            description: None,
        }
    }

    /// 设置描述信息
    pub fn with_description(mut self, description: String) -> Self {
        self.description = Some(description);
        self
    }

    /// 设置启用状态
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
