//! 核心模块
//!
//! 日志事件模型、属性值以及 tracing 桥接层。

pub mod event;
pub mod layer;
pub mod value;

pub use event::{ExceptionInfo, LogEvent, LogLevel, MessageTemplate, TemplateToken};
pub use layer::PostgresLayer;
pub use value::{FormatProvider, PropertyValue, ScalarValue};
