//! Error types for the PostgreSQL sink
//!
//! This module defines all error types used throughout the crate. Flush-time
//! database failures are recoverable and isolated per batch; configuration and
//! invariant failures are programming errors and surface immediately.

use thiserror::Error;

/// Main error type for sink operations
#[derive(Error, Debug)]
pub enum QuantumSinkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigFileMissing(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    /// I/O errors
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    /// TOML parsing errors
    #[error("TOML parsing error: {source}")]
    TomlError {
        #[from]
        source: toml::de::Error,
    },

    /// Database connection and statement errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// 违反内部不变量（例如向自增列求值）
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Sink 已关闭，不再接收事件
    #[error("Sink is closed")]
    SinkClosed,

    /// Channel communication errors
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// 停机等待刷新任务超时
    #[error("Shutdown timeout")]
    ShutdownTimeout,

    /// Background task errors
    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, QuantumSinkError>;

impl QuantumSinkError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new database error
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseError(msg.into())
    }

    /// Create a new invariant violation
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a new channel error
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::ChannelError(msg.into())
    }

    /// Create a new background task error
    pub fn background_task<S: Into<String>>(msg: S) -> Self {
        Self::BackgroundTaskError(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalError(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// 可恢复的错误只影响当前批次，后续批次照常写入。
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::IoError { .. } => true,
            Self::DatabaseError(_) => true,
            Self::ChannelError(_) => true,
            Self::BackgroundTaskError(_) => true,
            Self::InvariantViolation(_) => false,
            Self::SinkClosed => false,
            Self::ShutdownTimeout => false,
            _ => false,
        }
    }

    /// Get the error category for logging purposes
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigError(_) | Self::ConfigFileMissing(_) | Self::InvalidLogLevel(_) => {
                "config"
            }
            Self::IoError { .. } => "io",
            Self::SerializationError { .. } => "serialization",
            Self::TomlError { .. } => "toml",
            Self::DatabaseError(_) => "database",
            Self::InvariantViolation(_) => "invariant",
            Self::SinkClosed | Self::ShutdownTimeout => "shutdown",
            Self::ChannelError(_) => "channel",
            Self::BackgroundTaskError(_) => "background_task",
            Self::InternalError(_) => "internal",
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for QuantumSinkError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::DatabaseError(e.to_string())
    }
}
