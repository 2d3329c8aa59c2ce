//! Sink 选项与单次刷新流程
//!
//! [`SinkHelper`] 执行一次完整的刷新：关联合并、按需建模式与建表、写入行。
//! 建模式/建表标志只由唯一的刷新路径修改。

use super::columns::ColumnOptions;
use super::connection::{Connector, StoreConnection};
use super::merger::{merge_batch, CorrelationOptions};
use super::row_writer::{write_events, WriteStrategy};
use super::table_creator::{create_schema_query, create_table_query};
use crate::core::event::{LogEvent, LogLevel};
use crate::core::value::FormatProvider;
use crate::diagnostics::{init_diagnostics, Diagnostics};
use crate::error::{QuantumSinkError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 批次写入失败时的回调
pub type FailureCallback = Arc<dyn Fn(&QuantumSinkError) + Send + Sync>;

/// 默认批次大小
pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 30;

/// 默认刷新周期
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

/// Sink 选项，构造后不再修改
#[derive(Clone)]
pub struct SinkOptions {
    pub connection_string: String,
    pub schema_name: String,
    pub table_name: String,
    pub columns: ColumnOptions,
    pub batch_size_limit: usize,
    /// `None` 表示队列无上限
    pub queue_limit: Option<usize>,
    pub period: Duration,
    pub format_provider: FormatProvider,
    pub use_copy: bool,
    pub need_auto_create_schema: bool,
    pub need_auto_create_table: bool,
    pub min_level: LogLevel,
    pub correlation: CorrelationOptions,
    pub failure_callback: Option<FailureCallback>,
}

impl SinkOptions {
    /// 使用默认值创建；模式名和表名中的双引号被移除
    pub fn new<C: Into<String>, T: AsRef<str>>(connection_string: C, table_name: T) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema_name: String::new(),
            table_name: table_name.as_ref().replace('"', ""),
            columns: ColumnOptions::default_columns(),
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            queue_limit: None,
            period: DEFAULT_PERIOD,
            format_provider: FormatProvider::default(),
            use_copy: true,
            need_auto_create_schema: false,
            need_auto_create_table: false,
            min_level: LogLevel::Verbose,
            correlation: CorrelationOptions::default(),
            failure_callback: None,
        }
    }

    pub fn with_schema<S: AsRef<str>>(mut self, schema_name: S) -> Self {
        self.schema_name = schema_name.as_ref().replace('"', "");
        self
    }

    pub fn with_columns(mut self, columns: ColumnOptions) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_batch_size_limit(mut self, batch_size_limit: usize) -> Self {
        self.batch_size_limit = batch_size_limit;
        self
    }

    pub fn with_queue_limit(mut self, queue_limit: Option<usize>) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_format_provider(mut self, format_provider: FormatProvider) -> Self {
        self.format_provider = format_provider;
        self
    }

    pub fn with_use_copy(mut self, use_copy: bool) -> Self {
        self.use_copy = use_copy;
        self
    }

    pub fn with_auto_create(mut self, schema: bool, table: bool) -> Self {
        self.need_auto_create_schema = schema;
        self.need_auto_create_table = table;
        self
    }

    pub fn with_min_level(mut self, min_level: LogLevel) -> Self {
        self.min_level = min_level;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationOptions) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_failure_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QuantumSinkError) + Send + Sync + 'static,
    {
        self.failure_callback = Some(Arc::new(callback));
        self
    }

    /// 写入方式
    pub fn strategy(&self) -> WriteStrategy {
        if self.use_copy {
            WriteStrategy::Copy
        } else {
            WriteStrategy::Insert
        }
    }

    /// 检查必填项
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(QuantumSinkError::config("connection string must not be empty"));
        }
        if self.table_name.trim().is_empty() {
            return Err(QuantumSinkError::config("table name must not be empty"));
        }
        if self.columns.is_empty() {
            return Err(QuantumSinkError::config("at least one column is required"));
        }
        if self.columns.columns_for_insert().is_empty() {
            return Err(QuantumSinkError::config(
                "at least one column must be written on insert",
            ));
        }
        if self.batch_size_limit == 0 {
            return Err(QuantumSinkError::config("batch size limit must be greater than 0"));
        }
        if self.queue_limit == Some(0) {
            return Err(QuantumSinkError::config("queue limit must be greater than 0"));
        }
        if self.period.is_zero() {
            return Err(QuantumSinkError::config("period must be greater than 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for SinkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkOptions")
            .field("connection_string", &"[REDACTED]")
            .field("schema_name", &self.schema_name)
            .field("table_name", &self.table_name)
            .field("columns", &self.columns.len())
            .field("batch_size_limit", &self.batch_size_limit)
            .field("queue_limit", &self.queue_limit)
            .field("period", &self.period)
            .field("use_copy", &self.use_copy)
            .field("need_auto_create_schema", &self.need_auto_create_schema)
            .field("need_auto_create_table", &self.need_auto_create_table)
            .field("min_level", &self.min_level)
            .field("correlation", &self.correlation)
            .field("failure_callback", &self.failure_callback.is_some())
            .finish()
    }
}

/// 单次刷新的执行者
pub struct SinkHelper {
    options: Arc<SinkOptions>,
    connector: Arc<dyn Connector>,
    diagnostics: Arc<Diagnostics>,
    is_schema_created: bool,
    is_table_created: bool,
}

impl SinkHelper {
    pub fn new(options: Arc<SinkOptions>, connector: Arc<dyn Connector>) -> Self {
        let is_schema_created = !options.need_auto_create_schema;
        let is_table_created = !options.need_auto_create_table;
        Self {
            options,
            connector,
            diagnostics: init_diagnostics(),
            is_schema_created,
            is_table_created,
        }
    }

    /// 使用独立的诊断实例
    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn is_schema_created(&self) -> bool {
        self.is_schema_created
    }

    pub fn is_table_created(&self) -> bool {
        self.is_table_created
    }

    /// 合并并写入一批事件，返回写入的行数
    ///
    /// 合并后为空时不打开连接。
    pub async fn emit(&mut self, events: Vec<LogEvent>) -> Result<u64> {
        let received = events.len();
        let merged = merge_batch(events, &self.options.correlation);
        self.diagnostics
            .add_events_filtered(received.saturating_sub(merged.len()) as u64);
        if merged.is_empty() {
            debug!(received, "合并后没有需要写入的事件");
            return Ok(0);
        }

        let mut connection = self.connector.connect().await?;
        let result = self.write(connection.as_mut(), &merged).await;
        let closed = connection.close().await;

        let written = result?;
        if let Err(e) = closed {
            warn!("关闭数据库连接失败: {}", e);
        }
        self.diagnostics.record_batch_written(written);
        debug!(rows = written, "批次写入完成");
        Ok(written)
    }

    async fn write(&mut self, connection: &mut dyn StoreConnection, events: &[LogEvent]) -> Result<u64> {
        let options = Arc::clone(&self.options);

        if !self.is_schema_created && !options.schema_name.trim().is_empty() {
            connection.execute(&create_schema_query(&options.schema_name)).await?;
            self.is_schema_created = true;
            self.diagnostics.increment_schema_creations();
            info!(schema = %options.schema_name, "已确保模式存在");
        }

        if !self.is_table_created {
            let sql = create_table_query(
                &options.schema_name,
                &options.table_name,
                options.columns.columns_for_create(),
            );
            connection.execute(&sql).await?;
            self.is_table_created = true;
            self.diagnostics.increment_table_creations();
            info!(table = %options.table_name, "已确保表存在");
        }

        write_events(
            connection,
            options.strategy(),
            &options.schema_name,
            &options.table_name,
            &options.columns,
            events,
            &options.format_provider,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::postgres::connection::RecordingConnector;

    fn helper(options: SinkOptions, connector: &RecordingConnector) -> SinkHelper {
        SinkHelper::new(Arc::new(options), Arc::new(connector.clone()))
            .with_diagnostics(Arc::new(Diagnostics::new()))
    }

    fn manual_event(span: &str) -> LogEvent {
        LogEvent::new(LogLevel::Information, "manual entry")
            .with_property("SpanId", span)
            .with_property("LoggedManually", true)
    }

    #[test]
    fn test_options_defaults_and_quotes() {
        let options = SinkOptions::new("host=localhost", "my\"logs").with_schema("\"audit\"");
        assert_eq!(options.table_name, "mylogs");
        assert_eq!(options.schema_name, "audit");
        assert_eq!(options.batch_size_limit, 30);
        assert_eq!(options.queue_limit, None);
        assert_eq!(options.period, Duration::from_secs(5));
        assert!(options.use_copy);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        assert!(SinkOptions::new("", "t").validate().is_err());
        assert!(SinkOptions::new("c", " ").validate().is_err());
        assert!(SinkOptions::new("c", "t").with_batch_size_limit(0).validate().is_err());
        assert!(SinkOptions::new("c", "t").with_queue_limit(Some(0)).validate().is_err());
        assert!(SinkOptions::new("c", "t").with_period(Duration::ZERO).validate().is_err());
        assert!(SinkOptions::new("c", "t")
            .with_columns(ColumnOptions::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_options_debug_redacts_connection_string() {
        let options = SinkOptions::new("postgres://user:secret@db/logs", "t");
        let debug = format!("{:?}", options);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_empty_merge_result_opens_no_connection() {
        let connector = RecordingConnector::new();
        let mut helper = helper(SinkOptions::new("c", "t"), &connector);
        let written = helper
            .emit(vec![LogEvent::new(LogLevel::Information, "noise")])
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(connector.recorded().connects, 0);
    }

    #[tokio::test]
    async fn test_schema_and_table_created_once() {
        let connector = RecordingConnector::new();
        let options = SinkOptions::new("c", "events")
            .with_schema("logs")
            .with_auto_create(true, true);
        let mut helper = helper(options, &connector);
        assert!(!helper.is_schema_created());

        helper.emit(vec![manual_event("a")]).await.unwrap();
        helper.emit(vec![manual_event("b")]).await.unwrap();

        let recorded = connector.recorded();
        assert_eq!(recorded.statements.len(), 2);
        assert_eq!(recorded.statements[0], "CREATE SCHEMA IF NOT EXISTS \"logs\";");
        assert!(recorded.statements[1].starts_with("CREATE TABLE IF NOT EXISTS \"logs\".\"events\""));
        assert_eq!(recorded.copies.len(), 2);
        assert_eq!(recorded.connects, 2);
        assert_eq!(recorded.closes, 2);
        assert!(helper.is_schema_created() && helper.is_table_created());
        assert_eq!(helper.diagnostics().snapshot().batches_written, 2);
    }

    #[tokio::test]
    async fn test_auto_create_disabled_skips_ddl() {
        let connector = RecordingConnector::new();
        let mut helper = helper(SinkOptions::new("c", "events").with_schema("logs"), &connector);
        helper.emit(vec![manual_event("a")]).await.unwrap();
        assert!(connector.recorded().statements.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_still_closes_connection() {
        let connector = RecordingConnector::new();
        connector.fail_writes(Some("connection reset"));
        let mut helper = helper(SinkOptions::new("c", "t").with_auto_create(false, true), &connector);

        let err = helper.emit(vec![manual_event("a")]).await.unwrap_err();
        assert!(matches!(err, QuantumSinkError::DatabaseError(_)));
        assert!(!helper.is_table_created());
        assert_eq!(connector.recorded().closes, 1);

        connector.fail_writes(None);
        helper.emit(vec![manual_event("a")]).await.unwrap();
        assert!(helper.is_table_created());
    }

    #[tokio::test]
    async fn test_insert_strategy_used_when_copy_disabled() {
        let connector = RecordingConnector::new();
        let mut helper = helper(SinkOptions::new("c", "t").with_use_copy(false), &connector);
        let written = helper
            .emit(vec![manual_event("a"), manual_event("b")])
            .await
            .unwrap();
        assert_eq!(written, 2);
        let recorded = connector.recorded();
        assert!(recorded.copies.is_empty());
        assert_eq!(recorded.inserts.len(), 2);
    }
}
