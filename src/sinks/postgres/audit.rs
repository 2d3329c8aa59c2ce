//! 审计 PostgreSQL Sink
//!
//! 每个事件单独写入，写入完成后才返回；任何失败都返回给调用方。

use super::connection::Connector;
use super::helper::{SinkHelper, SinkOptions};
use crate::core::event::LogEvent;
use crate::diagnostics::{init_diagnostics, Diagnostics};
use crate::error::Result;
use crate::sinks::traits::{LogSink, SinkMetadata, SinkType};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 审计 Sink
pub struct AuditSink {
    options: Arc<SinkOptions>,
    diagnostics: Arc<Diagnostics>,
    helper: Mutex<SinkHelper>,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("options", &self.options)
            .finish()
    }
}

impl AuditSink {
    pub fn new(options: SinkOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::with_diagnostics(options, connector, init_diagnostics())
    }

    pub fn with_diagnostics(
        options: SinkOptions,
        connector: Arc<dyn Connector>,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let helper = SinkHelper::new(Arc::clone(&options), connector)
            .with_diagnostics(Arc::clone(&diagnostics));
        Ok(Self {
            options,
            diagnostics,
            helper: Mutex::new(helper),
        })
    }

    /// 写入单个事件，返回写入的行数
    ///
    /// 低于最小级别的事件不写入，返回 0。
    pub async fn emit(&self, event: LogEvent) -> Result<u64> {
        if event.level < self.options.min_level {
            self.diagnostics.increment_events_dropped_below_level();
            return Ok(0);
        }
        self.diagnostics.increment_events_received();

        let mut helper = self.helper.lock().await;
        match helper.emit(vec![event]).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.diagnostics.increment_batch_failures();
                Err(e)
            }
        }
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}

#[async_trait]
impl LogSink for AuditSink {
    async fn emit_event(&self, event: LogEvent) -> Result<()> {
        self.emit(event).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        // 没有缓冲的事件；等待进行中的写入结束
        let _guard = self.helper.lock().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres_audit"
    }

    fn metadata(&self) -> SinkMetadata {
        SinkMetadata::new("postgres_audit".to_string(), SinkType::Audit)
            .with_description(format!("PostgreSQL audit table {}", self.options.table_name))
    }
}
