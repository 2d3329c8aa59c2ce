//! 批量 PostgreSQL Sink
//!
//! 调用方把事件放入内存队列后立即返回；唯一的后台任务在批次满或周期到达时刷新，
//! 同一时刻最多只有一个批次在写入。写入失败交给失败回调，不会传回调用方。

use super::connection::Connector;
use super::helper::{SinkHelper, SinkOptions};
use crate::core::event::LogEvent;
use crate::diagnostics::{init_diagnostics, Diagnostics};
use crate::error::{QuantumSinkError, Result};
use crate::sinks::traits::{LogSink, SinkMetadata, SinkType};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 停机时等待后台任务的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

enum QueueSender {
    Bounded(mpsc::Sender<LogEvent>),
    Unbounded(mpsc::UnboundedSender<LogEvent>),
}

impl QueueSender {
    fn try_send(&self, event: LogEvent) -> std::result::Result<(), TrySendError<LogEvent>> {
        match self {
            QueueSender::Bounded(sender) => sender.try_send(event),
            QueueSender::Unbounded(sender) => sender
                .send(event)
                .map_err(|e| TrySendError::Closed(e.0)),
        }
    }
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<LogEvent>),
    Unbounded(mpsc::UnboundedReceiver<LogEvent>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<LogEvent> {
        match self {
            QueueReceiver::Bounded(receiver) => receiver.recv().await,
            QueueReceiver::Unbounded(receiver) => receiver.recv().await,
        }
    }
}

fn queue(limit: Option<usize>) -> (QueueSender, QueueReceiver) {
    match limit {
        Some(limit) => {
            let (sender, receiver) = mpsc::channel(limit);
            (QueueSender::Bounded(sender), QueueReceiver::Bounded(receiver))
        }
        None => {
            let (sender, receiver) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(sender), QueueReceiver::Unbounded(receiver))
        }
    }
}

/// 待写入的事件批次
#[derive(Debug)]
struct LogBatch {
    events: Vec<LogEvent>,
    max_size: usize,
}

impl LogBatch {
    fn new(max_size: usize) -> Self {
        Self {
            events: Vec::with_capacity(max_size),
            max_size,
        }
    }

    fn add_event(&mut self, event: LogEvent) {
        self.events.push(event);
    }

    fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 取出全部事件并清空批次
    fn take(&mut self) -> Vec<LogEvent> {
        std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size))
    }
}

struct PostgresSinkInner {
    sender: RwLock<Option<QueueSender>>,
    processor_handle: Mutex<Option<JoinHandle<()>>>,
}

/// 批量 PostgreSQL Sink
#[derive(Clone)]
pub struct PostgresSink {
    options: Arc<SinkOptions>,
    diagnostics: Arc<Diagnostics>,
    inner: Arc<PostgresSinkInner>,
}

impl std::fmt::Debug for PostgresSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSink")
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PostgresSink {
    /// 校验选项并启动后台刷新任务
    ///
    /// 必须在 tokio 运行时中调用。
    pub fn start(options: SinkOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::start_with_diagnostics(options, connector, init_diagnostics())
    }

    /// 使用指定的诊断实例启动
    pub fn start_with_diagnostics(
        options: SinkOptions,
        connector: Arc<dyn Connector>,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let (sender, receiver) = queue(options.queue_limit);

        let helper = SinkHelper::new(Arc::clone(&options), connector)
            .with_diagnostics(Arc::clone(&diagnostics));
        let processor = BatchProcessor {
            helper,
            options: Arc::clone(&options),
            diagnostics: Arc::clone(&diagnostics),
        };
        let handle = tokio::spawn(processor.run(receiver));

        info!(
            table = %options.table_name,
            batch_size = options.batch_size_limit,
            period_ms = options.period.as_millis() as u64,
            "PostgreSQL Sink 已启动"
        );

        Ok(Self {
            options,
            diagnostics,
            inner: Arc::new(PostgresSinkInner {
                sender: RwLock::new(Some(sender)),
                processor_handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// 非阻塞地提交事件
    ///
    /// 低于最小级别的事件和队列已满时的事件被丢弃并计数；sink 关闭后返回 `SinkClosed`，
    /// 后台任务意外退出时返回 `ChannelError`。
    pub fn emit(&self, event: LogEvent) -> Result<()> {
        if event.level < self.options.min_level {
            self.diagnostics.increment_events_dropped_below_level();
            return Ok(());
        }

        let guard = self
            .inner
            .sender
            .read()
            .map_err(|_| QuantumSinkError::internal("sender lock poisoned"))?;
        let sender = guard.as_ref().ok_or(QuantumSinkError::SinkClosed)?;

        self.diagnostics.increment_events_received();
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.diagnostics.increment_events_dropped_queue_full();
                debug!("队列已满，丢弃日志事件");
                Ok(())
            }
            // 未调用 shutdown 但后台任务已经退出
            Err(TrySendError::Closed(_)) => Err(QuantumSinkError::channel(
                "flush task is no longer receiving events",
            )),
        }
    }

    /// 是否仍在接收事件
    pub fn is_running(&self) -> bool {
        self.inner
            .sender
            .read()
            .map(|sender| sender.is_some())
            .unwrap_or(false)
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// 停止接收事件，刷新剩余事件，等待后台任务结束
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut sender = self
                .inner
                .sender
                .write()
                .map_err(|_| QuantumSinkError::internal("sender lock poisoned"))?;
            // 关闭通道，后台任务刷新最后一批后退出
            drop(sender.take());
        }

        let handle = self.inner.processor_handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("PostgreSQL Sink 后台任务异常退出: {}", e);
                    return Err(QuantumSinkError::background_task(e.to_string()));
                }
                Err(_) => {
                    warn!("PostgreSQL Sink 停机超时");
                    return Err(QuantumSinkError::ShutdownTimeout);
                }
            }
        }

        info!("PostgreSQL Sink 已关闭");
        Ok(())
    }
}

#[async_trait]
impl LogSink for PostgresSink {
    async fn emit_event(&self, event: LogEvent) -> Result<()> {
        self.emit(event)
    }

    async fn shutdown(&self) -> Result<()> {
        PostgresSink::shutdown(self).await
    }

    async fn is_healthy(&self) -> bool {
        self.is_running()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn stats(&self) -> String {
        let snapshot = self.diagnostics.snapshot();
        format!(
            "PostgresSink[{}]: {} rows, {} batches, {} failed",
            self.options.table_name,
            snapshot.rows_written,
            snapshot.batches_written,
            snapshot.batch_failures
        )
    }

    fn metadata(&self) -> SinkMetadata {
        SinkMetadata::new("postgres".to_string(), SinkType::Batching)
            .with_description(format!("PostgreSQL table {}", self.options.table_name))
    }
}

/// 后台刷新任务
struct BatchProcessor {
    helper: SinkHelper,
    options: Arc<SinkOptions>,
    diagnostics: Arc<Diagnostics>,
}

impl BatchProcessor {
    async fn run(mut self, mut receiver: QueueReceiver) {
        let period = self.options.period;
        let mut flush_interval = interval_at(Instant::now() + period, period);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = LogBatch::new(self.options.batch_size_limit);

        debug!("PostgreSQL Sink 刷新任务已启动");

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(log_event) => {
                            batch.add_event(log_event);
                            if batch.is_full() {
                                self.flush(&mut batch).await;
                                flush_interval.reset();
                            }
                        }
                        None => {
                            debug!("日志事件通道已关闭");
                            if !batch.is_empty() {
                                self.flush(&mut batch).await;
                            }
                            break;
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                        flush_interval.reset();
                    }
                }
            }
        }

        debug!("PostgreSQL Sink 刷新任务已停止");
    }

    async fn flush(&mut self, batch: &mut LogBatch) {
        let events = batch.take();
        let count = events.len();
        if let Err(e) = self.helper.emit(events).await {
            self.diagnostics.increment_batch_failures();
            error!(
                events = count,
                category = e.category(),
                "写入 PostgreSQL 批次失败: {}",
                e
            );
            if let Some(callback) = &self.options.failure_callback {
                callback(&e);
            }
        }
    }
}
