//! 内部诊断与指标
//!
//! 此模块提供了对 PostgreSQL sink 健康状况的可观测性：接收、丢弃、合并过滤的事件数，
//! 写入的行数与批次，以及失败的批次。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 内部诊断与指标数据结构。
///
/// 使用原子操作确保线程安全。
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// 创建时间
    start_time: Option<Instant>,

    /// 进入 sink 的事件数
    events_received: AtomicU64,

    /// 因队列已满而丢弃的事件数
    events_dropped_queue_full: AtomicU64,

    /// 低于最小级别而丢弃的事件数
    events_dropped_below_level: AtomicU64,

    /// 被关联合并过滤掉的事件数
    events_filtered: AtomicU64,

    /// 写入的行数
    rows_written: AtomicU64,

    /// 成功写入的批次数
    batches_written: AtomicU64,

    /// 失败的批次数
    batch_failures: AtomicU64,

    /// 执行的建模式语句数
    schema_creations: AtomicU64,

    /// 执行的建表语句数
    table_creations: AtomicU64,
}

/// 诊断数据的快照，用于外部查询。
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsSnapshot {
    pub uptime: Option<Duration>,
    pub events_received: u64,
    pub events_dropped_queue_full: u64,
    pub events_dropped_below_level: u64,
    pub events_filtered: u64,
    pub rows_written: u64,
    pub batches_written: u64,
    pub batch_failures: u64,
    pub schema_creations: u64,
    pub table_creations: u64,
    /// 总丢弃事件数（队列已满 + 低于级别）
    pub total_events_dropped: u64,
    /// 批次写入成功率（百分比）
    pub success_rate_percent: f64,
}

impl Default for DiagnosticsSnapshot {
    fn default() -> Self {
        Self {
            uptime: None,
            events_received: 0,
            events_dropped_queue_full: 0,
            events_dropped_below_level: 0,
            events_filtered: 0,
            rows_written: 0,
            batches_written: 0,
            batch_failures: 0,
            schema_creations: 0,
            table_creations: 0,
            total_events_dropped: 0,
            success_rate_percent: 100.0,
        }
    }
}

impl Diagnostics {
    /// 创建新的诊断实例。
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn increment_events_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_dropped_queue_full(&self) {
        self.events_dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_dropped_below_level(&self) {
        self.events_dropped_below_level.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录合并前后事件数量之差
    pub fn add_events_filtered(&self, count: u64) {
        self.events_filtered.fetch_add(count, Ordering::Relaxed);
    }

    /// 记录一个成功写入的批次
    pub fn record_batch_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batch_failures(&self) {
        self.batch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_schema_creations(&self) {
        self.schema_creations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_table_creations(&self) {
        self.table_creations.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取诊断数据的快照。
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let events_dropped_queue_full = self.events_dropped_queue_full.load(Ordering::Relaxed);
        let events_dropped_below_level = self.events_dropped_below_level.load(Ordering::Relaxed);
        let batches_written = self.batches_written.load(Ordering::Relaxed);
        let batch_failures = self.batch_failures.load(Ordering::Relaxed);

        let success_rate_percent = if batches_written + batch_failures > 0 {
            (batches_written as f64 / (batches_written + batch_failures) as f64) * 100.0
        } else {
            100.0
        };

        DiagnosticsSnapshot {
            uptime: self.start_time.map(|start| start.elapsed()),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped_queue_full,
            events_dropped_below_level,
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_written,
            batch_failures,
            schema_creations: self.schema_creations.load(Ordering::Relaxed),
            table_creations: self.table_creations.load(Ordering::Relaxed),
            total_events_dropped: events_dropped_queue_full + events_dropped_below_level,
            success_rate_percent,
        }
    }

    /// 重置所有计数器（主要用于测试）。
    pub fn reset(&self) {
        for counter in [
            &self.events_received,
            &self.events_dropped_queue_full,
            &self.events_dropped_below_level,
            &self.events_filtered,
            &self.rows_written,
            &self.batches_written,
            &self.batch_failures,
            &self.schema_creations,
            &self.table_creations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// 全局诊断实例
static GLOBAL_DIAGNOSTICS: std::sync::OnceLock<Arc<Diagnostics>> = std::sync::OnceLock::new();

/// 初始化（或取得）全局诊断实例。
pub fn init_diagnostics() -> Arc<Diagnostics> {
    GLOBAL_DIAGNOSTICS
        .get_or_init(|| Arc::new(Diagnostics::new()))
        .clone()
}

/// 获取全局诊断实例；尚未初始化时返回 None。
pub fn get_diagnostics_instance() -> Option<Arc<Diagnostics>> {
    GLOBAL_DIAGNOSTICS.get().cloned()
}

/// 获取诊断数据快照
///
/// 如果诊断系统尚未初始化，返回默认的快照。
///
/// # 示例
///
/// ```rust
/// use quantum_pg_sink::get_diagnostics;
///
/// let diagnostics = get_diagnostics();
/// println!("Rows written: {}", diagnostics.rows_written);
/// ```
pub fn get_diagnostics() -> DiagnosticsSnapshot {
    match GLOBAL_DIAGNOSTICS.get() {
        Some(diagnostics) => diagnostics.snapshot(),
        None => DiagnosticsSnapshot::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_diagnostics_creation() {
        let diagnostics = Diagnostics::new();
        let snapshot = diagnostics.snapshot();

        assert!(snapshot.uptime.is_some());
        assert_eq!(snapshot.events_received, 0);
        assert_eq!(snapshot.rows_written, 0);
        assert_eq!(snapshot.success_rate_percent, 100.0);
    }

    #[test]
    fn test_batch_accounting() {
        let diagnostics = Diagnostics::new();

        diagnostics.record_batch_written(30);
        diagnostics.record_batch_written(12);
        diagnostics.record_batch_written(8);
        diagnostics.increment_batch_failures();

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.rows_written, 50);
        assert_eq!(snapshot.batches_written, 3);
        assert_eq!(snapshot.batch_failures, 1);
        assert_eq!(snapshot.success_rate_percent, 75.0);
    }

    #[test]
    fn test_dropped_totals() {
        let diagnostics = Diagnostics::new();

        diagnostics.increment_events_dropped_queue_full();
        diagnostics.increment_events_dropped_below_level();
        diagnostics.increment_events_dropped_below_level();
        diagnostics.add_events_filtered(4);

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.total_events_dropped, 3);
        assert_eq!(snapshot.events_filtered, 4);
    }

    #[test]
    fn test_reset_functionality() {
        let diagnostics = Diagnostics::new();

        diagnostics.increment_events_received();
        diagnostics.increment_table_creations();
        diagnostics.reset();

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.events_received, 0);
        assert_eq!(snapshot.table_creations, 0);
    }

    #[test]
    fn test_concurrent_access() {
        let diagnostics = Arc::new(Diagnostics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let diagnostics_clone = diagnostics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    diagnostics_clone.increment_events_received();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(diagnostics.snapshot().events_received, 1000);
    }

    #[test]
    fn test_global_diagnostics_initialization() {
        let diagnostics1 = init_diagnostics();
        let diagnostics2 = init_diagnostics();

        assert!(Arc::ptr_eq(&diagnostics1, &diagnostics2));
        assert!(get_diagnostics().uptime.is_some());
    }

    #[test]
    fn test_edge_cases() {
        let diagnostics = Diagnostics::new();
        diagnostics.increment_batch_failures();
        assert_eq!(diagnostics.snapshot().success_rate_percent, 0.0);
    }
}
