//! tracing 桥接层
//!
//! 把 `tracing` 事件转换为 [`LogEvent`] 并以非阻塞方式交给 [`PostgresSink`]。
//! 所在 span（从根到叶）的字段作为属性，事件自身字段覆盖同名的 span 字段。

use crate::core::event::{ExceptionInfo, LogEvent, LogLevel};
use crate::core::value::{PropertyValue, ScalarValue};
use crate::error::QuantumSinkError;
use crate::sinks::postgres::PostgresSink;
use std::collections::BTreeMap;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// 不转发这些目标下的事件，避免 sink 自身的日志回流
const IGNORED_TARGET_PREFIXES: &[&str] = &["quantum_pg_sink", "tokio_postgres"];

/// 保存在 span 扩展中的字段
#[derive(Debug, Clone, Default)]
struct SpanFields(BTreeMap<String, PropertyValue>);

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    exception: Option<ExceptionInfo>,
    properties: BTreeMap<String, PropertyValue>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: PropertyValue) {
        self.properties.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(text),
            "exception" | "error" => self.exception = Some(ExceptionInfo::new("Error", text)),
            _ => self.insert(field, PropertyValue::text(text)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "exception" | "error" => self.exception = Some(ExceptionInfo::new("Error", value)),
            _ => self.insert(field, PropertyValue::text(value)),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, PropertyValue::int(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, PropertyValue::Scalar(ScalarValue::UInt(value)));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, PropertyValue::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, PropertyValue::bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.exception = Some(ExceptionInfo::from_error(value));
        if !matches!(field.name(), "exception" | "error") {
            self.insert(field, PropertyValue::text(value.to_string()));
        }
    }
}

/// 把 tracing 事件写入 PostgreSQL sink 的层
#[derive(Debug, Clone)]
pub struct PostgresLayer {
    sink: PostgresSink,
}

impl PostgresLayer {
    pub fn new(sink: PostgresSink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &PostgresSink {
        &self.sink
    }

    fn is_ignored(target: &str) -> bool {
        IGNORED_TARGET_PREFIXES
            .iter()
            .any(|prefix| target.starts_with(prefix))
    }
}

impl<S> Layer<S> for PostgresLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut()
            .insert(SpanFields(visitor.properties));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(visitor.properties),
            None => extensions.insert(SpanFields(visitor.properties)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if Self::is_ignored(metadata.target()) {
            return;
        }

        let mut properties = BTreeMap::new();
        let mut root_span = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                root_span.get_or_insert_with(|| span.id().into_u64());
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    properties.extend(fields.0.clone());
                }
            }
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        properties.extend(visitor.properties);

        // 没有显式关联键时，用根 span 的 id 把同一请求内的事件归为一组
        let key = &self.sink.options().correlation.key_property;
        if let Some(root) = root_span {
            if !properties.contains_key(key) {
                properties.insert(key.clone(), PropertyValue::text(root.to_string()));
            }
        }

        let message = visitor.message.unwrap_or_default();
        let mut log_event = LogEvent::new(LogLevel::from(*metadata.level()), &message);
        log_event.properties = properties;
        log_event.exception = visitor.exception;

        match self.sink.emit(log_event) {
            Ok(()) | Err(QuantumSinkError::SinkClosed) => {}
            Err(e) => eprintln!("Failed to enqueue log event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::sinks::postgres::connection::RecordingConnector;
    use crate::sinks::postgres::helper::SinkOptions;
    use crate::sinks::postgres::merger::CorrelationOptions;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink(connector: &RecordingConnector) -> PostgresSink {
        let options = SinkOptions::new("c", "logs").with_correlation(CorrelationOptions {
            enabled: false,
            ..CorrelationOptions::default()
        });
        PostgresSink::start_with_diagnostics(
            options,
            Arc::new(connector.clone()),
            Arc::new(Diagnostics::new()),
        )
        .unwrap()
    }

    fn all_text(connector: &RecordingConnector) -> Vec<String> {
        connector
            .recorded()
            .copies
            .iter()
            .flat_map(|copy| copy.rows.iter().flatten())
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_events_and_span_fields_forwarded() {
        let connector = RecordingConnector::new();
        let sink = sink(&connector);
        let subscriber = tracing_subscriber::registry().with(PostgresLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("request", request_id = "r-42", attempt = 1);
            let _entered = span.enter();
            tracing::warn!(attempt = 2, "payment retried");
        });
        sink.shutdown().await.unwrap();

        let recorded = connector.recorded();
        assert_eq!(recorded.copies.len(), 1);
        assert_eq!(recorded.copies[0].rows.len(), 1);

        let texts = all_text(&connector);
        assert!(texts.iter().any(|t| t == "payment retried"));
        let properties = texts
            .iter()
            .find(|t| t.contains("request_id"))
            .expect("properties column");
        let json: serde_json::Value = serde_json::from_str(properties).unwrap();
        assert_eq!(json["request_id"], "r-42");
        // 事件字段覆盖 span 字段
        assert_eq!(json["attempt"], 2);
    }

    #[tokio::test]
    async fn test_span_id_used_as_correlation_key() {
        let connector = RecordingConnector::new();
        let sink = PostgresSink::start_with_diagnostics(
            SinkOptions::new("c", "logs"),
            Arc::new(connector.clone()),
            Arc::new(Diagnostics::new()),
        )
        .unwrap();
        let subscriber = tracing_subscriber::registry().with(PostgresLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("handle_order", ActionId = 7);
            let _entered = span.enter();
            tracing::info!(LoggedManually = true, ActionName = "PlaceOrder", "order placed");
            tracing::info!(LoggedManually = true, "order confirmed");
        });
        sink.shutdown().await.unwrap();

        let recorded = connector.recorded();
        assert_eq!(recorded.copies.len(), 1);
        assert_eq!(recorded.copies[0].rows.len(), 1);

        let texts = all_text(&connector);
        let properties = texts
            .iter()
            .find(|t| t.contains("ActionName"))
            .expect("properties column");
        let json: serde_json::Value = serde_json::from_str(properties).unwrap();
        assert_eq!(json["ActionName"], "PlaceOrder");
        assert!(json["SpanId"].is_string());
    }

    #[tokio::test]
    async fn test_explicit_correlation_key_kept() {
        let connector = RecordingConnector::new();
        let sink = PostgresSink::start_with_diagnostics(
            SinkOptions::new("c", "logs"),
            Arc::new(connector.clone()),
            Arc::new(Diagnostics::new()),
        )
        .unwrap();
        let subscriber = tracing_subscriber::registry().with(PostgresLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("handle_order", SpanId = "req-9");
            let _entered = span.enter();
            tracing::info!(LoggedManually = true, "order placed");
        });
        sink.shutdown().await.unwrap();

        let texts = all_text(&connector);
        let properties = texts
            .iter()
            .find(|t| t.contains("SpanId"))
            .expect("properties column");
        let json: serde_json::Value = serde_json::from_str(properties).unwrap();
        assert_eq!(json["SpanId"], "req-9");
    }

    #[tokio::test]
    async fn test_error_field_becomes_exception() {
        let connector = RecordingConnector::new();
        let sink = sink(&connector);
        let subscriber = tracing_subscriber::registry().with(PostgresLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(error = "connection reset", "upstream failed");
        });
        sink.shutdown().await.unwrap();

        let texts = all_text(&connector);
        assert!(texts.iter().any(|t| t.contains("connection reset")));
    }

    #[test]
    fn test_own_targets_ignored() {
        assert!(PostgresLayer::is_ignored("quantum_pg_sink::sinks::postgres::sink"));
        assert!(PostgresLayer::is_ignored("tokio_postgres::connection"));
        assert!(!PostgresLayer::is_ignored("my_app::handlers"));
    }
}
