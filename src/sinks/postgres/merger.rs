//! 关联日志合并
//!
//! 按关联键（默认 `SpanId`）对一批事件分组，把同一次操作中手动记录的日志
//! 与自动产生的日志合并成一条富化的事件。合并是无状态的纯函数，每次刷新独立执行。
//!
//! 规则：
//! - 先过滤：保留 Error 及以上的事件，或者带关联键且（带动作 ID 或被标记为手动记录）的事件。
//! - 组内没有手动记录的事件时，只原样保留 Error 及以上的事件；否则整组合成一条事件。
//! - 没有关联键的 Error 事件原样保留。

use crate::core::event::{LogEvent, LogLevel, MessageTemplate, TemplateToken};
use crate::core::value::PropertyValue;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

const REQUEST_PROPERTY: &str = "Request";
const ACCOUNT_IDENTIFIER: &str = "AccountIdentifier";
const IGNORED_COMMAND_NAME: &str = "EventCommand";

/// 关联合并设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationOptions {
    /// 为 false 时批次原样写入
    pub enabled: bool,
    /// 关联键属性名
    pub key_property: String,
    /// 动作 ID 属性名
    pub action_id_property: String,
    /// 手动记录标记属性名
    pub manual_marker_property: String,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            key_property: "SpanId".to_string(),
            action_id_property: "ActionId".to_string(),
            manual_marker_property: "LoggedManually".to_string(),
        }
    }
}

impl CorrelationOptions {
    /// 标记属性存在且为真
    pub fn is_manual(&self, event: &LogEvent) -> bool {
        event
            .property(&self.manual_marker_property)
            .map_or(false, PropertyValue::is_truthy)
    }

    fn key_of(&self, event: &LogEvent) -> Option<String> {
        event.property(&self.key_property).map(PropertyValue::as_text)
    }
}

/// 过滤并合并一个批次
pub fn merge_batch(events: Vec<LogEvent>, options: &CorrelationOptions) -> Vec<LogEvent> {
    if !options.enabled {
        return events;
    }
    let received = events.len();
    let merged = merge_events(filter_events(events, options), options);
    debug!(received, merged = merged.len(), "关联合并完成");
    merged
}

/// 丢弃与关联无关的事件
pub fn filter_events(events: Vec<LogEvent>, options: &CorrelationOptions) -> Vec<LogEvent> {
    events
        .into_iter()
        .filter(|event| {
            event.level.is_error_or_above()
                || (event.properties.contains_key(&options.key_property)
                    && (event.properties.contains_key(&options.action_id_property)
                        || options.is_manual(event)))
        })
        .collect()
}

enum Slot {
    Passthrough(LogEvent),
    Group(usize),
}

/// 分组并合成，输出顺序为各组首次出现的顺序
pub fn merge_events(events: Vec<LogEvent>, options: &CorrelationOptions) -> Vec<LogEvent> {
    let mut slots = Vec::new();
    let mut keys: Vec<String> = Vec::new();
    let mut groups: Vec<Vec<LogEvent>> = Vec::new();

    for event in events {
        match options.key_of(&event) {
            None => slots.push(Slot::Passthrough(event)),
            Some(key) => match keys.iter().position(|existing| *existing == key) {
                Some(index) => groups[index].push(event),
                None => {
                    keys.push(key);
                    groups.push(vec![event]);
                    slots.push(Slot::Group(groups.len() - 1));
                }
            },
        }
    }

    let mut merged = Vec::new();
    for slot in slots {
        match slot {
            Slot::Passthrough(event) => merged.push(event),
            Slot::Group(index) => {
                let group = std::mem::take(&mut groups[index]);
                merged.extend(merge_group(&keys[index], group, options));
            }
        }
    }
    merged
}

fn merge_group(key: &str, events: Vec<LogEvent>, options: &CorrelationOptions) -> Vec<LogEvent> {
    if !events.iter().any(|event| options.is_manual(event)) {
        return events
            .into_iter()
            .filter(|event| event.level.is_error_or_above())
            .collect();
    }
    vec![synthesize(key, &events, options)]
}

/// Request 结构体展开后的字段，路径用 `.` 连接，先出现者优先
#[derive(Debug, Default)]
struct RequestFields(Vec<(String, String)>);

impl RequestFields {
    fn collect(events: &[&LogEvent]) -> Self {
        let mut fields = RequestFields::default();
        for event in events {
            if let Some(request) = event.property(REQUEST_PROPERTY) {
                if request.as_structure().is_some() {
                    fields.flatten("", request);
                }
            }
        }
        fields
    }

    fn flatten(&mut self, prefix: &str, value: &PropertyValue) {
        match value.as_structure() {
            Some(properties) => {
                for (name, child) in properties {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", prefix, name)
                    };
                    self.flatten(&path, child);
                }
            }
            None => {
                if is_blank(value) || self.0.iter().any(|(path, _)| path == prefix) {
                    return;
                }
                self.0.push((prefix.to_string(), value.as_text()));
            }
        }
    }

    /// 按字段名或路径末段查找
    fn lookup(&self, names: &[&str]) -> Option<PropertyValue> {
        names.iter().find_map(|name| {
            let suffix = format!(".{}", name);
            self.0
                .iter()
                .find(|(path, _)| path == name || path.ends_with(&suffix))
                .map(|(_, value)| PropertyValue::text(value.clone()))
        })
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_blank(value: &PropertyValue) -> bool {
    match value {
        PropertyValue::Scalar(crate::core::value::ScalarValue::Null) => true,
        other => other.as_text().is_empty(),
    }
}

/// 按名称优先、事件次序其次查找第一个非空属性
fn from_events(events: &[&LogEvent], names: &[&str]) -> Option<PropertyValue> {
    names.iter().find_map(|name| {
        events
            .iter()
            .filter_map(|event| event.property(name))
            .find(|value| !is_blank(value))
            .cloned()
    })
}

/// Request.AccountIdentifier 下的字段
fn account_field(events: &[&LogEvent], name: &str) -> Option<PropertyValue> {
    events.iter().find_map(|event| {
        event
            .property(REQUEST_PROPERTY)?
            .field(ACCOUNT_IDENTIFIER)?
            .field(name)
            .filter(|value| !is_blank(value))
            .map(|value| PropertyValue::text(value.as_text()))
    })
}

/// 自动日志的 `Name` 属性，去掉引号并忽略通用命令名
fn command_name(events: &[&LogEvent]) -> Option<PropertyValue> {
    events
        .iter()
        .filter_map(|event| event.property("Name"))
        .map(|value| value.as_text().replace('"', ""))
        .find(|name| !name.is_empty() && name != IGNORED_COMMAND_NAME)
        .map(PropertyValue::text)
}

/// 用属性值替换模板中的占位符
fn substituted_message(event: &LogEvent) -> String {
    event
        .message_template
        .tokens()
        .iter()
        .map(|token| match token {
            TemplateToken::Text(text) => text.clone(),
            TemplateToken::Property { name, raw, .. } => event
                .property(name)
                .map(PropertyValue::as_text)
                .unwrap_or_else(|| raw.clone()),
        })
        .collect()
}

fn put(properties: &mut BTreeMap<String, PropertyValue>, name: &str, value: Option<PropertyValue>) {
    if let Some(value) = value {
        properties.insert(name.to_string(), value);
    }
}

fn synthesize(key: &str, events: &[LogEvent], options: &CorrelationOptions) -> LogEvent {
    let (manual, automatic): (Vec<&LogEvent>, Vec<&LogEvent>) =
        events.iter().partition(|event| options.is_manual(event));
    let scan: Vec<&LogEvent> = automatic.iter().chain(manual.iter()).copied().collect();

    let level = events
        .iter()
        .map(|event| event.level)
        .max()
        .unwrap_or(LogLevel::Information);
    let timestamp = events
        .iter()
        .map(|event| event.timestamp)
        .min()
        .unwrap_or_else(|| Utc::now().fixed_offset());
    let error_bearing = level.is_error_or_above();

    let exception = if error_bearing {
        let mut candidates: Vec<&LogEvent> = events
            .iter()
            .filter(|event| event.level.is_error_or_above() && event.exception.is_some())
            .collect();
        candidates.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        candidates.first().and_then(|event| event.exception.clone())
    } else {
        None
    };

    let fallback = if error_bearing {
        RequestFields::collect(&scan)
    } else {
        RequestFields::default()
    };

    let mut tokens = Vec::new();
    for event in &manual {
        tokens.push(TemplateToken::Text(substituted_message(event)));
        tokens.push(TemplateToken::Text("\n".to_string()));
    }
    if error_bearing {
        for event in automatic.iter().filter(|event| event.level.is_error_or_above()) {
            tokens.extend(event.message_template.tokens().iter().cloned());
            tokens.push(TemplateToken::Text("\n".to_string()));
        }
        if !fallback.is_empty() {
            tokens.push(TemplateToken::Text("Request:\n".to_string()));
            for (path, value) in &fallback.0 {
                tokens.push(TemplateToken::Text(format!("{}: {}\n", path, value)));
            }
        }
    }

    let mut properties = BTreeMap::new();
    let key_value = manual
        .first()
        .and_then(|event| event.property(&options.key_property))
        .cloned()
        .unwrap_or_else(|| PropertyValue::text(key));
    properties.insert(options.key_property.clone(), key_value);
    properties.insert(
        options.manual_marker_property.clone(),
        PropertyValue::bool(true),
    );

    let action_id = options.action_id_property.as_str();
    put(
        &mut properties,
        "ActionName",
        from_events(&manual, &["ActionName"])
            .or_else(|| from_events(&automatic, &["ActionName"]))
            .or_else(|| fallback.lookup(&["ActionName"])),
    );
    put(
        &mut properties,
        action_id,
        from_events(&manual, &[action_id])
            .or_else(|| from_events(&automatic, &[action_id]))
            .or_else(|| fallback.lookup(&[action_id])),
    );

    let whitelabel_names = ["WhitelabelCompanyUid", "WhitelabelUid"];
    put(
        &mut properties,
        "WhitelabelUid",
        from_events(&manual, &whitelabel_names)
            .or_else(|| account_field(&scan, "WhitelabelCompanyUid"))
            .or_else(|| from_events(&automatic, &whitelabel_names))
            .or_else(|| fallback.lookup(&whitelabel_names)),
    );
    for name in ["ClientUid", "AccountUid"] {
        put(
            &mut properties,
            name,
            from_events(&manual, &[name])
                .or_else(|| account_field(&scan, name))
                .or_else(|| from_events(&automatic, &[name]))
                .or_else(|| fallback.lookup(&[name])),
        );
    }
    put(
        &mut properties,
        "UserId",
        from_events(&manual, &["UserId"])
            .or_else(|| from_events(&automatic, &["UserId"]))
            .or_else(|| fallback.lookup(&["UserId", "UserUid"])),
    );

    let command = from_events(&manual, &["CommandName"])
        .or_else(|| command_name(&automatic))
        .or_else(|| fallback.lookup(&["CommandName"]));
    put(&mut properties, "Name", command.clone());
    put(&mut properties, "CommandName", command);

    for name in ["RequestPath", "TenantId"] {
        put(
            &mut properties,
            name,
            from_events(&manual, &[name])
                .or_else(|| from_events(&automatic, &[name]))
                .or_else(|| fallback.lookup(&[name])),
        );
    }

    if level == LogLevel::Warning {
        let warning = events
            .iter()
            .filter(|event| event.level == LogLevel::Warning)
            .map(substituted_message)
            .collect::<Vec<_>>()
            .join("\n");
        if !warning.is_empty() {
            properties.insert("WarningMessage".to_string(), PropertyValue::text(warning));
        }
    }

    LogEvent {
        timestamp,
        level,
        exception,
        message_template: MessageTemplate::from_tokens(tokens),
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::ExceptionInfo;
    use chrono::{DateTime, Duration, FixedOffset, TimeZone};

    fn at(seconds: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .unwrap()
            + Duration::seconds(seconds)
    }

    fn event(level: LogLevel, template: &str, span: &str, seconds: i64) -> LogEvent {
        LogEvent::new(level, template)
            .with_timestamp(at(seconds))
            .with_property("SpanId", span)
    }

    fn manual(level: LogLevel, template: &str, span: &str, seconds: i64) -> LogEvent {
        event(level, template, span, seconds).with_property("LoggedManually", true)
    }

    fn request(account: &str) -> PropertyValue {
        PropertyValue::structure(
            Some("PlaceOrder"),
            vec![
                (
                    "AccountIdentifier",
                    PropertyValue::structure(
                        None,
                        vec![
                            ("AccountUid", PropertyValue::text(account)),
                            ("ClientUid", PropertyValue::text("client-9")),
                        ],
                    ),
                ),
                ("UserUid", PropertyValue::text("user-3")),
                ("OrderId", PropertyValue::int(77)),
            ],
        )
    }

    #[test]
    fn test_manual_group_with_error_is_synthesized() {
        let a = event(LogLevel::Information, "Start", "S1", 0)
            .with_property("LoggedManually", false)
            .with_property("ActionId", 1i64);
        let b = event(LogLevel::Error, "Boom", "S1", 1)
            .with_property("LoggedManually", false)
            .with_exception(ExceptionInfo::new("E", "failed"));
        let c = manual(LogLevel::Information, "Doing {ActionName}", "S1", 2)
            .with_property("ActionName", "Foo");

        let merged = merge_batch(vec![a, b, c], &CorrelationOptions::default());
        assert_eq!(merged.len(), 1);
        let row = &merged[0];
        assert_eq!(row.level, LogLevel::Error);
        assert_eq!(row.exception, Some(ExceptionInfo::new("E", "failed")));
        assert_eq!(row.property("ActionName"), Some(&PropertyValue::text("Foo")));
        assert_eq!(row.property("LoggedManually"), Some(&PropertyValue::bool(true)));
        assert_eq!(row.property("ActionId"), Some(&PropertyValue::int(1)));
        assert_eq!(row.property("SpanId"), Some(&PropertyValue::text("S1")));
        assert_eq!(row.timestamp, at(0));
        assert_eq!(row.message_template.text(), "Doing Foo\nBoom\n");
    }

    #[test]
    fn test_automatic_only_group_without_errors_is_dropped() {
        let events = vec![
            event(LogLevel::Information, "one", "S2", 0).with_property("ActionId", 5i64),
            event(LogLevel::Warning, "two", "S2", 1).with_property("ActionId", 5i64),
        ];
        assert!(merge_batch(events, &CorrelationOptions::default()).is_empty());
    }

    #[test]
    fn test_automatic_errors_pass_through_verbatim() {
        let error = event(LogLevel::Fatal, "crash", "S3", 3);
        let events = vec![
            event(LogLevel::Information, "noise", "S3", 0).with_property("ActionId", 1i64),
            error.clone(),
        ];
        assert_eq!(merge_batch(events, &CorrelationOptions::default()), vec![error]);
    }

    #[test]
    fn test_filter_rules() {
        let keep_error = LogEvent::new(LogLevel::Error, "no key");
        let drop_plain = event(LogLevel::Information, "plain", "S", 0);
        let drop_keyless_manual =
            LogEvent::new(LogLevel::Information, "m").with_property("LoggedManually", true);
        let keep_action = event(LogLevel::Debug, "a", "S", 0).with_property("ActionId", 1i64);
        let keep_manual = manual(LogLevel::Debug, "m", "S", 0);

        let filtered = filter_events(
            vec![
                keep_error.clone(),
                drop_plain,
                drop_keyless_manual,
                keep_action.clone(),
                keep_manual.clone(),
            ],
            &CorrelationOptions::default(),
        );
        assert_eq!(filtered, vec![keep_error, keep_action, keep_manual]);
    }

    #[test]
    fn test_keyless_errors_kept_in_order() {
        let keyless = LogEvent::new(LogLevel::Error, "db down");
        let merged = merge_batch(
            vec![
                manual(LogLevel::Information, "first", "A", 0),
                keyless.clone(),
                manual(LogLevel::Information, "second", "B", 1),
            ],
            &CorrelationOptions::default(),
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].message_template.text(), "first\n");
        assert_eq!(merged[1], keyless);
        assert_eq!(merged[2].message_template.text(), "second\n");
    }

    #[test]
    fn test_disabled_correlation_writes_batch_verbatim() {
        let options = CorrelationOptions {
            enabled: false,
            ..CorrelationOptions::default()
        };
        let events = vec![
            LogEvent::new(LogLevel::Verbose, "a"),
            LogEvent::new(LogLevel::Information, "b"),
        ];
        assert_eq!(merge_batch(events.clone(), &options), events);
    }

    #[test]
    fn test_account_identifier_from_request() {
        let auto = event(LogLevel::Information, "req", "S", 0)
            .with_property("ActionId", 2i64)
            .with_property("Request", request("acc-1"))
            .with_property("Name", "\"PlaceOrderCommand\"")
            .with_property("UserId", "u-1")
            .with_property("RequestPath", "/orders");
        let m = manual(LogLevel::Information, "placed", "S", 1);

        let merged = merge_batch(vec![auto, m], &CorrelationOptions::default());
        let row = &merged[0];
        assert_eq!(row.property("AccountUid"), Some(&PropertyValue::text("acc-1")));
        assert_eq!(row.property("ClientUid"), Some(&PropertyValue::text("client-9")));
        assert_eq!(row.property("Name"), Some(&PropertyValue::text("PlaceOrderCommand")));
        assert_eq!(
            row.property("CommandName"),
            Some(&PropertyValue::text("PlaceOrderCommand"))
        );
        assert_eq!(row.property("UserId"), Some(&PropertyValue::text("u-1")));
        assert_eq!(row.property("RequestPath"), Some(&PropertyValue::text("/orders")));
        assert!(row.property("WhitelabelUid").is_none());
        // 非错误组不展开 Request
        assert!(!row.message_template.text().contains("Request:"));
    }

    #[test]
    fn test_manual_property_wins_over_request() {
        let auto = event(LogLevel::Information, "req", "S", 0)
            .with_property("ActionId", 2i64)
            .with_property("Request", request("acc-auto"));
        let m = manual(LogLevel::Information, "x", "S", 1)
            .with_property("AccountUid", "acc-manual")
            .with_property("WhitelabelCompanyUid", "wl-1");

        let row = &merge_batch(vec![auto, m], &CorrelationOptions::default())[0];
        assert_eq!(row.property("AccountUid"), Some(&PropertyValue::text("acc-manual")));
        assert_eq!(row.property("WhitelabelUid"), Some(&PropertyValue::text("wl-1")));
    }

    #[test]
    fn test_error_group_uses_request_fallback() {
        let failing = event(LogLevel::Error, "Command {Cmd} failed", "S", 0)
            .with_property("Request", request("acc-2"))
            .with_property("Name", "EventCommand");
        let m = manual(LogLevel::Information, "user clicked", "S", 1);

        let row = &merge_batch(vec![failing, m], &CorrelationOptions::default())[0];
        assert_eq!(row.property("UserId"), Some(&PropertyValue::text("user-3")));
        assert!(row.property("CommandName").is_none());
        assert_eq!(
            row.message_template.text(),
            "user clicked\nCommand {Cmd} failed\nRequest:\n\
             AccountIdentifier.AccountUid: acc-2\n\
             AccountIdentifier.ClientUid: client-9\n\
             UserUid: user-3\n\
             OrderId: 77\n"
        );
    }

    #[test]
    fn test_exception_tie_break() {
        let older = event(LogLevel::Fatal, "old", "S", 0)
            .with_exception(ExceptionInfo::new("Old", "first"));
        let newer = event(LogLevel::Fatal, "new", "S", 5)
            .with_exception(ExceptionInfo::new("New", "second"));
        let lower = event(LogLevel::Error, "err", "S", 9)
            .with_exception(ExceptionInfo::new("Lower", "third"));
        let m = manual(LogLevel::Information, "m", "S", 1);

        let row = &merge_batch(vec![older, newer, lower, m], &CorrelationOptions::default())[0];
        assert_eq!(row.level, LogLevel::Fatal);
        assert_eq!(row.exception.as_ref().map(|e| e.type_name.as_str()), Some("New"));
    }

    #[test]
    fn test_warning_summary() {
        let w1 = manual(LogLevel::Warning, "Low stock for {Sku}", "S", 0).with_property("Sku", "A-1");
        let w2 = event(LogLevel::Warning, "Retrying", "S", 1).with_property("ActionId", 4i64);
        let info = manual(LogLevel::Information, "done", "S", 2);

        let row = &merge_batch(vec![w1, w2, info], &CorrelationOptions::default())[0];
        assert_eq!(row.level, LogLevel::Warning);
        assert_eq!(
            row.property("WarningMessage"),
            Some(&PropertyValue::text("Low stock for A-1\nRetrying"))
        );
        assert!(row.exception.is_none());
        assert_eq!(row.message_template.text(), "Low stock for A-1\ndone\n");
    }

    #[test]
    fn test_custom_property_names() {
        let options = CorrelationOptions {
            enabled: true,
            key_property: "TraceId".to_string(),
            action_id_property: "OperationId".to_string(),
            manual_marker_property: "Manual".to_string(),
        };
        let auto = LogEvent::new(LogLevel::Information, "auto")
            .with_property("TraceId", "T")
            .with_property("OperationId", 11i64);
        let m = LogEvent::new(LogLevel::Information, "manual")
            .with_property("TraceId", "T")
            .with_property("Manual", "true");

        let merged = merge_batch(vec![auto, m], &options);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].property("OperationId"), Some(&PropertyValue::int(11)));
        assert_eq!(merged[0].property("Manual"), Some(&PropertyValue::bool(true)));
        assert_eq!(merged[0].property("TraceId"), Some(&PropertyValue::text("T")));
    }
}
