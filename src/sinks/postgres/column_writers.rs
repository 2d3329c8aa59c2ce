//! 列写入器
//!
//! 每个列写入器负责从日志事件中提取一个列的值，并给出该列在 DDL 中的类型。
//! 写入器是封闭的变体集合（[`ColumnKind`]），对良构的事件求值不会失败；
//! 唯一的例外是自增主键列，它的值由数据库分配。

use crate::core::event::LogEvent;
use crate::core::value::{FormatProvider, PropertyValue, ScalarValue};
use crate::error::{QuantumSinkError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 列的 PostgreSQL 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    DoublePrecision,
    Real,
    Numeric,
    Boolean,
    Char(u32),
    Varchar(u32),
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Jsonb,
}

impl SqlType {
    /// DDL 中使用的类型名称
    pub fn ddl_name(&self) -> String {
        match self {
            SqlType::BigInt => "bigint".to_string(),
            SqlType::Integer => "integer".to_string(),
            SqlType::SmallInt => "smallint".to_string(),
            SqlType::DoublePrecision => "double precision".to_string(),
            SqlType::Real => "real".to_string(),
            SqlType::Numeric => "numeric".to_string(),
            SqlType::Boolean => "boolean".to_string(),
            SqlType::Char(n) => format!("character({})", n),
            SqlType::Varchar(n) => format!("character varying({})", n),
            SqlType::Text => "text".to_string(),
            SqlType::Date => "date".to_string(),
            SqlType::Timestamp => "timestamp".to_string(),
            SqlType::TimestampTz => "timestamp with time zone".to_string(),
            SqlType::Json => "json".to_string(),
            SqlType::Jsonb => "jsonb".to_string(),
        }
    }

    /// 是否为文本类型（text / varchar / char）
    pub fn is_textual(&self) -> bool {
        matches!(self, SqlType::Text | SqlType::Varchar(_) | SqlType::Char(_))
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ddl_name())
    }
}

/// 列写入器计算出的值；`Null` 对应数据库 NULL
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Raw 模式下透传的复合值
    Composite(PropertyValue),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn from_scalar(scalar: &ScalarValue) -> Self {
        match scalar {
            ScalarValue::Null => ColumnValue::Null,
            ScalarValue::Bool(b) => ColumnValue::Bool(*b),
            ScalarValue::Int(i) => ColumnValue::Int(*i),
            ScalarValue::UInt(u) => i64::try_from(*u)
                .map(ColumnValue::Int)
                .unwrap_or_else(|_| ColumnValue::Text(u.to_string())),
            ScalarValue::Float(f) => ColumnValue::Float(*f),
            ScalarValue::Text(s) => ColumnValue::Text(s.clone()),
            ScalarValue::Timestamp(ts) => ColumnValue::Timestamp(ts.with_timezone(&Utc)),
        }
    }
}

/// 属性值的提取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyWriteMethod {
    /// 标量解包为原生值，复合值原样透传
    Raw,
    /// 字符串化
    ToString,
    /// JSON 片段
    Json,
}

/// 列写入器的种类
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    /// 级别的序号，或 `as_text` 时的名称
    Level { as_text: bool },
    /// 事件时间戳，统一转换到 UTC
    Timestamp,
    /// 消息模板原文
    Message,
    /// 渲染后的消息
    RenderedMessage,
    /// 整个事件序列化为 JSON
    SerializedEvent,
    /// 属性映射序列化为 JSON 对象
    Properties,
    Exception,
    SingleProperty {
        name: String,
        write_method: PropertyWriteMethod,
        format: Option<String>,
    },
    NestedProperty {
        parent: String,
        nested: String,
        exact: bool,
        /// `None` 表示使用格式说明符渲染
        write_method: Option<PropertyWriteMethod>,
        format: Option<String>,
    },
    IdAutoIncrement,
}

/// 列写入器
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnWriter {
    pub kind: ColumnKind,
    pub sql_type: SqlType,
    /// 插入时跳过（仅自增列）
    pub skip_on_insert: bool,
    /// 建表时的列顺序
    pub order: Option<i32>,
}

impl ColumnWriter {
    fn with_kind(kind: ColumnKind, sql_type: SqlType) -> Self {
        Self {
            kind,
            sql_type,
            skip_on_insert: false,
            order: None,
        }
    }

    pub fn level() -> Self {
        Self::with_kind(ColumnKind::Level { as_text: false }, SqlType::Integer)
    }

    pub fn level_as_text() -> Self {
        Self::with_kind(ColumnKind::Level { as_text: true }, SqlType::Text)
    }

    /// 时间戳列，类型始终为 `timestamp with time zone`
    pub fn timestamp() -> Self {
        Self::with_kind(ColumnKind::Timestamp, SqlType::TimestampTz)
    }

    pub fn message() -> Self {
        Self::with_kind(ColumnKind::Message, SqlType::Text)
    }

    pub fn rendered_message() -> Self {
        Self::with_kind(ColumnKind::RenderedMessage, SqlType::Text)
    }

    pub fn serialized_event() -> Self {
        Self::with_kind(ColumnKind::SerializedEvent, SqlType::Jsonb)
    }

    pub fn properties() -> Self {
        Self::with_kind(ColumnKind::Properties, SqlType::Jsonb)
    }

    pub fn exception() -> Self {
        Self::with_kind(ColumnKind::Exception, SqlType::Text)
    }

    pub fn single_property<S: Into<String>>(name: S, write_method: PropertyWriteMethod) -> Self {
        Self::with_kind(
            ColumnKind::SingleProperty {
                name: name.into(),
                write_method,
                format: None,
            },
            SqlType::Text,
        )
    }

    pub fn nested_property<P: Into<String>, N: Into<String>>(
        parent: P,
        nested: N,
        exact: bool,
        write_method: Option<PropertyWriteMethod>,
    ) -> Self {
        Self::with_kind(
            ColumnKind::NestedProperty {
                parent: parent.into(),
                nested: nested.into(),
                exact,
                write_method,
                format: None,
            },
            SqlType::Text,
        )
    }

    pub fn id_auto_increment() -> Self {
        Self {
            kind: ColumnKind::IdAutoIncrement,
            sql_type: SqlType::BigInt,
            skip_on_insert: true,
            order: None,
        }
    }

    /// 覆盖列类型；时间戳列忽略覆盖
    pub fn with_sql_type(mut self, sql_type: SqlType) -> Self {
        if self.kind != ColumnKind::Timestamp {
            self.sql_type = sql_type;
        }
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    /// 设置格式说明符（仅对属性列生效）
    pub fn with_format<S: Into<String>>(mut self, format: S) -> Self {
        match &mut self.kind {
            ColumnKind::SingleProperty { format: slot, .. }
            | ColumnKind::NestedProperty { format: slot, .. } => *slot = Some(format.into()),
            _ => {}
        }
        self
    }

    /// DDL 中的类型片段；自增列包含主键约束
    pub fn sql_type_fragment(&self) -> String {
        match self.kind {
            ColumnKind::IdAutoIncrement => "SERIAL PRIMARY KEY".to_string(),
            _ => self.sql_type.ddl_name(),
        }
    }

    /// 计算该列对应事件的值
    pub fn get_value(&self, event: &LogEvent, provider: &FormatProvider) -> Result<ColumnValue> {
        let value = match &self.kind {
            ColumnKind::Level { as_text: true } => {
                ColumnValue::Text(event.level.as_str().to_string())
            }
            ColumnKind::Level { as_text: false } => ColumnValue::Int(event.level.ordinal() as i64),
            ColumnKind::Timestamp => ColumnValue::Timestamp(event.timestamp.with_timezone(&Utc)),
            ColumnKind::Message => ColumnValue::Text(event.message_template.text().to_string()),
            ColumnKind::RenderedMessage => ColumnValue::Text(event.rendered_message(provider)),
            ColumnKind::SerializedEvent => {
                ColumnValue::Text(serde_json::to_string(&event.to_json(provider))?)
            }
            ColumnKind::Properties => {
                if event.properties.is_empty() {
                    ColumnValue::Text("{}".to_string())
                } else {
                    ColumnValue::Text(serde_json::to_string(&event.properties_json())?)
                }
            }
            ColumnKind::Exception => match &event.exception {
                Some(exception) => ColumnValue::Text(exception.to_string()),
                None => ColumnValue::Null,
            },
            ColumnKind::SingleProperty {
                name,
                write_method,
                format,
            } => match event.property(name) {
                Some(value) => extract(value, Some(*write_method), format.as_deref(), provider)?,
                None => ColumnValue::Null,
            },
            ColumnKind::NestedProperty {
                parent,
                nested,
                exact,
                write_method,
                format,
            } => match event
                .property(parent)
                .and_then(|value| value.field_matching(nested, *exact))
            {
                Some(value) => extract(value, *write_method, format.as_deref(), provider)?,
                None => ColumnValue::Null,
            },
            ColumnKind::IdAutoIncrement => {
                return Err(QuantumSinkError::invariant(
                    "auto-increment column value is assigned by the database",
                ))
            }
        };
        Ok(value)
    }
}

fn extract(
    value: &PropertyValue,
    write_method: Option<PropertyWriteMethod>,
    format: Option<&str>,
    provider: &FormatProvider,
) -> Result<ColumnValue> {
    Ok(match write_method {
        Some(PropertyWriteMethod::Raw) => match value {
            PropertyValue::Scalar(scalar) => ColumnValue::from_scalar(scalar),
            composite => ColumnValue::Composite(composite.clone()),
        },
        Some(PropertyWriteMethod::ToString) => match (value, format) {
            (PropertyValue::Scalar(ScalarValue::Null), _) => ColumnValue::Null,
            (_, Some(format)) => ColumnValue::Text(value.render(Some(format), provider)),
            (PropertyValue::Scalar(scalar), None) => ColumnValue::Text(scalar.as_text()),
            (composite, None) => ColumnValue::Text(composite.to_string()),
        },
        Some(PropertyWriteMethod::Json) => {
            ColumnValue::Text(serde_json::to_string(&value.to_json())?)
        }
        None => ColumnValue::Text(value.render(format, provider)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{ExceptionInfo, LogLevel};
    use chrono::{FixedOffset, TimeZone};

    fn provider() -> FormatProvider {
        FormatProvider::default()
    }

    fn event() -> LogEvent {
        LogEvent::new(LogLevel::Warning, "Order {OrderId} failed")
    }

    fn request_event() -> LogEvent {
        event().with_property(
            "Request",
            PropertyValue::structure(
                Some("CreateOrder"),
                vec![
                    ("CustomerName", PropertyValue::text("Ann")),
                    ("Quantity", PropertyValue::int(3)),
                ],
            ),
        )
    }

    #[test]
    fn test_absent_data_yields_null() {
        let e = event();
        let writers = vec![
            ColumnWriter::exception(),
            ColumnWriter::single_property("Missing", PropertyWriteMethod::Raw),
            ColumnWriter::single_property("Missing", PropertyWriteMethod::ToString),
            ColumnWriter::single_property("Missing", PropertyWriteMethod::Json),
            ColumnWriter::nested_property("Missing", "Field", true, None),
        ];
        for writer in writers {
            assert_eq!(writer.get_value(&e, &provider()).unwrap(), ColumnValue::Null);
        }
    }

    #[test]
    fn test_id_auto_increment_always_fails() {
        let writer = ColumnWriter::id_auto_increment();
        let err = writer.get_value(&event(), &provider()).unwrap_err();
        assert!(matches!(err, QuantumSinkError::InvariantViolation(_)));
        assert!(writer.skip_on_insert);
        assert_eq!(writer.sql_type_fragment(), "SERIAL PRIMARY KEY");
    }

    #[test]
    fn test_level_writers() {
        let e = event();
        assert_eq!(ColumnWriter::level().get_value(&e, &provider()).unwrap(), ColumnValue::Int(3));
        assert_eq!(
            ColumnWriter::level_as_text().get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Warning".to_string())
        );
    }

    #[test]
    fn test_timestamp_is_utc_and_type_forced() {
        let ts = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .unwrap();
        let writer = ColumnWriter::timestamp().with_sql_type(SqlType::Timestamp);
        assert_eq!(writer.sql_type, SqlType::TimestampTz);
        let value = writer.get_value(&event().with_timestamp(ts), &provider()).unwrap();
        assert_eq!(
            value,
            ColumnValue::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_properties_writer() {
        assert_eq!(
            ColumnWriter::properties().get_value(&event(), &provider()).unwrap(),
            ColumnValue::Text("{}".to_string())
        );
        let value = ColumnWriter::properties()
            .get_value(&event().with_property("OrderId", 9i64), &provider())
            .unwrap();
        assert_eq!(value, ColumnValue::Text("{\"OrderId\":9}".to_string()));
    }

    #[test]
    fn test_exception_writer() {
        let e = event().with_exception(
            ExceptionInfo::new("Timeout", "took too long").with_stack_trace("at worker"),
        );
        assert_eq!(
            ColumnWriter::exception().get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Timeout: took too long\nat worker".to_string())
        );
    }

    #[test]
    fn test_message_writers() {
        let e = event().with_property("OrderId", 12i64);
        assert_eq!(
            ColumnWriter::message().get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Order {OrderId} failed".to_string())
        );
        assert_eq!(
            ColumnWriter::rendered_message().get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Order 12 failed".to_string())
        );
        let json = ColumnWriter::serialized_event().get_value(&e, &provider()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(json.as_str().unwrap()).unwrap();
        assert_eq!(parsed["RenderedMessage"], "Order 12 failed");
    }

    #[test]
    fn test_single_property_modes() {
        let e = event()
            .with_property("Name", "TestValue")
            .with_property("Count", 42i64);

        let to_string = ColumnWriter::single_property("Name", PropertyWriteMethod::ToString)
            .with_format("l");
        assert_eq!(
            to_string.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("TestValue".to_string())
        );

        let padded = ColumnWriter::single_property("Count", PropertyWriteMethod::ToString)
            .with_format("D5");
        assert_eq!(
            padded.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("00042".to_string())
        );

        let raw = ColumnWriter::single_property("Count", PropertyWriteMethod::Raw);
        assert_eq!(raw.get_value(&e, &provider()).unwrap(), ColumnValue::Int(42));

        let json = ColumnWriter::single_property("Name", PropertyWriteMethod::Json);
        assert_eq!(
            json.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("\"TestValue\"".to_string())
        );
    }

    #[test]
    fn test_raw_mode_passes_composite_through() {
        let e = request_event();
        let value = ColumnWriter::single_property("Request", PropertyWriteMethod::Raw)
            .get_value(&e, &provider())
            .unwrap();
        assert!(matches!(value, ColumnValue::Composite(PropertyValue::Structure { .. })));
    }

    #[test]
    fn test_nested_property_matching() {
        let e = request_event();

        let exact = ColumnWriter::nested_property(
            "Request",
            "CustomerName",
            true,
            Some(PropertyWriteMethod::ToString),
        );
        assert_eq!(
            exact.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Ann".to_string())
        );

        let exact_miss = ColumnWriter::nested_property(
            "Request",
            "customer",
            true,
            Some(PropertyWriteMethod::ToString),
        );
        assert_eq!(exact_miss.get_value(&e, &provider()).unwrap(), ColumnValue::Null);

        let contains = ColumnWriter::nested_property(
            "Request",
            "customer",
            false,
            Some(PropertyWriteMethod::ToString),
        );
        assert_eq!(
            contains.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("Ann".to_string())
        );

        let formatted = ColumnWriter::nested_property("Request", "Quantity", true, None)
            .with_format("D3");
        assert_eq!(
            formatted.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("003".to_string())
        );

        let default_mode = ColumnWriter::nested_property("Request", "CustomerName", true, None);
        assert_eq!(
            default_mode.get_value(&e, &provider()).unwrap(),
            ColumnValue::Text("\"Ann\"".to_string())
        );
    }

    #[test]
    fn test_nested_property_on_scalar_parent_is_null() {
        let e = event().with_property("Request", "not a structure");
        let writer = ColumnWriter::nested_property("Request", "CustomerName", false, None);
        assert_eq!(writer.get_value(&e, &provider()).unwrap(), ColumnValue::Null);
    }

    #[test]
    fn test_sql_type_names() {
        assert_eq!(SqlType::Varchar(50).ddl_name(), "character varying(50)");
        assert_eq!(SqlType::TimestampTz.to_string(), "timestamp with time zone");
        assert!(SqlType::Char(2).is_textual());
        assert!(!SqlType::Jsonb.is_textual());
    }
}
