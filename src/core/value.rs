//! 结构化属性值
//!
//! 日志事件的属性值是一个封闭的变体类型：标量、序列、结构体和字典。
//! 所有的导航辅助函数都是全函数，缺失的字段返回 `None` 而不是 panic。

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::fmt::Write as _;

/// 数值与文本的区域化渲染设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProvider {
    /// 小数分隔符
    pub decimal_separator: char,
}

impl Default for FormatProvider {
    fn default() -> Self {
        Self {
            decimal_separator: '.',
        }
    }
}

impl FormatProvider {
    /// 使用指定的小数分隔符
    pub fn with_decimal_separator(decimal_separator: char) -> Self {
        Self { decimal_separator }
    }

    fn localize(&self, rendered: String) -> String {
        if self.decimal_separator == '.' {
            rendered
        } else {
            rendered.replace('.', &self.decimal_separator.to_string())
        }
    }
}

/// 标量值
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<FixedOffset>),
}

impl ScalarValue {
    /// 按格式说明符渲染
    ///
    /// 字符串默认带引号，格式 `l` 表示按字面值输出。
    pub fn render(&self, format: Option<&str>, provider: &FormatProvider) -> String {
        match self {
            ScalarValue::Null => "null".to_string(),
            ScalarValue::Bool(b) => if *b { "True" } else { "False" }.to_string(),
            ScalarValue::Text(s) => match format {
                Some("l") => s.clone(),
                _ => format!("\"{}\"", s.replace('"', "\\\"")),
            },
            ScalarValue::Int(i) => render_integer(*i as i128, *i as u64, format),
            ScalarValue::UInt(u) => render_integer(*u as i128, *u, format),
            ScalarValue::Float(f) => provider.localize(render_float(*f, format)),
            ScalarValue::Timestamp(ts) => match format {
                Some(pattern) if !pattern.is_empty() => render_timestamp(ts, pattern),
                _ => ts.to_rfc3339(),
            },
        }
    }

    /// 不带引号的文本形式
    pub fn as_text(&self) -> String {
        match self {
            ScalarValue::Text(s) => s.clone(),
            other => other.render(None, &FormatProvider::default()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::Null => Value::Null,
            ScalarValue::Bool(b) => Value::Bool(*b),
            ScalarValue::Int(i) => Value::Number(Number::from(*i)),
            ScalarValue::UInt(u) => Value::Number(Number::from(*u)),
            ScalarValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            ScalarValue::Text(s) => Value::String(s.clone()),
            ScalarValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
        }
    }
}

/// 无效的 strftime 模式回退为 RFC 3339
fn render_timestamp(ts: &DateTime<FixedOffset>, pattern: &str) -> String {
    let mut rendered = String::new();
    match write!(rendered, "{}", ts.format(pattern)) {
        Ok(()) => rendered,
        Err(_) => ts.to_rfc3339(),
    }
}

/// `bits` 是十六进制输出使用的 64 位补码形式
fn render_integer(value: i128, bits: u64, format: Option<&str>) -> String {
    let Some(format) = format else {
        return value.to_string();
    };
    let (spec, width) = split_format(format);
    match spec {
        'D' | 'd' => {
            let digits = format!("{:0width$}", value.unsigned_abs(), width = width.unwrap_or(0));
            if value < 0 {
                format!("-{}", digits)
            } else {
                digits
            }
        }
        'X' => format!("{:0width$X}", bits, width = width.unwrap_or(0)),
        'x' => format!("{:0width$x}", bits, width = width.unwrap_or(0)),
        'F' | 'f' | 'N' | 'n' => render_float(value as f64, Some(format)),
        _ => value.to_string(),
    }
}

fn render_float(value: f64, format: Option<&str>) -> String {
    match format.map(split_format) {
        Some(('F' | 'f' | 'N' | 'n', precision)) => {
            format!("{:.*}", precision.unwrap_or(2), value)
        }
        _ => value.to_string(),
    }
}

fn split_format(format: &str) -> (char, Option<usize>) {
    let mut chars = format.chars();
    let spec = chars.next().unwrap_or(' ');
    (spec, chars.as_str().parse().ok())
}

/// 结构化属性值
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(ScalarValue),
    Sequence(Vec<PropertyValue>),
    Structure {
        type_tag: Option<String>,
        properties: Vec<(String, PropertyValue)>,
    },
    Dictionary(Vec<(ScalarValue, PropertyValue)>),
}

impl PropertyValue {
    /// 创建文本标量
    pub fn text<S: Into<String>>(value: S) -> Self {
        PropertyValue::Scalar(ScalarValue::Text(value.into()))
    }

    /// 创建整数标量
    pub fn int(value: i64) -> Self {
        PropertyValue::Scalar(ScalarValue::Int(value))
    }

    /// 创建布尔标量
    pub fn bool(value: bool) -> Self {
        PropertyValue::Scalar(ScalarValue::Bool(value))
    }

    /// 创建结构体
    pub fn structure<I, K>(type_tag: Option<&str>, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        PropertyValue::Structure {
            type_tag: type_tag.map(str::to_string),
            properties: properties
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            PropertyValue::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// 如果是结构体，返回其字段列表
    pub fn as_structure(&self) -> Option<&[(String, PropertyValue)]> {
        match self {
            PropertyValue::Structure { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// 按名称精确查找结构体字段
    pub fn field(&self, name: &str) -> Option<&PropertyValue> {
        self.field_matching(name, true)
    }

    /// 查找结构体字段
    ///
    /// `exact` 为 false 时，字段名包含目标子串（不区分大小写）即视为匹配。
    pub fn field_matching(&self, name: &str, exact: bool) -> Option<&PropertyValue> {
        let properties = self.as_structure()?;
        if exact {
            properties
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value)
        } else {
            let needle = name.to_lowercase();
            properties
                .iter()
                .find(|(field, _)| field.to_lowercase().contains(&needle))
                .map(|(_, value)| value)
        }
    }

    /// 去掉一层引号的文本形式
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Scalar(scalar) => scalar.as_text(),
            other => strip_quotes(&other.to_string()).to_string(),
        }
    }

    /// 是否为“真”值（布尔 true、文本 "true" 或非零整数）
    pub fn is_truthy(&self) -> bool {
        match self {
            PropertyValue::Scalar(ScalarValue::Bool(b)) => *b,
            PropertyValue::Scalar(ScalarValue::Text(s)) => s.eq_ignore_ascii_case("true"),
            PropertyValue::Scalar(ScalarValue::Int(i)) => *i != 0,
            PropertyValue::Scalar(ScalarValue::UInt(u)) => *u != 0,
            _ => false,
        }
    }

    /// 按格式说明符渲染；格式只作用于标量
    pub fn render(&self, format: Option<&str>, provider: &FormatProvider) -> String {
        match self {
            PropertyValue::Scalar(scalar) => scalar.render(format, provider),
            other => other.to_string(),
        }
    }

    /// 转换为 JSON 值
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Scalar(scalar) => scalar.to_json(),
            PropertyValue::Sequence(items) => {
                Value::Array(items.iter().map(PropertyValue::to_json).collect())
            }
            PropertyValue::Structure {
                type_tag,
                properties,
            } => {
                let mut map = Map::new();
                if let Some(tag) = type_tag {
                    map.insert("_typeTag".to_string(), Value::String(tag.clone()));
                }
                for (name, value) in properties {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
            PropertyValue::Dictionary(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.as_text(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provider = FormatProvider::default();
        match self {
            PropertyValue::Scalar(scalar) => write!(f, "{}", scalar.render(None, &provider)),
            PropertyValue::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            PropertyValue::Structure {
                type_tag,
                properties,
            } => {
                if let Some(tag) = type_tag {
                    write!(f, "{} ", tag)?;
                }
                write!(f, "{{ ")?;
                for (i, (name, value)) in properties.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, " }}")
            }
            PropertyValue::Dictionary(entries) => {
                write!(f, "[")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({}: {})", key.render(None, &provider), value)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::text(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Scalar(ScalarValue::Float(value))
    }
}

/// 去掉首尾各一个双引号（仅当两端都有且长度大于 1）
pub fn strip_quotes(value: &str) -> &str {
    if value.len() > 1 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
