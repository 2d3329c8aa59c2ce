//! 日志事件定义
//!
//! 此模块定义了写入 PostgreSQL 的日志事件模型：级别、消息模板、异常信息和结构化属性。

use crate::core::value::{FormatProvider, PropertyValue};
use crate::error::{QuantumSinkError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 日志级别
///
/// 顺序即严重程度：`Verbose < Debug < Information < Warning < Error < Fatal`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// 序号（0..=5）
    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// 规范名称
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Verbose => "Verbose",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        }
    }

    /// 是否为 Error 及以上
    pub fn is_error_or_above(self) -> bool {
        self >= LogLevel::Error
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = QuantumSinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "verbose" | "trace" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            "information" | "info" => Ok(LogLevel::Information),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "fatal" | "critical" => Ok(LogLevel::Fatal),
            _ => Err(QuantumSinkError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Verbose,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Information,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// 消息模板中的一个片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateToken {
    /// 普通文本
    Text(String),
    /// 属性占位符，`raw` 保留原始的 `{...}` 文本
    Property {
        name: String,
        format: Option<String>,
        raw: String,
    },
}

impl TemplateToken {
    /// 原始文本形式
    pub fn raw(&self) -> &str {
        match self {
            TemplateToken::Text(text) => text,
            TemplateToken::Property { raw, .. } => raw,
        }
    }
}

/// 消息模板
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageTemplate {
    text: String,
    tokens: Vec<TemplateToken>,
}

impl MessageTemplate {
    /// 解析 `"User {UserId} logged in"` 形式的模板
    ///
    /// `{{` 和 `}}` 是转义的花括号；`{@Name}`、`{$Name}` 的捕获提示会被接受并忽略；
    /// `{Name:format}` 携带格式说明符，`{Name,10}` 的对齐部分被忽略。
    pub fn parse(text: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let rest = &text[start + 1..];
                    match rest.find('}') {
                        Some(end) if is_valid_property(&rest[..end]) => {
                            if !literal.is_empty() {
                                tokens.push(TemplateToken::Text(std::mem::take(&mut literal)));
                            }
                            tokens.push(property_token(&rest[..end]));
                            let close = start + 1 + end;
                            while chars.peek().map_or(false, |(i, _)| *i <= close) {
                                chars.next();
                            }
                        }
                        _ => literal.push('{'),
                    }
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            tokens.push(TemplateToken::Text(literal));
        }

        Self {
            text: text.to_string(),
            tokens,
        }
    }

    /// 从已有的片段构造
    pub fn from_tokens(tokens: Vec<TemplateToken>) -> Self {
        let text = tokens.iter().map(TemplateToken::raw).collect();
        Self { text, tokens }
    }

    /// 模板原文
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[TemplateToken] {
        &self.tokens
    }

    /// 使用属性渲染模板，缺失的属性保留原始占位符
    pub fn render(
        &self,
        properties: &BTreeMap<String, PropertyValue>,
        provider: &FormatProvider,
    ) -> String {
        let mut out = String::with_capacity(self.text.len());
        for token in &self.tokens {
            match token {
                TemplateToken::Text(text) => out.push_str(text),
                TemplateToken::Property { name, format, raw } => match properties.get(name) {
                    Some(value) => out.push_str(&value.render(format.as_deref(), provider)),
                    None => out.push_str(raw),
                },
            }
        }
        out
    }
}

fn is_valid_property(inner: &str) -> bool {
    let name = inner.trim_start_matches(['@', '$']);
    let name = name.split([':', ',']).next().unwrap_or("");
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn property_token(inner: &str) -> TemplateToken {
    let body = inner.trim_start_matches(['@', '$']);
    let (head, format) = match body.split_once(':') {
        Some((head, format)) => (head, Some(format.to_string())),
        None => (body, None),
    };
    let name = head.split(',').next().unwrap_or(head).to_string();
    TemplateToken::Property {
        name,
        format,
        raw: format!("{{{}}}", inner),
    }
}

/// 异常信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new<T: Into<String>, M: Into<String>>(type_name: T, message: M) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
            inner: None,
        }
    }

    pub fn with_stack_trace<S: Into<String>>(mut self, stack_trace: S) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_inner(mut self, inner: ExceptionInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// 从任意 `std::error::Error` 构造，source 链作为内部异常
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = ExceptionInfo::new("Error", error.to_string());
        if let Some(source) = error.source() {
            info.inner = Some(Box::new(ExceptionInfo::from_error(source)));
        }
        info
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " ---> {}", inner)?;
        }
        if let Some(stack) = &self.stack_trace {
            write!(f, "\n{}", stack)?;
        }
        Ok(())
    }
}

/// 日志事件
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// 事件时间戳（保留原始时区偏移）
    pub timestamp: DateTime<FixedOffset>,
    pub level: LogLevel,
    pub exception: Option<ExceptionInfo>,
    pub message_template: MessageTemplate,
    /// 结构化属性
    pub properties: BTreeMap<String, PropertyValue>,
}

impl LogEvent {
    /// 以当前时间创建事件
    pub fn new(level: LogLevel, template: &str) -> Self {
        Self {
            timestamp: Utc::now().fixed_offset(),
            level,
            exception: None,
            message_template: MessageTemplate::parse(template),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 添加属性
    pub fn with_property<K: Into<String>, V: Into<PropertyValue>>(mut self, name: K, value: V) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// 附加异常
    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// 渲染后的消息
    pub fn rendered_message(&self, provider: &FormatProvider) -> String {
        self.message_template.render(&self.properties, provider)
    }

    /// 整个事件的 JSON 文档
    pub fn to_json(&self, provider: &FormatProvider) -> Value {
        let mut map = Map::new();
        map.insert(
            "Timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        map.insert(
            "Level".to_string(),
            Value::String(self.level.as_str().to_string()),
        );
        map.insert(
            "MessageTemplate".to_string(),
            Value::String(self.message_template.text().to_string()),
        );
        map.insert(
            "RenderedMessage".to_string(),
            Value::String(self.rendered_message(provider)),
        );
        if let Some(exception) = &self.exception {
            map.insert("Exception".to_string(), Value::String(exception.to_string()));
        }
        if !self.properties.is_empty() {
            map.insert("Properties".to_string(), self.properties_json());
        }
        Value::Object(map)
    }

    /// 属性映射的 JSON 对象
    pub fn properties_json(&self) -> Value {
        Value::Object(
            self.properties
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}
