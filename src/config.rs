//! PostgreSQL sink 的配置结构体。
//!
//! 配置从 TOML 加载，`into_options` 把它转换为运行时使用的 [`SinkOptions`]。
//!
//! ```toml
//! connection_string = "host=localhost user=postgres dbname=logs"
//! schema_name = "audit"
//! table_name = "events"
//! batch_size_limit = 50
//!
//! [[columns]]
//! name = "level"
//! kind = "LevelAsText"
//!
//! [[property_columns]]
//! name = "user_id"
//! property = "UserId"
//! write_method = "raw"
//! sql_type = "integer"
//!
//! [correlation]
//! enabled = false
//! ```

use crate::core::event::LogLevel;
use crate::core::value::FormatProvider;
use crate::env_config::EnvConfig;
use crate::error::{QuantumSinkError, Result};
use crate::sinks::postgres::column_writers::{ColumnWriter, PropertyWriteMethod, SqlType};
use crate::sinks::postgres::columns::{ColumnKindName, ColumnOptions};
use crate::sinks::postgres::helper::{SinkOptions, DEFAULT_BATCH_SIZE_LIMIT};
use crate::sinks::postgres::merger::CorrelationOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// --- 辅助函数，用于提供配置项的默认值 ---
fn default_table_name() -> String {
    "logs".to_string()
}
fn default_batch_size_limit() -> usize {
    DEFAULT_BATCH_SIZE_LIMIT
}
fn default_period_ms() -> u64 {
    5000
}
fn default_min_level() -> String {
    "Verbose".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_decimal_separator() -> char {
    '.'
}
fn default_write_method() -> PropertyWriteMethod {
    PropertyWriteMethod::ToString
}
fn default_key_property() -> String {
    "SpanId".to_string()
}
fn default_action_id_property() -> String {
    "ActionId".to_string()
}
fn default_manual_marker_property() -> String {
    "LoggedManually".to_string()
}

/// PostgreSQL sink 的顶层配置。
#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PostgresSinkConfig {
    /// 可由 `QUANTUM_PG_CONNECTION_STRING` 覆盖
    #[serde(default)]
    pub connection_string: String,
    /// 为空时表名不带模式限定
    #[serde(default)]
    pub schema_name: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,
    /// 未设置时队列无界
    pub queue_limit: Option<usize>,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_min_level")]
    pub min_level: String,
    #[serde(default = "default_true")]
    pub use_copy: bool,
    #[serde(default = "default_false")]
    pub auto_create_schema: bool,
    #[serde(default = "default_false")]
    pub auto_create_table: bool,
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: char,
    /// 三个列表都为空时使用默认列集合
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub property_columns: Vec<PropertyColumnConfig>,
    #[serde(default)]
    pub nested_property_columns: Vec<NestedPropertyColumnConfig>,
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

impl Default for PostgresSinkConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema_name: String::new(),
            table_name: default_table_name(),
            batch_size_limit: default_batch_size_limit(),
            queue_limit: None,
            period_ms: default_period_ms(),
            min_level: default_min_level(),
            use_copy: default_true(),
            auto_create_schema: default_false(),
            auto_create_table: default_false(),
            decimal_separator: default_decimal_separator(),
            columns: Vec::new(),
            property_columns: Vec::new(),
            nested_property_columns: Vec::new(),
            correlation: CorrelationConfig::default(),
        }
    }
}

impl std::fmt::Debug for PostgresSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSinkConfig")
            .field("connection_string", &"<redacted>")
            .field("schema_name", &self.schema_name)
            .field("table_name", &self.table_name)
            .field("batch_size_limit", &self.batch_size_limit)
            .field("queue_limit", &self.queue_limit)
            .field("period_ms", &self.period_ms)
            .field("min_level", &self.min_level)
            .field("use_copy", &self.use_copy)
            .field("auto_create_schema", &self.auto_create_schema)
            .field("auto_create_table", &self.auto_create_table)
            .field("columns", &self.columns)
            .field("property_columns", &self.property_columns)
            .field("nested_property_columns", &self.nested_property_columns)
            .field("correlation", &self.correlation)
            .finish()
    }
}

/// 内置列
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    pub kind: ColumnKindName,
    pub sql_type: Option<SqlType>,
    pub order: Option<i32>,
}

/// 单个属性列
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PropertyColumnConfig {
    pub name: String,
    pub property: String,
    #[serde(default = "default_write_method")]
    pub write_method: PropertyWriteMethod,
    pub sql_type: Option<SqlType>,
    pub format: Option<String>,
    pub order: Option<i32>,
}

/// 嵌套属性列
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NestedPropertyColumnConfig {
    pub name: String,
    pub parent: String,
    pub nested: String,
    /// false 时按不区分大小写的包含关系匹配子字段
    #[serde(default = "default_true")]
    pub exact: bool,
    pub write_method: Option<PropertyWriteMethod>,
    pub sql_type: Option<SqlType>,
    pub format: Option<String>,
    pub order: Option<i32>,
}

/// 关联合并配置
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CorrelationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_key_property")]
    pub key_property: String,
    #[serde(default = "default_action_id_property")]
    pub action_id_property: String,
    #[serde(default = "default_manual_marker_property")]
    pub manual_marker_property: String,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            key_property: default_key_property(),
            action_id_property: default_action_id_property(),
            manual_marker_property: default_manual_marker_property(),
        }
    }
}

impl From<CorrelationConfig> for CorrelationOptions {
    fn from(config: CorrelationConfig) -> Self {
        CorrelationOptions {
            enabled: config.enabled,
            key_property: config.key_property,
            action_id_property: config.action_id_property,
            manual_marker_property: config.manual_marker_property,
        }
    }
}

fn apply_common(writer: ColumnWriter, sql_type: Option<SqlType>, order: Option<i32>) -> ColumnWriter {
    let writer = match sql_type {
        Some(sql_type) => writer.with_sql_type(sql_type),
        None => writer,
    };
    match order {
        Some(order) => writer.with_order(order),
        None => writer,
    }
}

impl PostgresSinkConfig {
    /// 应用环境变量覆盖
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(connection_string) = EnvConfig::connection_string() {
            self.connection_string = connection_string;
        }
        if let Some(schema_name) = EnvConfig::schema_name() {
            self.schema_name = schema_name;
        }
        self
    }

    /// 构建列注册表
    pub fn column_options(&self) -> ColumnOptions {
        if self.columns.is_empty()
            && self.property_columns.is_empty()
            && self.nested_property_columns.is_empty()
        {
            return ColumnOptions::default_columns();
        }

        let mut options = ColumnOptions::new();
        for column in &self.columns {
            options.insert(
                &column.name,
                apply_common(column.kind.build(), column.sql_type, column.order),
            );
        }
        for column in &self.property_columns {
            let mut writer = ColumnWriter::single_property(&column.property, column.write_method);
            if let Some(format) = &column.format {
                writer = writer.with_format(format);
            }
            options.insert(&column.name, apply_common(writer, column.sql_type, column.order));
        }
        for column in &self.nested_property_columns {
            let mut writer = ColumnWriter::nested_property(
                &column.parent,
                &column.nested,
                column.exact,
                column.write_method,
            );
            if let Some(format) = &column.format {
                writer = writer.with_format(format);
            }
            options.insert(&column.name, apply_common(writer, column.sql_type, column.order));
        }
        options
    }

    /// 转换为运行时选项
    pub fn into_options(self) -> Result<SinkOptions> {
        validate_config(&self)?;
        let min_level: LogLevel = self.min_level.parse()?;
        let columns = self.column_options();

        let options = SinkOptions::new(self.connection_string, &self.table_name)
            .with_schema(&self.schema_name)
            .with_columns(columns)
            .with_batch_size_limit(self.batch_size_limit)
            .with_queue_limit(self.queue_limit)
            .with_period(Duration::from_millis(self.period_ms))
            .with_format_provider(FormatProvider::with_decimal_separator(self.decimal_separator))
            .with_use_copy(self.use_copy)
            .with_auto_create(self.auto_create_schema, self.auto_create_table)
            .with_min_level(min_level)
            .with_correlation(self.correlation.into());
        options.validate()?;
        Ok(options)
    }
}

/// 用于从 TOML 文件加载 `PostgresSinkConfig` 的辅助函数。
pub fn load_config_from_file(path: &Path) -> Result<PostgresSinkConfig> {
    if !path.exists() {
        return Err(QuantumSinkError::ConfigFileMissing(
            path.to_string_lossy().into_owned(),
        ));
    }

    let config_str = std::fs::read_to_string(path)?;
    load_config_from_str(&config_str)
}

/// 用于从 TOML 字符串加载 `PostgresSinkConfig` 的辅助函数。
pub fn load_config_from_str(config_str: &str) -> Result<PostgresSinkConfig> {
    let config: PostgresSinkConfig = toml::from_str(config_str)?;
    Ok(config)
}

/// 验证配置的有效性。
pub fn validate_config(config: &PostgresSinkConfig) -> Result<()> {
    config.min_level.parse::<LogLevel>()?;

    if config.connection_string.trim().is_empty() {
        return Err(QuantumSinkError::config("连接字符串不能为空"));
    }
    if config.table_name.trim().is_empty() {
        return Err(QuantumSinkError::config("表名不能为空"));
    }
    if config.batch_size_limit == 0 {
        return Err(QuantumSinkError::config("批次大小必须大于0"));
    }
    if config.queue_limit == Some(0) {
        return Err(QuantumSinkError::config("队列上限必须大于0"));
    }
    if config.period_ms == 0 {
        return Err(QuantumSinkError::config("刷新周期必须大于0"));
    }

    let mut names = std::collections::HashSet::new();
    let all_names = config
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .chain(config.property_columns.iter().map(|c| c.name.as_str()))
        .chain(config.nested_property_columns.iter().map(|c| c.name.as_str()));
    for name in all_names {
        if name.trim().is_empty() {
            return Err(QuantumSinkError::config("列名不能为空"));
        }
        if !names.insert(name) {
            return Err(QuantumSinkError::ConfigError(format!("列名重复: {}", name)));
        }
    }

    Ok(())
}
