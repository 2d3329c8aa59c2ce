//! 行写入
//!
//! 把一批事件按列注册表渲染成行，再以 COPY 二进制流或逐行参数化 INSERT 的方式交给存储连接。
//! 两种方式使用相同的列顺序：跳过自增列后的插入顺序。

use super::column_writers::{ColumnValue, SqlType};
use super::columns::{clean_identifier, ColumnOptions};
use super::connection::StoreConnection;
use super::table_creator::qualified_table_name;
use crate::core::event::LogEvent;
use crate::core::value::{strip_quotes, FormatProvider};
use crate::error::{QuantumSinkError, Result};
use tracing::debug;

/// 写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// `COPY ... FROM STDIN BINARY`
    Copy,
    /// 每行一条 `INSERT`
    Insert,
}

/// 目标列的名称与类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    pub sql_type: SqlType,
}

/// COPY 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    pub sql: String,
    pub columns: Vec<TargetColumn>,
}

impl CopyCommand {
    pub fn new(schema: &str, table: &str, options: &ColumnOptions) -> Self {
        let columns = target_columns(options);
        let sql = format!(
            "COPY {} ({}) FROM STDIN BINARY;",
            qualified_table_name(schema, table),
            quoted_column_list(&columns)
        );
        Self { sql, columns }
    }
}

/// 参数化 INSERT 语句，占位符为 `@列名`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub sql: String,
    pub columns: Vec<TargetColumn>,
}

impl InsertStatement {
    pub fn new(schema: &str, table: &str, options: &ColumnOptions) -> Self {
        let columns = target_columns(options);
        let placeholders: Vec<String> = columns
            .iter()
            .map(|column| format!("@{}", column.name))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({});",
            qualified_table_name(schema, table),
            quoted_column_list(&columns),
            placeholders.join(", ")
        );
        Self { sql, columns }
    }
}

/// 绑定到语句上的一个参数
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    pub name: String,
    pub value: ColumnValue,
    pub sql_type: SqlType,
}

/// 转换为 `$n` 占位符后的语句
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalStatement {
    pub sql: String,
    /// 第 n 个占位符对应的参数下标
    pub parameter_order: Vec<usize>,
}

fn target_columns(options: &ColumnOptions) -> Vec<TargetColumn> {
    options
        .columns_for_insert()
        .into_iter()
        .map(|(name, writer)| TargetColumn {
            name: clean_identifier(name),
            sql_type: writer.sql_type,
        })
        .collect()
}

fn quoted_column_list(columns: &[TargetColumn]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{}\"", column.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 为 COPY 计算一行；文本列的值去掉一层首尾引号
pub fn copy_row(
    event: &LogEvent,
    options: &ColumnOptions,
    provider: &FormatProvider,
) -> Result<Vec<ColumnValue>> {
    options
        .columns_for_insert()
        .into_iter()
        .map(|(_, writer)| {
            let value = writer.get_value(event, provider)?;
            Ok(match value {
                ColumnValue::Text(text) if writer.sql_type.is_textual() => {
                    ColumnValue::Text(strip_quotes(&text).to_string())
                }
                other => other,
            })
        })
        .collect()
}

/// 为 INSERT 计算一行的参数
pub fn insert_parameters(
    event: &LogEvent,
    options: &ColumnOptions,
    provider: &FormatProvider,
) -> Result<Vec<BoundParameter>> {
    options
        .columns_for_insert()
        .into_iter()
        .map(|(name, writer)| {
            Ok(BoundParameter {
                name: clean_identifier(name),
                value: writer.get_value(event, provider)?,
                sql_type: writer.sql_type,
            })
        })
        .collect()
}

/// 把 `@name` 占位符转换为 `$n`
///
/// 双引号内的内容原样保留。同名占位符复用同一个位置；找不到同名参数时返回数据库错误。
pub fn bind_positional(sql: &str, parameters: &[BoundParameter]) -> Result<PositionalStatement> {
    let mut out = String::with_capacity(sql.len());
    let mut parameter_order: Vec<usize> = Vec::new();
    let mut in_quotes = false;
    let mut rest = sql;

    while let Some(c) = rest.chars().next() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if c != '@' || in_quotes {
            out.push(c);
            rest = &rest[c.len_utf8()..];
            continue;
        }

        let after = &rest[1..];
        let name_len = after
            .find(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        let index = parameters
            .iter()
            .position(|parameter| parameter.name == name)
            .ok_or_else(|| {
                QuantumSinkError::database(format!("no parameter bound for placeholder @{}", name))
            })?;

        let position = match parameter_order.iter().position(|bound| *bound == index) {
            Some(existing) => existing,
            None => {
                parameter_order.push(index);
                parameter_order.len() - 1
            }
        };
        out.push_str(&format!("${}", position + 1));
        rest = &after[name_len..];
    }

    Ok(PositionalStatement {
        sql: out,
        parameter_order,
    })
}

/// 把一批事件写入存储，返回写入的行数
pub async fn write_events(
    connection: &mut dyn StoreConnection,
    strategy: WriteStrategy,
    schema: &str,
    table: &str,
    options: &ColumnOptions,
    events: &[LogEvent],
    provider: &FormatProvider,
) -> Result<u64> {
    match strategy {
        WriteStrategy::Copy => {
            let command = CopyCommand::new(schema, table, options);
            let rows = events
                .iter()
                .map(|event| copy_row(event, options, provider))
                .collect::<Result<Vec<_>>>()?;
            debug!(rows = rows.len(), "写入 COPY 批次");
            connection.copy_rows(&command, rows).await
        }
        WriteStrategy::Insert => {
            let statement = InsertStatement::new(schema, table, options);
            let mut written = 0;
            for event in events {
                let parameters = insert_parameters(event, options, provider)?;
                written += connection.execute_insert(&statement, &parameters).await?;
            }
            debug!(rows = written, "写入 INSERT 批次");
            Ok(written)
        }
    }
}
