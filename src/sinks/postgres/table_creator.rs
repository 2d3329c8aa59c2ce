//! 建表与建模式语句生成
//!
//! 只负责生成 DDL 文本，执行由 [`super::helper::SinkHelper`] 完成。

use super::column_writers::ColumnWriter;
use super::columns::clean_identifier;

/// `"schema"."table"`；模式名为空时只有表名
pub fn qualified_table_name(schema: &str, table: &str) -> String {
    let schema = clean_identifier(schema);
    let table = clean_identifier(table);
    if schema.trim().is_empty() {
        format!("\"{}\"", table)
    } else {
        format!("\"{}\".\"{}\"", schema, table)
    }
}

/// 生成 `CREATE SCHEMA IF NOT EXISTS` 语句
pub fn create_schema_query(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS \"{}\";", clean_identifier(schema))
}

/// 生成 `CREATE TABLE IF NOT EXISTS` 语句，列按调用方给出的顺序排列
pub fn create_table_query<'a, I>(schema: &str, table: &str, columns: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a ColumnWriter)>,
{
    let definitions: Vec<String> = columns
        .into_iter()
        .map(|(name, writer)| {
            format!(" \"{}\" {}", clean_identifier(name), writer.sql_type_fragment())
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        qualified_table_name(schema, table),
        definitions.join(",\n")
    )
}
