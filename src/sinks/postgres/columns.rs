//! 列注册表
//!
//! 列名到列写入器的有序映射。列名中的双引号会被移除，插入顺序即 INSERT/COPY 的列顺序。

use super::column_writers::ColumnWriter;
use serde::{Deserialize, Serialize};

/// 移除标识符中的所有双引号
pub fn clean_identifier(name: &str) -> String {
    name.replace('"', "")
}

/// 配置文件中可用的列写入器名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKindName {
    Level,
    LevelAsText,
    Timestamp,
    LogEvent,
    Properties,
    Message,
    RenderedMessage,
    Exception,
    IdAutoIncrement,
}

impl ColumnKindName {
    /// 构建对应的列写入器
    pub fn build(self) -> ColumnWriter {
        match self {
            ColumnKindName::Level => ColumnWriter::level(),
            ColumnKindName::LevelAsText => ColumnWriter::level_as_text(),
            ColumnKindName::Timestamp => ColumnWriter::timestamp(),
            ColumnKindName::LogEvent => ColumnWriter::serialized_event(),
            ColumnKindName::Properties => ColumnWriter::properties(),
            ColumnKindName::Message => ColumnWriter::message(),
            ColumnKindName::RenderedMessage => ColumnWriter::rendered_message(),
            ColumnKindName::Exception => ColumnWriter::exception(),
            ColumnKindName::IdAutoIncrement => ColumnWriter::id_auto_increment(),
        }
    }
}

/// 有序的列注册表
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnOptions {
    columns: Vec<(String, ColumnWriter)>,
}

impl ColumnOptions {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 默认列集合
    pub fn default_columns() -> Self {
        Self::new()
            .with_column("id", ColumnWriter::id_auto_increment())
            .with_column("message", ColumnWriter::rendered_message())
            .with_column("message_template", ColumnWriter::message())
            .with_column("level", ColumnWriter::level())
            .with_column("timestamp", ColumnWriter::timestamp())
            .with_column("exception", ColumnWriter::exception())
            .with_column("properties", ColumnWriter::properties())
    }

    /// 添加或替换一列；同名列原位替换
    pub fn insert<S: AsRef<str>>(&mut self, name: S, writer: ColumnWriter) {
        let name = clean_identifier(name.as_ref());
        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = writer,
            None => self.columns.push((name, writer)),
        }
    }

    pub fn with_column<S: AsRef<str>>(mut self, name: S, writer: ColumnWriter) -> Self {
        self.insert(name, writer);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnWriter> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, writer)| writer)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnWriter)> {
        self.columns
            .iter()
            .map(|(name, writer)| (name.as_str(), writer))
    }

    /// 需要写入的列（跳过自增列），保持插入顺序
    pub fn columns_for_insert(&self) -> Vec<(&str, &ColumnWriter)> {
        self.iter().filter(|(_, writer)| !writer.skip_on_insert).collect()
    }

    /// 建表使用的列顺序
    ///
    /// 所有列都指定了 `order` 时按 `order` 升序，否则按列名字母序。
    pub fn columns_for_create(&self) -> Vec<(&str, &ColumnWriter)> {
        let mut columns: Vec<_> = self.iter().collect();
        if !columns.is_empty() && columns.iter().all(|(_, writer)| writer.order.is_some()) {
            columns.sort_by_key(|(_, writer)| writer.order);
        } else {
            columns.sort_by(|a, b| a.0.cmp(b.0));
        }
        columns
    }
}
