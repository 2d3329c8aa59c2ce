//! 存储连接抽象
//!
//! 每次刷新打开一个新连接，刷新结束后关闭；连接池交给驱动层。
//! 启用 `postgres` 特性时提供基于 `tokio-postgres` 的实现。

use super::column_writers::ColumnValue;
use super::row_writer::{BoundParameter, CopyCommand, InsertStatement};
use crate::error::{QuantumSinkError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// 一次刷新使用的存储连接
#[async_trait]
pub trait StoreConnection: Send {
    /// 执行不带参数的语句（DDL）
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// 以 COPY 二进制流写入多行，全部成功才提交
    async fn copy_rows(&mut self, command: &CopyCommand, rows: Vec<Vec<ColumnValue>>) -> Result<u64>;

    /// 执行一次参数化插入
    async fn execute_insert(
        &mut self,
        statement: &InsertStatement,
        parameters: &[BoundParameter],
    ) -> Result<u64>;

    /// 关闭连接
    async fn close(&mut self) -> Result<()>;
}

/// 连接工厂
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>>;
}

/// 记录下的一次 INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInsert {
    pub sql: String,
    pub parameters: Vec<BoundParameter>,
}

/// 记录下的一次 COPY
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCopy {
    pub sql: String,
    pub rows: Vec<Vec<ColumnValue>>,
}

/// [`RecordingConnector`] 收集到的全部操作
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recorded {
    pub connects: usize,
    pub closes: usize,
    pub statements: Vec<String>,
    pub copies: Vec<RecordedCopy>,
    pub inserts: Vec<RecordedInsert>,
}

/// 内存中的连接器，只记录操作不访问数据库
///
/// 用于演练配置（查看将要执行的 DDL/DML）和测试。
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    recorded: Arc<Mutex<Recorded>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的写入操作都以给定消息失败；`None` 恢复正常
    pub fn fail_writes(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    /// 当前记录的快照
    pub fn recorded(&self) -> Recorded {
        self.recorded
            .lock()
            .map(|recorded| recorded.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        self.recorded
            .lock()
            .map_err(|_| QuantumSinkError::internal("recording lock poisoned"))?
            .connects += 1;
        Ok(Box::new(RecordingConnection {
            recorded: Arc::clone(&self.recorded),
            failure: Arc::clone(&self.failure),
        }))
    }
}

struct RecordingConnection {
    recorded: Arc<Mutex<Recorded>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingConnection {
    fn check_failure(&self) -> Result<()> {
        let failure = self
            .failure
            .lock()
            .map_err(|_| QuantumSinkError::internal("recording lock poisoned"))?;
        match failure.as_ref() {
            Some(message) => Err(QuantumSinkError::database(message.clone())),
            None => Ok(()),
        }
    }

    fn with_recorded<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> Result<T> {
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|_| QuantumSinkError::internal("recording lock poisoned"))?;
        Ok(f(&mut recorded))
    }
}

#[async_trait]
impl StoreConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.check_failure()?;
        self.with_recorded(|recorded| recorded.statements.push(sql.to_string()))?;
        Ok(0)
    }

    async fn copy_rows(&mut self, command: &CopyCommand, rows: Vec<Vec<ColumnValue>>) -> Result<u64> {
        self.check_failure()?;
        let count = rows.len() as u64;
        self.with_recorded(|recorded| {
            recorded.copies.push(RecordedCopy {
                sql: command.sql.clone(),
                rows,
            })
        })?;
        Ok(count)
    }

    async fn execute_insert(
        &mut self,
        statement: &InsertStatement,
        parameters: &[BoundParameter],
    ) -> Result<u64> {
        self.check_failure()?;
        self.with_recorded(|recorded| {
            recorded.inserts.push(RecordedInsert {
                sql: statement.sql.clone(),
                parameters: parameters.to_vec(),
            })
        })?;
        Ok(1)
    }

    async fn close(&mut self) -> Result<()> {
        self.with_recorded(|recorded| recorded.closes += 1)
    }
}

#[cfg(feature = "postgres")]
pub use self::pg::PgConnector;

#[cfg(feature = "postgres")]
mod pg {
    use super::{Connector, StoreConnection};
    use crate::error::{QuantumSinkError, Result};
    use crate::sinks::postgres::column_writers::{ColumnValue, SqlType};
    use crate::sinks::postgres::row_writer::{
        bind_positional, BoundParameter, CopyCommand, InsertStatement,
    };
    use async_trait::async_trait;
    use bytes::{BufMut, BytesMut};
    use chrono::DateTime;
    use std::error::Error as StdError;
    use std::fmt;
    use tokio::task::JoinHandle;
    use tokio_postgres::binary_copy::BinaryCopyInWriter;
    use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
    use tokio_postgres::{Client, CopyInSink, NoTls, Statement};
    use tracing::{debug, error};

    type BoxError = Box<dyn StdError + Sync + Send>;

    /// 基于 `tokio-postgres` 的连接器
    #[derive(Clone)]
    pub struct PgConnector {
        connection_string: String,
    }

    impl PgConnector {
        pub fn new<S: Into<String>>(connection_string: S) -> Self {
            Self {
                connection_string: connection_string.into(),
            }
        }
    }

    impl fmt::Debug for PgConnector {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("PgConnector")
                .field("connection_string", &"[REDACTED]")
                .finish()
        }
    }

    #[async_trait]
    impl Connector for PgConnector {
        async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
            let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls).await?;
            let driver = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("PostgreSQL 连接错误: {}", e);
                }
            });
            Ok(Box::new(PgConnection {
                client: Some(client),
                driver: Some(driver),
                prepared: None,
            }))
        }
    }

    struct PgConnection {
        client: Option<Client>,
        driver: Option<JoinHandle<()>>,
        prepared: Option<(String, Statement)>,
    }

    impl PgConnection {
        fn client(&self) -> Result<&Client> {
            self.client
                .as_ref()
                .ok_or_else(|| QuantumSinkError::database("connection already closed"))
        }
    }

    pub(super) fn pg_type(sql_type: SqlType) -> Type {
        match sql_type {
            SqlType::BigInt => Type::INT8,
            SqlType::Integer => Type::INT4,
            SqlType::SmallInt => Type::INT2,
            SqlType::DoublePrecision => Type::FLOAT8,
            SqlType::Real => Type::FLOAT4,
            SqlType::Numeric => Type::NUMERIC,
            SqlType::Boolean => Type::BOOL,
            SqlType::Char(_) => Type::BPCHAR,
            SqlType::Varchar(_) => Type::VARCHAR,
            SqlType::Text => Type::TEXT,
            SqlType::Date => Type::DATE,
            SqlType::Timestamp => Type::TIMESTAMP,
            SqlType::TimestampTz => Type::TIMESTAMPTZ,
            SqlType::Json => Type::JSON,
            SqlType::Jsonb => Type::JSONB,
        }
    }

    #[async_trait]
    impl StoreConnection for PgConnection {
        async fn execute(&mut self, sql: &str) -> Result<u64> {
            self.client()?.batch_execute(sql).await?;
            Ok(0)
        }

        async fn copy_rows(&mut self, command: &CopyCommand, rows: Vec<Vec<ColumnValue>>) -> Result<u64> {
            let types: Vec<Type> = command
                .columns
                .iter()
                .map(|column| pg_type(column.sql_type))
                .collect();
            let sink: CopyInSink<bytes::Bytes> = self.client()?.copy_in(command.sql.as_str()).await?;
            let writer = BinaryCopyInWriter::new(sink, &types);
            tokio::pin!(writer);
            for row in &rows {
                let values: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
                writer.as_mut().write(&values).await?;
            }
            let written = writer.finish().await?;
            debug!(rows = written, "COPY 完成");
            Ok(written)
        }

        async fn execute_insert(
            &mut self,
            statement: &InsertStatement,
            parameters: &[BoundParameter],
        ) -> Result<u64> {
            let positional = bind_positional(&statement.sql, parameters)?;
            let cached = matches!(&self.prepared, Some((sql, _)) if *sql == positional.sql);
            if !cached {
                let types: Vec<Type> = positional
                    .parameter_order
                    .iter()
                    .map(|index| pg_type(parameters[*index].sql_type))
                    .collect();
                let prepared = self.client()?.prepare_typed(&positional.sql, &types).await?;
                self.prepared = Some((positional.sql.clone(), prepared));
            }
            let prepared = match &self.prepared {
                Some((_, prepared)) => prepared.clone(),
                None => return Err(QuantumSinkError::internal("statement not prepared")),
            };
            let values: Vec<&(dyn ToSql + Sync)> = positional
                .parameter_order
                .iter()
                .map(|index| &parameters[*index].value as &(dyn ToSql + Sync))
                .collect();
            Ok(self.client()?.execute(&prepared, &values).await?)
        }

        async fn close(&mut self) -> Result<()> {
            self.prepared = None;
            drop(self.client.take());
            if let Some(driver) = self.driver.take() {
                driver
                    .await
                    .map_err(|e| QuantumSinkError::background_task(e.to_string()))?;
            }
            Ok(())
        }
    }

    impl ToSql for ColumnValue {
        fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
            match self {
                ColumnValue::Null => Ok(IsNull::Yes),
                ColumnValue::Bool(b) => match *ty {
                    Type::BOOL => b.to_sql(ty, out),
                    Type::INT2 | Type::INT4 | Type::INT8 => {
                        ColumnValue::Int(i64::from(*b)).to_sql(ty, out)
                    }
                    Type::JSON | Type::JSONB => serde_json::Value::Bool(*b).to_sql(ty, out),
                    _ => text_to_sql(&b.to_string(), ty, out),
                },
                ColumnValue::Int(i) => match *ty {
                    Type::INT8 => i.to_sql(ty, out),
                    Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                    Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                    Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                    Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                    Type::BOOL => (*i != 0).to_sql(ty, out),
                    Type::JSON | Type::JSONB => serde_json::Value::from(*i).to_sql(ty, out),
                    _ => text_to_sql(&i.to_string(), ty, out),
                },
                ColumnValue::Float(f) => match *ty {
                    Type::FLOAT8 => f.to_sql(ty, out),
                    Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                    Type::JSON | Type::JSONB => serde_json::Value::from(*f).to_sql(ty, out),
                    _ => text_to_sql(&f.to_string(), ty, out),
                },
                ColumnValue::Text(text) => text_to_sql(text, ty, out),
                ColumnValue::Timestamp(ts) => match *ty {
                    Type::TIMESTAMPTZ => ts.to_sql(ty, out),
                    Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                    Type::DATE => ts.date_naive().to_sql(ty, out),
                    Type::JSON | Type::JSONB => {
                        serde_json::Value::String(ts.to_rfc3339()).to_sql(ty, out)
                    }
                    _ => text_to_sql(&ts.to_rfc3339(), ty, out),
                },
                ColumnValue::Composite(value) => match *ty {
                    Type::JSON | Type::JSONB => value.to_json().to_sql(ty, out),
                    _ => text_to_sql(&value.to_string(), ty, out),
                },
            }
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        to_sql_checked!();
    }

    /// 按目标列类型解析文本值
    fn text_to_sql(text: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match *ty {
            Type::JSON | Type::JSONB => {
                let value = serde_json::from_str::<serde_json::Value>(text)
                    .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
                value.to_sql(ty, out)
            }
            Type::INT8 => text.trim().parse::<i64>()?.to_sql(ty, out),
            Type::INT4 => text.trim().parse::<i32>()?.to_sql(ty, out),
            Type::INT2 => text.trim().parse::<i16>()?.to_sql(ty, out),
            Type::FLOAT8 => text.trim().parse::<f64>()?.to_sql(ty, out),
            Type::FLOAT4 => text.trim().parse::<f32>()?.to_sql(ty, out),
            Type::BOOL => text.trim().to_lowercase().parse::<bool>()?.to_sql(ty, out),
            Type::NUMERIC => {
                encode_numeric(text, out)?;
                Ok(IsNull::No)
            }
            Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(text.trim())?.to_sql(ty, out),
            Type::TIMESTAMP => DateTime::parse_from_rfc3339(text.trim())?
                .naive_utc()
                .to_sql(ty, out),
            _ => text.to_sql(ty, out),
        }
    }

    /// NUMERIC 的二进制编码：位数、权重、符号、小数位数，然后是以 10000 为基的数字组
    pub(super) fn encode_numeric(text: &str, out: &mut BytesMut) -> std::result::Result<(), BoxError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("nan") {
            out.put_i16(0);
            out.put_i16(0);
            out.put_u16(0xC000);
            out.put_u16(0);
            return Ok(());
        }

        let (negative, unsigned) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !is_digits(int_part) || !is_digits(frac_part) {
            return Err(format!("invalid numeric value: {}", text).into());
        }

        let int_part = int_part.trim_start_matches('0');
        let int_digits = format!("{}{}", "0".repeat((4 - int_part.len() % 4) % 4), int_part);
        let frac_digits = format!("{}{}", frac_part, "0".repeat((4 - frac_part.len() % 4) % 4));

        let mut groups: Vec<i16> = Vec::new();
        for chunk in int_digits.as_bytes().chunks(4).chain(frac_digits.as_bytes().chunks(4)) {
            groups.push(std::str::from_utf8(chunk)?.parse::<i16>()?);
        }
        let mut weight = (int_digits.len() / 4) as i16 - 1;
        while groups.first() == Some(&0) {
            groups.remove(0);
            weight -= 1;
        }
        while groups.last() == Some(&0) {
            groups.pop();
        }
        let sign: u16 = if negative && !groups.is_empty() { 0x4000 } else { 0 };
        if groups.is_empty() {
            weight = 0;
        }

        out.put_i16(i16::try_from(groups.len())?);
        out.put_i16(weight);
        out.put_u16(sign);
        out.put_u16(u16::try_from(frac_part.len())?);
        for group in groups {
            out.put_i16(group);
        }
        Ok(())
    }

}
