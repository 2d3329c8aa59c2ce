//! PostgreSQL 集成测试
//!
//! 此测试需要可访问的 PostgreSQL 实例
//! 运行前请设置 QUANTUM_PG_CONNECTION_STRING，例如:
//! `host=localhost user=postgres password=postgres dbname=postgres`
//!
//! cargo test --test postgres_integration -- --ignored

#![cfg(feature = "postgres")]

use quantum_pg_sink::diagnostics::Diagnostics;
use quantum_pg_sink::env_config::EnvConfig;
use quantum_pg_sink::sinks::postgres::{
    AuditSink, ColumnOptions, ColumnWriter, CorrelationOptions, PgConnector, PostgresSink,
    PropertyWriteMethod, SinkOptions, SqlType,
};
use quantum_pg_sink::{LogEvent, LogLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;

fn connection_string() -> String {
    EnvConfig::connection_string()
        .expect("QUANTUM_PG_CONNECTION_STRING environment variable is required")
}

async fn count_rows(schema: &str, table: &str) -> i64 {
    let (client, connection) = tokio_postgres::connect(&connection_string(), NoTls)
        .await
        .expect("Failed to connect");
    tokio::spawn(connection);
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM \"{}\".\"{}\"", schema, table), &[])
        .await
        .expect("Failed to count rows");
    row.get(0)
}

async fn drop_schema(schema: &str) {
    let (client, connection) = tokio_postgres::connect(&connection_string(), NoTls)
        .await
        .expect("Failed to connect");
    tokio::spawn(connection);
    client
        .batch_execute(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE;", schema))
        .await
        .expect("Failed to drop schema");
}

fn columns() -> ColumnOptions {
    ColumnOptions::default_columns()
        .with_column("log_event", ColumnWriter::serialized_event())
        .with_column(
            "user_id",
            ColumnWriter::single_property("UserId", PropertyWriteMethod::Raw)
                .with_sql_type(SqlType::Integer),
        )
        .with_column(
            "path",
            ColumnWriter::nested_property("Request", "Path", true, None)
                .with_sql_type(SqlType::Varchar(200)),
        )
}

#[tokio::test]
#[ignore] // 默认忽略，需要手动运行
async fn test_copy_and_insert_round_trip() {
    let schema = "quantum_pg_sink_it";
    drop_schema(schema).await;

    for (table, use_copy) in [("copy_logs", true), ("insert_logs", false)] {
        let options = SinkOptions::new(connection_string(), table)
            .with_schema(schema)
            .with_columns(columns())
            .with_use_copy(use_copy)
            .with_auto_create(true, true)
            .with_batch_size_limit(10)
            .with_period(Duration::from_millis(200))
            .with_correlation(CorrelationOptions {
                enabled: false,
                ..CorrelationOptions::default()
            });
        let sink = PostgresSink::start_with_diagnostics(
            options.clone(),
            Arc::new(PgConnector::new(connection_string())),
            Arc::new(Diagnostics::new()),
        )
        .expect("Failed to start sink");

        for i in 0..25 {
            sink.emit(
                LogEvent::new(LogLevel::Information, "Request {UserId} #{N}")
                    .with_property("UserId", 42i64)
                    .with_property("N", i as i64),
            )
            .expect("Failed to emit");
        }
        sink.shutdown().await.expect("Failed to shut down");

        let snapshot = sink.diagnostics().snapshot();
        assert_eq!(snapshot.batch_failures, 0, "table {}", table);
        assert_eq!(count_rows(schema, table).await, 25);
    }

    drop_schema(schema).await;
}

#[tokio::test]
#[ignore]
async fn test_audit_sink_reports_missing_table() {
    let audit = AuditSink::with_diagnostics(
        SinkOptions::new(connection_string(), "quantum_pg_sink_missing_table"),
        Arc::new(PgConnector::new(connection_string())),
        Arc::new(Diagnostics::new()),
    )
    .expect("Failed to create audit sink");

    let result = audit.emit(LogEvent::new(LogLevel::Error, "never stored")).await;
    assert!(result.is_err());
}
