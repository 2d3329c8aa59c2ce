//! 环境变量配置模块
//!
//! 连接字符串等敏感信息优先从环境变量读取，避免写进配置文件。

use std::env;

/// 覆盖连接字符串的环境变量
pub const CONNECTION_STRING_VAR: &str = "QUANTUM_PG_CONNECTION_STRING";
/// 覆盖模式名的环境变量
pub const SCHEMA_VAR: &str = "QUANTUM_PG_SCHEMA";

/// 环境变量配置管理器
pub struct EnvConfig;

impl EnvConfig {
    /// 从环境变量读取连接字符串；未设置或为空时返回 None
    pub fn connection_string() -> Option<String> {
        Self::non_empty(CONNECTION_STRING_VAR)
    }

    /// 从环境变量读取模式名
    pub fn schema_name() -> Option<String> {
        Self::non_empty(SCHEMA_VAR)
    }

    fn non_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.trim().is_empty())
    }
}
