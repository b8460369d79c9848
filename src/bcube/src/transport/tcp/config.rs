use serde::{Deserialize, Serialize};

use crate::transport::BindMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    pub bind: BindMode,
    pub bind_retries: u32,
    pub bind_retry_interval_ms: u64,
    pub connect_retries: usize,
    pub connect_retry_interval_ms: u64,
    pub hello_timeout_ms: u64,
    pub establish_timeout_ms: u64,
    pub max_message_size: usize,
    pub magic: u64,
    pub listen_backlog: i32,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            bind: BindMode::Wildcard,
            bind_retries: 10,
            bind_retry_interval_ms: 2000,
            connect_retries: 6000,
            connect_retry_interval_ms: 100,
            hello_timeout_ms: 5000,
            establish_timeout_ms: 600_000,
            // 1GB
            max_message_size: 1 << 30,
            magic: 0x4243_7562_6554_4350,
            listen_backlog: 128,
        }
    }
}
