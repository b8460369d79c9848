use serde::{Deserialize, Serialize};

use crate::transport::BindMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricTransportConfig {
    pub bind: BindMode,
    pub buffer_size: usize,
    pub listen_backlog: usize,
    pub resolve_timeout_ms: u64,
    pub cm_event_timeout_ms: u64,
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub reject_backoff_ms: u64,
    pub max_connect_attempts: usize,
    pub ready_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub establish_timeout_ms: u64,
}

impl Default for FabricTransportConfig {
    fn default() -> Self {
        FabricTransportConfig {
            bind: BindMode::Wildcard,
            // 512MB
            buffer_size: 1 << 29,
            listen_backlog: 1024,
            resolve_timeout_ms: 500,
            cm_event_timeout_ms: 5000,
            initiator_depth: 1,
            responder_resources: 1,
            retry_count: 7,
            rnr_retry_count: 7,
            reject_backoff_ms: 100,
            // about 600s with the default backoff
            max_connect_attempts: 6000,
            ready_timeout_ms: 60_000,
            poll_timeout_ms: 1000,
            establish_timeout_ms: 600_000,
        }
    }
}
