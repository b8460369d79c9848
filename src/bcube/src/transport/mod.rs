pub mod fabric;
pub mod tcp;
pub mod transporter;

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageError;
use fabric::FabricError;

pub use transporter::{LinkRef, PeerLink, Transport, TransportContext, Transporter};

/// Default public port shared by every node.
pub const DEFAULT_LISTEN_PORT: u16 = 9610;

/// How the listening side binds the public port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    // one listener on 0.0.0.0
    Wildcard,
    // one listener on each local per-level address
    PerLevel,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("Gave up connecting {local} -> {remote} after {attempts} attempts")]
    ConnectTimeout {
        local: SocketAddr,
        remote: SocketAddr,
        attempts: usize,
    },
    #[error("Only {established} of {expected} connections established within {timeout:?}")]
    EstablishTimeout {
        established: usize,
        expected: usize,
        timeout: Duration,
    },
    #[error("Connection from {0} is not a one-hop neighbor")]
    UnexpectedPeer(String),
    #[error("Duplicate connection from node {0}")]
    DuplicatePeer(usize),
    #[error("Unexpected connection event {event} in state {state}")]
    UnexpectedEvent { state: String, event: String },
    #[error("Short write to node {peer}: {written} of {expected} bytes")]
    ShortWrite {
        peer: usize,
        written: usize,
        expected: usize,
    },
    #[error("Message of {len} bytes exceeds the {capacity} byte buffer of node {peer}")]
    PayloadTooLarge {
        peer: usize,
        len: usize,
        capacity: usize,
    },
    #[error("Node {peer} did not become ready within {timeout:?}")]
    ReadyTimeout { peer: usize, timeout: Duration },
    #[error("Connection to node {0} is closed")]
    Disconnected(usize),
    #[error("Fabric: {0}")]
    Fabric(#[from] FabricError),
    #[error("Message: {0}")]
    Message(#[from] MessageError),
    #[error("Unrecoverable fault: {0}")]
    Fault(String),
}

impl TransportError {
    /// Faults raised by background threads or by the driver; the process
    /// cannot make progress after one of these.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Fault(_)
                | TransportError::Fabric(_)
                | TransportError::ShortWrite { .. }
                | TransportError::Message(_)
        )
    }
}

/// First unrecoverable fault seen by any transport thread.
#[derive(Debug, Default)]
pub struct FaultSlot(OnceCell<String>);

impl FaultSlot {
    pub fn new() -> Self {
        FaultSlot(OnceCell::new())
    }

    pub fn record<E: Display>(&self, context: &str, err: E) {
        let msg = format!("{}: {}", context, err);
        log::error!("{}", msg);
        if self.0.set(msg).is_err() {
            log::debug!("Fault already recorded, keeping the first one");
        }
    }

    pub fn check(&self) -> Result<(), TransportError> {
        match self.0.get() {
            Some(msg) => Err(TransportError::Fault(msg.clone())),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}
