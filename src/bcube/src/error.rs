use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::message::MessageError;
use crate::pipeline::PipelineError;
use crate::strategy::StrategyError;
use crate::tensor::TensorError;
use crate::topology::TopologyError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("Strategy: {0}")]
    Strategy(#[from] StrategyError),
    #[error("Tensor: {0}")]
    Tensor(#[from] TensorError),
    #[error("Message: {0}")]
    Message(#[from] MessageError),
    #[error("Config: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport: {0}")]
    Transport(TransportError),
    #[error("Pipeline: {0}")]
    Pipeline(PipelineError),
    #[error("Fragments of {name} did not arrive within {timeout:?}")]
    RecvTimeout { name: String, timeout: Duration },
    #[error("Unrecoverable fault: {0}")]
    Fault(String),
}

impl Error {
    /// Whether the engine can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fault(_) | Error::RecvTimeout { .. } | Error::Pipeline(PipelineError::Poisoned)
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Fault(msg) => Error::Fault(msg),
            err if err.is_unrecoverable() => Error::Fault(err.to_string()),
            err => Error::Transport(err),
        }
    }
}

impl From<PipelineError> for Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Fault(err) => err.into(),
            PipelineError::Transport { lane, source } if source.is_unrecoverable() => {
                Error::Fault(format!("lane {}: {}", lane, source))
            }
            err => Error::Pipeline(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_are_fatal() {
        let err: Error = TransportError::Fault("poller: wc error".to_string()).into();
        assert!(matches!(err, Error::Fault(ref msg) if msg == "poller: wc error"));
        assert!(err.is_fatal());

        let err: Error = TransportError::Disconnected(3).into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!err.is_fatal());

        let err: Error = PipelineError::Transport {
            lane: 1,
            source: TransportError::ShortWrite {
                peer: 2,
                written: 3,
                expected: 10,
            },
        }
        .into();
        assert!(err.is_fatal());
    }
}
