//! Relayer error kinds and the shared error-reporting channel
//!
//! Waiting for confirmations and benign "already voted/executed" reverts are
//! handled as control flow and never show up here.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::EncodingError;
use crate::types::DomainId;

#[derive(Debug, Clone, Error)]
pub enum RelayerError {
    /// RPC timeout or connection failure
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Missing writer or handler for a route
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Repeated transaction failure on a destination chain
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    /// Checkpoint persistence failure
    #[error("block store error: {0}")]
    Store(String),

    /// Log shape does not match the bridge ABI
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Voted, but the proposal was neither passed nor final when the writer
    /// stopped watching it
    #[error("proposal not finalized: {0}")]
    UnfinishedProposal(String),
}

impl RelayerError {
    /// Only network failures are worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayerError::TransientNetwork(_))
    }

    /// Whether the listener for the affected chain must stop
    pub fn is_fatal_for_chain(&self) -> bool {
        matches!(
            self,
            RelayerError::Store(_) | RelayerError::MalformedEvent(_)
        )
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::TransientNetwork(_) => "transient_network",
            RelayerError::Configuration(_) => "configuration",
            RelayerError::Encoding(_) => "encoding",
            RelayerError::ExhaustedRetries { .. } => "exhausted_retries",
            RelayerError::Store(_) => "store",
            RelayerError::MalformedEvent(_) => "malformed_event",
            RelayerError::UnfinishedProposal(_) => "unfinished_proposal",
        }
    }
}

/// Which worker raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Listener,
    Writer,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Listener => f.write_str("listener"),
            Component::Writer => f.write_str("writer"),
        }
    }
}

/// One entry on the shared error channel
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub domain_id: DomainId,
    pub component: Component,
    pub error: RelayerError,
}

pub type ErrorSender = mpsc::UnboundedSender<ErrorReport>;
pub type ErrorReceiver = mpsc::UnboundedReceiver<ErrorReport>;

/// Many producers, one consumer. Sending never blocks.
pub fn error_channel() -> (ErrorSender, ErrorReceiver) {
    mpsc::unbounded_channel()
}

/// Report an error without caring whether the consumer is still alive
pub fn report(sender: &ErrorSender, domain_id: DomainId, component: Component, error: RelayerError) {
    if sender
        .send(ErrorReport {
            domain_id,
            component,
            error,
        })
        .is_err()
    {
        tracing::warn!(domain_id, %component, "Error channel closed, report dropped");
    }
}
