//! Destination-side proposal handling
//!
//! A [`ProposalWriter`] drives one message at a time through vote and
//! execute on its chain. Its [`Transactor`] owns the chain's signing context.

use thiserror::Error;

use crate::chain::ChainError;
use crate::codec::EncodingError;
use crate::errors::RelayerError;
use crate::types::{ProposalStatus, ResourceId};

pub mod evm;
pub mod retry;
pub mod transactor;

pub use evm::{ProposalWriter, WriterConfig};
pub use retry::RetryConfig;
pub use transactor::{ConfirmationConfig, Submission, TransactError, Transactor};

/// Where a message ended up after the writer was done with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// This relayer's execute transaction was mined
    Executed,
    /// The proposal was already Executed or Cancelled
    AlreadyFinal(ProposalStatus),
    /// Voted, but the threshold was not reached within the watch limit
    AwaitingThreshold,
    /// Stop was signalled between steps
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriterError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The destination bridge has no handler for the resource
    #[error("no handler registered for resource {0}")]
    UnknownResource(ResourceId),

    #[error(transparent)]
    Transaction(#[from] TransactError),

    /// A proposal read kept failing
    #[error("bridge read failed: {0}")]
    Read(#[from] ChainError),
}

impl From<WriterError> for RelayerError {
    fn from(e: WriterError) -> Self {
        match e {
            WriterError::Encoding(e) => RelayerError::Encoding(e),
            WriterError::UnknownResource(_) => RelayerError::Configuration(e.to_string()),
            WriterError::Transaction(TransactError::Exhausted {
                attempts,
                last_error,
                ..
            }) => RelayerError::ExhaustedRetries {
                attempts,
                last_error,
            },
            WriterError::Transaction(TransactError::Rejected { call, reason }) => {
                RelayerError::ExhaustedRetries {
                    attempts: 1,
                    last_error: format!("{} rejected: {}", call, reason),
                }
            }
            WriterError::Read(ChainError::Rpc(msg)) | WriterError::Read(ChainError::Timeout(msg)) => {
                RelayerError::TransientNetwork(msg)
            }
            WriterError::Read(other) => RelayerError::Configuration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferType;

    #[test]
    fn test_writer_errors_map_to_policy_kinds() {
        let e: RelayerError = WriterError::UnknownResource(ResourceId::default()).into();
        assert_eq!(e.kind(), "configuration");

        let e: RelayerError = WriterError::Encoding(EncodingError::TransferTypeMismatch {
            declared: TransferType::Fungible,
            actual: TransferType::Generic,
        })
        .into();
        assert_eq!(e.kind(), "encoding");

        let e: RelayerError = WriterError::Transaction(TransactError::Exhausted {
            call: "voteProposal",
            attempts: 5,
            last_error: "nonce too low".into(),
        })
        .into();
        assert!(matches!(e, RelayerError::ExhaustedRetries { attempts: 5, .. }));
        assert!(!e.is_fatal_for_chain());

        let e: RelayerError = WriterError::Read(ChainError::Timeout("getProposal".into())).into();
        assert!(e.is_retryable());
    }
}
