//! Chain collaborator interfaces
//!
//! Each component depends only on the capability set it needs:
//!
//! - [`ChainReader`]: the listener's view of a source chain (head, deposit logs,
//!   handler lookup)
//! - [`BridgeContract`]: the writer's proposal reads on a destination chain
//! - [`TransactionBackend`]: raw vote/execute submission with caller-chosen
//!   nonce and gas
//! - [`FeeSource`]: fee inputs for the gas pricers
//!
//! [`evm::EvmClient`] implements all four over alloy; tests substitute the
//! in-memory doubles from [`crate::testing`].

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DepositNonce, DomainId, Proposal, ProposalState, ResourceId};

pub mod evm;
pub mod gas;

pub use evm::EvmClient;
pub use gas::{GasPrice, GasPricer, GasSettings, LondonGasPricer, StaticGasPricer};

/// Failure talking to a chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Transport or node-side error; message text is kept for classification
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Call or transaction reverted; carries the revert reason when known
    #[error("reverted: {0}")]
    Reverted(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Contract answered with something the relayer cannot interpret
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A bridge write the relayer can submit
#[derive(Debug, Clone, Copy)]
pub enum BridgeCall<'a> {
    Vote(&'a Proposal),
    Execute(&'a Proposal),
}

impl BridgeCall<'_> {
    pub fn proposal(&self) -> &Proposal {
        match self {
            BridgeCall::Vote(p) | BridgeCall::Execute(p) => p,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeCall::Vote(_) => "voteProposal",
            BridgeCall::Execute(_) => "executeProposal",
        }
    }
}

/// Transaction parameters chosen under the signing-context lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: GasPrice,
}

/// Source chain reads used by the listener
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current head block number
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// All bridge `Deposit` logs in `[from_block, to_block]`, in chain order
    async fn deposit_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, ChainError>;

    /// Handler registered for `resource_id` on this chain's bridge
    async fn resource_handler(&self, resource_id: ResourceId) -> Result<Address, ChainError>;
}

/// Destination chain proposal reads used by the writer
#[async_trait]
pub trait BridgeContract: Send + Sync {
    async fn resource_handler(&self, resource_id: ResourceId) -> Result<Address, ChainError>;

    async fn get_proposal(
        &self,
        origin_domain_id: DomainId,
        deposit_nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalState, ChainError>;

    async fn has_voted(&self, proposal: &Proposal, relayer: Address) -> Result<bool, ChainError>;
}

/// Signed transaction submission on a destination chain
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    /// The relayer's signing address
    fn sender(&self) -> Address;

    /// Next nonce for the sender, including pending transactions
    async fn pending_nonce(&self) -> Result<u64, ChainError>;

    /// Sign and broadcast a bridge call. Returns once the node accepted it.
    async fn send_call(&self, call: BridgeCall<'_>, opts: &TxOptions) -> Result<B256, ChainError>;

    /// `Some(success)` once mined, `None` while pending
    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>, ChainError>;
}

/// Fee market inputs for gas pricing
#[async_trait]
pub trait FeeSource: Send + Sync {
    /// Node-suggested legacy gas price
    async fn suggested_gas_price(&self) -> Result<u128, ChainError>;

    /// Base fee of the latest block, `None` on chains without EIP-1559
    async fn base_fee(&self) -> Result<Option<u128>, ChainError>;

    /// Node-suggested priority fee
    async fn suggested_priority_fee(&self) -> Result<u128, ChainError>;
}
