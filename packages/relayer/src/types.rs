//! Common types for cross-chain messages and destination proposals
//!
//! A [`Message`] is what the listener builds from a deposit event and the
//! router hands to a writer. A [`Proposal`] is the destination-facing view of
//! the same transfer once its payload has been encoded.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::{bytes32_to_hex, proposal_data_hash};

/// Bridge-assigned identifier of a chain (the contract's `uint8 domainID`)
pub type DomainId = u8;

/// Per-route deposit counter assigned by the source bridge
pub type DepositNonce = u64;

// ============================================================================
// Resource IDs
// ============================================================================

/// 32-byte routing key binding a transfer to a handler/asset pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceId(pub [u8; 32]);

impl ResourceId {
    /// Parse from a 0x-prefixed (or bare) 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.strip_prefix("0x").unwrap_or(s), &mut out)?;
        Ok(Self(out))
    }
}

impl From<B256> for ResourceId {
    fn from(value: B256) -> Self {
        Self(value.0)
    }
}

impl From<ResourceId> for B256 {
    fn from(value: ResourceId) -> Self {
        B256::from(value.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes32_to_hex(&self.0))
    }
}

// ============================================================================
// Transfers
// ============================================================================

/// Kind of asset movement a deposit represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Fungible,
    NonFungible,
    Generic,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Fungible => "fungible",
            TransferType::NonFungible => "nonfungible",
            TransferType::Generic => "generic",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed transfer payload, one variant per [`TransferType`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Fungible {
        amount: U256,
        recipient: Bytes,
    },
    NonFungible {
        token_id: U256,
        recipient: Bytes,
        metadata: Bytes,
    },
    Generic {
        metadata: Bytes,
    },
}

impl Payload {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            Payload::Fungible { .. } => TransferType::Fungible,
            Payload::NonFungible { .. } => TransferType::NonFungible,
            Payload::Generic { .. } => TransferType::Generic,
        }
    }
}

/// Where on the source chain a message came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub block_number: u64,
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
    /// Raw `handlerResponse` bytes emitted with the deposit
    pub handler_response: Bytes,
}

/// Canonical cross-chain message passed from a listener to a writer
///
/// Identity is `(source, destination, deposit_nonce)`. The nonce is copied from
/// the source event and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: DomainId,
    pub destination: DomainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
    pub transfer_type: TransferType,
    pub payload: Payload,
    pub metadata: MessageMetadata,
}

impl Message {
    /// Build a message whose transfer type is taken from the payload variant
    pub fn new(
        source: DomainId,
        destination: DomainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        payload: Payload,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            source,
            destination,
            deposit_nonce,
            resource_id,
            transfer_type: payload.transfer_type(),
            payload,
            metadata,
        }
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            source: self.source,
            destination: self.destination,
            deposit_nonce: self.deposit_nonce,
        }
    }
}

/// Identity key of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub source: DomainId,
    pub destination: DomainId,
    pub deposit_nonce: DepositNonce,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}#{}", self.source, self.destination, self.deposit_nonce)
    }
}

// ============================================================================
// Proposals
// ============================================================================

/// Proposal status as stored by the destination bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStatus {
    Inactive,
    Active,
    Passed,
    Executed,
    Cancelled,
}

impl ProposalStatus {
    /// Executed and Cancelled proposals accept no further action
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Inactive => "inactive",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<u8> for ProposalStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProposalStatus::Inactive),
            1 => Ok(ProposalStatus::Active),
            2 => Ok(ProposalStatus::Passed),
            3 => Ok(ProposalStatus::Executed),
            4 => Ok(ProposalStatus::Cancelled),
            other => Err(other),
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-chain proposal record as observed through `getProposal`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalState {
    pub status: ProposalStatus,
    pub yes_votes_total: u8,
    pub proposed_block: u64,
}

impl ProposalState {
    pub fn inactive() -> Self {
        Self {
            status: ProposalStatus::Inactive,
            yes_votes_total: 0,
            proposed_block: 0,
        }
    }
}

/// Destination-facing representation of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub origin_domain_id: DomainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
    /// Handler contract on the destination chain bound to `resource_id`
    pub handler: Address,
    /// Codec output for the message payload
    pub data: Bytes,
    pub metadata: MessageMetadata,
}

impl Proposal {
    pub fn from_message(message: &Message, handler: Address, data: Bytes) -> Self {
        Self {
            origin_domain_id: message.source,
            deposit_nonce: message.deposit_nonce,
            resource_id: message.resource_id,
            handler,
            data,
            metadata: message.metadata.clone(),
        }
    }

    /// Identity hash the destination bridge tallies votes under
    pub fn data_hash(&self) -> B256 {
        B256::from(proposal_data_hash(&self.handler, &self.data))
    }

    /// `(depositNonce << 8) | originDomainID`, the key used by `_hasVotedOnProposal`
    pub fn nonce_and_id(&self) -> u128 {
        (u128::from(self.deposit_nonce) << 8) | u128::from(self.origin_domain_id)
    }
}
