//! In-memory chain doubles for unit and integration tests
//!
//! [`FakeChain`] plays the source side, [`FakeBridge`] keeps destination
//! proposal state and [`FakeBackend`] accepts vote/execute transactions and
//! applies them to a bridge when one is attached.

#![allow(clippy::new_without_default)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;

use crate::chain::{
    BridgeCall, BridgeContract, ChainError, ChainReader, FeeSource, TransactionBackend, TxOptions,
};
use crate::codec;
use crate::contracts::bridge::Bridge;
use crate::router::MessageWriter;
use crate::types::{
    DepositNonce, DomainId, Message, MessageMetadata, Payload, Proposal, ProposalState,
    ProposalStatus, ResourceId, TransferType,
};
use crate::writers::{ProposalOutcome, WriterError};

/// ERC20 handler address used on both sides of the fake bridge
pub const HANDLER_ERC20: Address = Address::repeat_byte(0x20);

/// Resource every sample deposit and message carries
pub const SAMPLE_RESOURCE: ResourceId = ResourceId([0x11; 32]);

const SOURCE_BRIDGE: Address = Address::repeat_byte(0xb1);

fn recipient() -> Bytes {
    Bytes::from(vec![0xbb; 20])
}

/// Fungible deposit data as the ERC20 handler emits it
pub fn fungible_data(amount: u64) -> Bytes {
    codec::encode(
        TransferType::Fungible,
        &Payload::Fungible {
            amount: U256::from(amount),
            recipient: recipient(),
        },
    )
    .expect("fungible payload matches its transfer type")
}

/// A bridge `Deposit` log for [`SAMPLE_RESOURCE`]
pub fn deposit_log(block: u64, destination: DomainId, nonce: DepositNonce, data: Bytes) -> Log {
    let event = Bridge::Deposit {
        destinationDomainID: destination,
        resourceID: SAMPLE_RESOURCE.into(),
        depositNonce: nonce,
        user: Address::repeat_byte(0xaa),
        data,
        handlerResponse: Bytes::new(),
    };
    Log {
        inner: alloy::primitives::Log {
            address: SOURCE_BRIDGE,
            data: event.encode_log_data(),
        },
        block_number: Some(block),
        transaction_hash: Some(B256::left_padding_from(&nonce.to_be_bytes())),
        log_index: Some(0),
        ..Default::default()
    }
}

/// Fungible message for [`SAMPLE_RESOURCE`]
pub fn sample_message(source: DomainId, destination: DomainId, nonce: DepositNonce) -> Message {
    Message::new(
        source,
        destination,
        nonce,
        SAMPLE_RESOURCE,
        Payload::Fungible {
            amount: U256::from(1_000u64),
            recipient: recipient(),
        },
        MessageMetadata::default(),
    )
}

fn proposal_for(message: &Message, handler: Address) -> Proposal {
    let data = codec::encode(message.transfer_type, &message.payload)
        .expect("sample messages are well formed");
    Proposal::from_message(message, handler, data)
}

/// Proposal for `sample_message(1, 2, 1)` bound to [`HANDLER_ERC20`]
pub fn sample_proposal() -> Proposal {
    proposal_for(&sample_message(1, 2, 1), HANDLER_ERC20)
}

// ============================================================================
// Fees
// ============================================================================

/// Fee source returning fixed values
pub struct FixedFees {
    gas_price: u128,
    base_fee: Option<u128>,
    tip: u128,
}

impl FixedFees {
    /// Chain without EIP-1559
    pub fn legacy(gas_price: u128) -> Self {
        Self {
            gas_price,
            base_fee: None,
            tip: 0,
        }
    }

    pub fn london(base_fee: u128, tip: u128) -> Self {
        Self {
            gas_price: base_fee + tip,
            base_fee: Some(base_fee),
            tip,
        }
    }
}

#[async_trait]
impl FeeSource for FixedFees {
    async fn suggested_gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.gas_price)
    }

    async fn base_fee(&self) -> Result<Option<u128>, ChainError> {
        Ok(self.base_fee)
    }

    async fn suggested_priority_fee(&self) -> Result<u128, ChainError> {
        Ok(self.tip)
    }
}

// ============================================================================
// Source chain
// ============================================================================

struct ChainState {
    head: u64,
    logs: Vec<Log>,
    handler: Address,
    queries: Vec<(u64, u64)>,
    fail_next: Option<ChainError>,
}

/// Source chain with a settable head and a list of deposit logs
pub struct FakeChain {
    domain_id: DomainId,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(domain_id: DomainId) -> Self {
        Self {
            domain_id,
            state: Mutex::new(ChainState {
                head: 0,
                logs: Vec::new(),
                handler: HANDLER_ERC20,
                queries: Vec::new(),
                fail_next: None,
            }),
        }
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn push_log(&self, log: Log) {
        self.state.lock().unwrap().logs.push(log);
    }

    /// Handler the source bridge reports for every resource
    pub fn set_handler(&self, handler: Address) {
        self.state.lock().unwrap().handler = handler;
    }

    /// Every `(from, to)` range passed to `deposit_logs`
    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn fail_next_log_query(&self, error: ChainError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn deposit_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push((from_block, to_block));
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| b >= from_block && b <= to_block)
            })
            .cloned()
            .collect())
    }

    async fn resource_handler(&self, _resource_id: ResourceId) -> Result<Address, ChainError> {
        Ok(self.state.lock().unwrap().handler)
    }
}

// ============================================================================
// Destination bridge
// ============================================================================

type ProposalKey = (DomainId, DepositNonce, B256);

#[derive(Default)]
struct ProposalRecord {
    status: Option<ProposalStatus>,
    voters: HashSet<Address>,
    proposed_block: u64,
}

impl ProposalRecord {
    fn status(&self) -> ProposalStatus {
        self.status.unwrap_or(ProposalStatus::Inactive)
    }
}

struct BridgeState {
    threshold: usize,
    handlers: HashMap<ResourceId, Address>,
    proposals: HashMap<ProposalKey, ProposalRecord>,
    status_reads: usize,
    read_failures: VecDeque<ChainError>,
}

/// Destination bridge tallying votes against a relayer threshold
pub struct FakeBridge {
    state: Mutex<BridgeState>,
}

fn key(proposal: &Proposal) -> ProposalKey {
    (
        proposal.origin_domain_id,
        proposal.deposit_nonce,
        proposal.data_hash(),
    )
}

impl FakeBridge {
    /// Threshold 1, [`SAMPLE_RESOURCE`] bound to [`HANDLER_ERC20`]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState {
                threshold: 1,
                handlers: HashMap::from([(SAMPLE_RESOURCE, HANDLER_ERC20)]),
                proposals: HashMap::new(),
                status_reads: 0,
                read_failures: VecDeque::new(),
            }),
        }
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.state.lock().unwrap().threshold = threshold;
    }

    pub fn clear_handlers(&self) {
        self.state.lock().unwrap().handlers.clear();
    }

    /// Fail the next `get_proposal` calls, in order
    pub fn fail_next_reads(&self, errors: Vec<ChainError>) {
        self.state.lock().unwrap().read_failures.extend(errors);
    }

    /// Number of `get_proposal` calls served
    pub fn status_reads(&self) -> usize {
        self.state.lock().unwrap().status_reads
    }

    fn proposal_of(&self, message: &Message) -> Proposal {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handlers
            .get(&message.resource_id)
            .copied()
            .unwrap_or(HANDLER_ERC20);
        proposal_for(message, handler)
    }

    /// Current status of the proposal `message` maps to
    pub fn status_for(&self, message: &Message) -> ProposalStatus {
        let proposal = self.proposal_of(message);
        self.state
            .lock()
            .unwrap()
            .proposals
            .get(&key(&proposal))
            .map(ProposalRecord::status)
            .unwrap_or(ProposalStatus::Inactive)
    }

    /// Record a vote as if `relayer` had sent it
    pub fn record_vote_for(&self, message: &Message, relayer: Address) {
        let proposal = self.proposal_of(message);
        let _ = self.vote(&proposal, relayer);
    }

    pub fn force_status_for(&self, message: &Message, status: ProposalStatus) {
        let proposal = self.proposal_of(message);
        self.state
            .lock()
            .unwrap()
            .proposals
            .entry(key(&proposal))
            .or_default()
            .status = Some(status);
    }

    fn vote(&self, proposal: &Proposal, relayer: Address) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        let threshold = state.threshold;
        let record = state.proposals.entry(key(proposal)).or_default();

        match record.status() {
            ProposalStatus::Passed => {
                return Err(ChainError::Reverted("proposal already passed".into()))
            }
            ProposalStatus::Executed => {
                return Err(ChainError::Reverted("proposal already executed".into()))
            }
            ProposalStatus::Cancelled => {
                return Err(ChainError::Reverted("proposal already cancelled".into()))
            }
            ProposalStatus::Inactive | ProposalStatus::Active => {}
        }
        if !record.voters.insert(relayer) {
            return Err(ChainError::Reverted("relayer already voted".into()));
        }

        record.proposed_block = record.proposed_block.max(1);
        record.status = Some(if record.voters.len() >= threshold {
            ProposalStatus::Passed
        } else {
            ProposalStatus::Active
        });
        Ok(())
    }

    fn execute(&self, proposal: &Proposal) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        let record = state.proposals.entry(key(proposal)).or_default();
        match record.status() {
            ProposalStatus::Passed => {
                record.status = Some(ProposalStatus::Executed);
                Ok(())
            }
            ProposalStatus::Executed => Err(ChainError::Reverted("proposal already executed".into())),
            other => Err(ChainError::Reverted(format!("proposal not passed ({})", other))),
        }
    }
}

#[async_trait]
impl BridgeContract for FakeBridge {
    async fn resource_handler(&self, resource_id: ResourceId) -> Result<Address, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .handlers
            .get(&resource_id)
            .copied()
            .unwrap_or(Address::ZERO))
    }

    async fn get_proposal(
        &self,
        origin_domain_id: DomainId,
        deposit_nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalState, ChainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.read_failures.pop_front() {
            return Err(e);
        }
        state.status_reads += 1;
        Ok(state
            .proposals
            .get(&(origin_domain_id, deposit_nonce, data_hash))
            .map(|r| ProposalState {
                status: r.status(),
                yes_votes_total: r.voters.len() as u8,
                proposed_block: r.proposed_block,
            })
            .unwrap_or_else(ProposalState::inactive))
    }

    async fn has_voted(&self, proposal: &Proposal, relayer: Address) -> Result<bool, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .proposals
            .get(&key(proposal))
            .is_some_and(|r| r.voters.contains(&relayer)))
    }
}

// ============================================================================
// Transaction backend
// ============================================================================

/// How receipts are reported for accepted transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    /// Mined successfully right away
    Instant,
    /// The next accepted transaction never gets mined; later ones do
    NeverMinedOnce,
}

/// A transaction the backend accepted
#[derive(Debug, Clone)]
pub struct SentTx {
    pub call: &'static str,
    pub opts: TxOptions,
    pub tx_hash: B256,
    pub deposit_nonce: DepositNonce,
}

struct BackendState {
    chain_nonce: u64,
    failures: VecDeque<ChainError>,
    attempts: Vec<TxOptions>,
    sent: Vec<SentTx>,
    receipt_mode: ReceiptMode,
    stuck: HashSet<B256>,
}

/// Signer that records every send and tracks the chain's pending nonce
pub struct FakeBackend {
    sender: Address,
    bridge: Option<Arc<FakeBridge>>,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new(start_nonce: u64) -> Self {
        Self {
            sender: Address::repeat_byte(0x5e),
            bridge: None,
            state: Mutex::new(BackendState {
                chain_nonce: start_nonce,
                failures: VecDeque::new(),
                attempts: Vec::new(),
                sent: Vec::new(),
                receipt_mode: ReceiptMode::Instant,
                stuck: HashSet::new(),
            }),
        }
    }

    /// Apply accepted votes and executions to `bridge`
    pub fn with_bridge(mut self, bridge: Arc<FakeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_sender(mut self, sender: Address) -> Self {
        self.sender = sender;
        self
    }

    pub fn sender_address(&self) -> Address {
        self.sender
    }

    /// Fail the next sends, in order, before they reach the bridge
    pub fn fail_next_sends(&self, errors: Vec<ChainError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    /// Simulate transactions from another process using the same key
    pub fn set_chain_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().chain_nonce = nonce;
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state.lock().unwrap().receipt_mode = mode;
    }

    /// Options of every `send_call`, failed ones included
    pub fn attempts(&self) -> Vec<TxOptions> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Accepted transactions only
    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_calls(&self) -> Vec<&'static str> {
        self.sent().iter().map(|tx| tx.call).collect()
    }
}

#[async_trait]
impl TransactionBackend for FakeBackend {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().chain_nonce)
    }

    async fn send_call(&self, call: BridgeCall<'_>, opts: &TxOptions) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(*opts);
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }

        if let Some(bridge) = &self.bridge {
            match call {
                BridgeCall::Vote(p) => bridge.vote(p, self.sender)?,
                BridgeCall::Execute(p) => bridge.execute(p)?,
            }
        }

        let tx_hash = B256::left_padding_from(&(state.attempts.len() as u64).to_be_bytes());
        state.chain_nonce = state.chain_nonce.max(opts.nonce + 1);
        if state.receipt_mode == ReceiptMode::NeverMinedOnce {
            state.stuck.insert(tx_hash);
            state.receipt_mode = ReceiptMode::Instant;
        }
        state.sent.push(SentTx {
            call: call.name(),
            opts: *opts,
            tx_hash,
            deposit_nonce: call.proposal().deposit_nonce,
        });
        Ok(tx_hash)
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>, ChainError> {
        if self.state.lock().unwrap().stuck.contains(&tx_hash) {
            Ok(None)
        } else {
            Ok(Some(true))
        }
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Writer that records every message it is handed
pub struct RecordingWriter {
    received: Mutex<Vec<Message>>,
    reply: Result<ProposalOutcome, WriterError>,
}

impl Default for RecordingWriter {
    fn default() -> Self {
        Self::answering(Ok(ProposalOutcome::Executed))
    }
}

impl RecordingWriter {
    /// Records messages and answers each with `reply`
    pub fn answering(reply: Result<ProposalOutcome, WriterError>) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            reply,
        }
    }

    pub fn failing(error: WriterError) -> Self {
        Self::answering(Err(error))
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageWriter for RecordingWriter {
    async fn write(&self, message: Message) -> Result<ProposalOutcome, WriterError> {
        self.received.lock().unwrap().push(message);
        self.reply.clone()
    }
}
