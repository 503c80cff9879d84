//! EVM Writer - Drives proposals to execution on a destination bridge
//!
//! For each message: encode the payload, derive the proposal identity, vote
//! unless this relayer already did, then watch the proposal until it passes
//! and execute it. Every action is preceded by an on-chain read so that
//! replaying a message after a restart only repeats what is still missing.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::retry::{with_retry, RetryConfig};
use super::transactor::{Submission, TransactError, Transactor};
use super::{ProposalOutcome, WriterError};
use crate::chain::{BridgeCall, BridgeContract};
use crate::codec;
use crate::hash::bytes32_to_hex;
use crate::metrics::Metrics;
use crate::router::MessageWriter;
use crate::types::{DomainId, Message, Proposal, ProposalState, ProposalStatus};

/// Per-chain writer settings
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub domain_id: DomainId,
    /// Interval between proposal status polls
    pub poll_interval: Duration,
    /// Maximum status polls after voting before giving up on this message
    pub execute_watch_limit: u32,
}

pub struct ProposalWriter {
    config: WriterConfig,
    bridge: Arc<dyn BridgeContract>,
    transactor: Transactor,
    relayer: Address,
    read_retry: RetryConfig,
    stop: watch::Receiver<bool>,
    /// Held for the whole of one message
    inbox: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl ProposalWriter {
    pub fn new(
        config: WriterConfig,
        bridge: Arc<dyn BridgeContract>,
        transactor: Transactor,
        read_retry: RetryConfig,
        stop: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let relayer = transactor.sender();
        info!(
            domain_id = config.domain_id,
            relayer = %relayer,
            execute_watch_limit = config.execute_watch_limit,
            "Proposal writer initialized"
        );
        Self {
            config,
            bridge,
            transactor,
            relayer,
            read_retry,
            stop,
            inbox: Mutex::new(()),
            metrics,
        }
    }

    pub fn domain_id(&self) -> DomainId {
        self.config.domain_id
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Process one message from encoding to its final outcome
    async fn process(&self, message: Message) -> Result<ProposalOutcome, WriterError> {
        let data = codec::encode(message.transfer_type, &message.payload)?;

        let bridge = &self.bridge;
        let resource_id = message.resource_id;
        let handler = with_retry(&self.read_retry, "_resourceIDToHandlerAddress", move || {
            bridge.resource_handler(resource_id)
        })
        .await?;
        if handler == Address::ZERO {
            return Err(WriterError::UnknownResource(resource_id));
        }

        let proposal = Proposal::from_message(&message, handler, data);
        debug!(
            domain_id = self.domain_id(),
            message = %message.id(),
            handler = %handler,
            data_hash = %bytes32_to_hex(&proposal.data_hash().0),
            "Proposal built"
        );

        let state = self.read_state(&proposal).await?;
        match state.status {
            status if status.is_terminal() => {
                info!(
                    domain_id = self.domain_id(),
                    message = %message.id(),
                    %status,
                    "Proposal already final, nothing to do"
                );
                return Ok(ProposalOutcome::AlreadyFinal(status));
            }
            ProposalStatus::Passed => return self.execute(&proposal).await,
            _ => {}
        }

        if self.has_voted(&proposal).await? {
            info!(
                domain_id = self.domain_id(),
                message = %message.id(),
                "Already voted, watching proposal"
            );
        } else if let Some(outcome) = self.vote(&proposal).await? {
            return Ok(outcome);
        }

        self.watch_and_execute(&proposal).await
    }

    async fn read_state(&self, proposal: &Proposal) -> Result<ProposalState, WriterError> {
        let bridge = &self.bridge;
        let (origin, nonce, data_hash) = (
            proposal.origin_domain_id,
            proposal.deposit_nonce,
            proposal.data_hash(),
        );
        Ok(with_retry(&self.read_retry, "getProposal", move || {
            bridge.get_proposal(origin, nonce, data_hash)
        })
        .await?)
    }

    async fn has_voted(&self, proposal: &Proposal) -> Result<bool, WriterError> {
        let bridge = &self.bridge;
        let relayer = self.relayer;
        Ok(with_retry(&self.read_retry, "_hasVotedOnProposal", move || {
            bridge.has_voted(proposal, relayer)
        })
        .await?)
    }

    /// Cast this relayer's vote. Returns an outcome only when the proposal
    /// turned out to be final already.
    async fn vote(&self, proposal: &Proposal) -> Result<Option<ProposalOutcome>, WriterError> {
        match self.transactor.submit(BridgeCall::Vote(proposal)).await {
            Ok(Submission::Confirmed(tx_hash)) => {
                self.metrics.vote_submitted(self.domain_id());
                info!(
                    domain_id = self.domain_id(),
                    deposit_nonce = proposal.deposit_nonce,
                    origin = proposal.origin_domain_id,
                    tx_hash = %tx_hash,
                    "Vote submitted"
                );
                Ok(None)
            }
            Ok(Submission::AlreadyProcessed) => Ok(None),
            Err(e) => {
                // A competing relayer may have moved the proposal on under us
                let state = self.read_state(proposal).await?;
                if state.status.is_terminal() {
                    return Ok(Some(ProposalOutcome::AlreadyFinal(state.status)));
                }
                if state.status == ProposalStatus::Passed || self.has_voted(proposal).await? {
                    warn!(
                        domain_id = self.domain_id(),
                        deposit_nonce = proposal.deposit_nonce,
                        error = %e,
                        "Vote failed but proposal progressed, continuing"
                    );
                    return Ok(None);
                }
                Err(e.into())
            }
        }
    }

    /// Poll until the proposal passes, then execute it
    async fn watch_and_execute(&self, proposal: &Proposal) -> Result<ProposalOutcome, WriterError> {
        let mut stop = self.stop.clone();

        for poll in 0..self.config.execute_watch_limit {
            if self.stopping() {
                return Ok(ProposalOutcome::Interrupted);
            }

            let state = self.read_state(proposal).await?;
            match state.status {
                ProposalStatus::Passed => return self.execute(proposal).await,
                status if status.is_terminal() => return Ok(ProposalOutcome::AlreadyFinal(status)),
                status => {
                    debug!(
                        domain_id = self.domain_id(),
                        deposit_nonce = proposal.deposit_nonce,
                        %status,
                        yes_votes = state.yes_votes_total,
                        poll,
                        "Waiting for vote threshold"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                Ok(()) = stop.changed() => {}
            }
        }

        info!(
            domain_id = self.domain_id(),
            deposit_nonce = proposal.deposit_nonce,
            origin = proposal.origin_domain_id,
            polls = self.config.execute_watch_limit,
            "Proposal did not pass within watch limit"
        );
        Ok(ProposalOutcome::AwaitingThreshold)
    }

    async fn execute(&self, proposal: &Proposal) -> Result<ProposalOutcome, WriterError> {
        match self.transactor.submit(BridgeCall::Execute(proposal)).await {
            Ok(Submission::Confirmed(tx_hash)) => {
                self.metrics.execution_submitted(self.domain_id());
                info!(
                    domain_id = self.domain_id(),
                    deposit_nonce = proposal.deposit_nonce,
                    origin = proposal.origin_domain_id,
                    tx_hash = %tx_hash,
                    "Proposal executed"
                );
                Ok(ProposalOutcome::Executed)
            }
            Ok(Submission::AlreadyProcessed) => self.settle_after_execute(proposal, None).await,
            Err(e) => self.settle_after_execute(proposal, Some(e)).await,
        }
    }

    /// Another relayer may have executed first
    async fn settle_after_execute(
        &self,
        proposal: &Proposal,
        error: Option<TransactError>,
    ) -> Result<ProposalOutcome, WriterError> {
        let state = self.read_state(proposal).await?;
        if state.status.is_terminal() {
            return Ok(ProposalOutcome::AlreadyFinal(state.status));
        }
        match error {
            Some(e) => Err(e.into()),
            None => Ok(ProposalOutcome::AlreadyFinal(ProposalStatus::Executed)),
        }
    }
}

#[async_trait]
impl MessageWriter for ProposalWriter {
    async fn write(&self, message: Message) -> Result<ProposalOutcome, WriterError> {
        let _turn = self.inbox.lock().await;
        if self.stopping() {
            return Ok(ProposalOutcome::Interrupted);
        }

        let id = message.id();
        let outcome = self.process(message).await;
        match &outcome {
            Ok(o) => debug!(domain_id = self.domain_id(), message = %id, outcome = ?o, "Message done"),
            Err(e) => warn!(domain_id = self.domain_id(), message = %id, error = %e, "Message failed"),
        }
        outcome
    }
}
