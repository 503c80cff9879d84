//! Serialized transaction submission for one destination chain
//!
//! Nonce selection, gas pricing and broadcast happen while holding the
//! signing-context lock. Waiting for the receipt happens after it is
//! released so the next call can go out without waiting on block time.
//! A transaction that is not mined in time is replaced at the same nonce
//! with a bumped price, never duplicated at a new one.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::retry::{ErrorClass, RetryAction, RetryConfig, RetryContext};
use crate::chain::{BridgeCall, ChainError, GasPricer, TransactionBackend, TxOptions};
use crate::metrics::Metrics;
use crate::types::DomainId;

/// Receipt polling bounds
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

/// How a submitted call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Mined with success status
    Confirmed(B256),
    /// The bridge reported the effect as already applied
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactError {
    #[error("{call} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        call: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// Failure that no retry can fix
    #[error("{call} rejected: {reason}")]
    Rejected { call: &'static str, reason: String },
}

/// State guarded by the signing lock
#[derive(Debug, Default)]
struct SigningContext {
    /// Next nonce to use; `None` means ask the chain
    next_nonce: Option<u64>,
}

pub struct Transactor {
    domain_id: DomainId,
    backend: Arc<dyn TransactionBackend>,
    pricer: Arc<dyn GasPricer>,
    gas_limit: u64,
    max_gas_price: Option<u128>,
    retry: RetryConfig,
    confirmation: ConfirmationConfig,
    context: Mutex<SigningContext>,
    metrics: Arc<Metrics>,
}

impl Transactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain_id: DomainId,
        backend: Arc<dyn TransactionBackend>,
        pricer: Arc<dyn GasPricer>,
        gas_limit: u64,
        max_gas_price: Option<u128>,
        retry: RetryConfig,
        confirmation: ConfirmationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            domain_id,
            backend,
            pricer,
            gas_limit,
            max_gas_price,
            retry,
            confirmation,
            context: Mutex::new(SigningContext::default()),
            metrics,
        }
    }

    /// Address that signs every call
    pub fn sender(&self) -> Address {
        self.backend.sender()
    }

    /// Submit `call` and wait until it is mined, retrying per the retry policy
    pub async fn submit(&self, call: BridgeCall<'_>) -> Result<Submission, TransactError> {
        let mut ctx = RetryContext::with_config(self.retry.clone());
        let mut bumps = 0u32;
        // Nonce of a broadcast transaction that never got mined
        let mut replacing: Option<u64> = None;

        loop {
            let error = match self.send_once(call, bumps, replacing).await {
                Ok((tx_hash, nonce)) => match self.wait_for_receipt(tx_hash).await {
                    Ok(true) => {
                        info!(
                            domain_id = self.domain_id,
                            call = call.name(),
                            tx_hash = %tx_hash,
                            "Transaction confirmed"
                        );
                        return Ok(Submission::Confirmed(tx_hash));
                    }
                    Ok(false) => {
                        replacing = None;
                        ChainError::Reverted(format!("transaction {} reverted", tx_hash))
                    }
                    Err(e) => {
                        warn!(
                            domain_id = self.domain_id,
                            call = call.name(),
                            nonce,
                            tx_hash = %tx_hash,
                            "Transaction not mined, replacing at the same nonce"
                        );
                        replacing = Some(nonce);
                        bumps += 1;
                        e
                    }
                },
                Err(e) => e,
            };

            let class = ctx.record_failure(&error);
            match ctx.next_action() {
                RetryAction::AlreadyProcessed => {
                    info!(
                        domain_id = self.domain_id,
                        call = call.name(),
                        reason = %error,
                        "Bridge already has this call applied"
                    );
                    return Ok(Submission::AlreadyProcessed);
                }
                RetryAction::GiveUp => {
                    return Err(match class {
                        ErrorClass::Permanent => TransactError::Rejected {
                            call: call.name(),
                            reason: ctx.last_error(),
                        },
                        _ => TransactError::Exhausted {
                            call: call.name(),
                            attempts: ctx.attempt,
                            last_error: ctx.last_error(),
                        },
                    });
                }
                RetryAction::RetryWithBump(backoff) => {
                    bumps += 1;
                    self.schedule_retry(call, &ctx, class, backoff).await;
                }
                RetryAction::RefreshNonce(backoff) => {
                    // The replaced transaction (or another one) got mined
                    replacing = None;
                    self.reset_nonce().await;
                    self.schedule_retry(call, &ctx, class, backoff).await;
                }
                RetryAction::RetryAfter(backoff) => {
                    self.schedule_retry(call, &ctx, class, backoff).await;
                }
            }
        }
    }

    async fn schedule_retry(
        &self,
        call: BridgeCall<'_>,
        ctx: &RetryContext,
        class: ErrorClass,
        backoff: Duration,
    ) {
        warn!(
            domain_id = self.domain_id,
            call = call.name(),
            attempt = ctx.attempt,
            max = self.retry.max_retries,
            ?class,
            ?backoff,
            error = %ctx.last_error(),
            "Retrying transaction"
        );
        self.metrics
            .tx_retry(self.domain_id, &format!("{:?}", class).to_lowercase());
        sleep(backoff).await;
    }

    /// Pick nonce and gas, then broadcast, all under the signing lock.
    /// `replacing` pins the nonce of a stuck transaction.
    async fn send_once(
        &self,
        call: BridgeCall<'_>,
        bumps: u32,
        replacing: Option<u64>,
    ) -> Result<(B256, u64), ChainError> {
        let mut signing = self.context.lock().await;

        let nonce = match (replacing, signing.next_nonce) {
            (Some(n), _) | (None, Some(n)) => n,
            (None, None) => self.backend.pending_nonce().await?,
        };

        let mut gas_price = self.pricer.gas_price().await?;
        for _ in 0..bumps {
            gas_price = gas_price.bumped(self.retry.gas_bump_percent, self.max_gas_price);
        }

        let opts = TxOptions {
            nonce,
            gas_limit: self.gas_limit,
            gas_price,
        };

        match self.backend.send_call(call, &opts).await {
            Ok(tx_hash) => {
                signing.next_nonce = Some(signing.next_nonce.unwrap_or(0).max(nonce + 1));
                debug!(
                    domain_id = self.domain_id,
                    call = call.name(),
                    nonce,
                    ?gas_price,
                    tx_hash = %tx_hash,
                    "Transaction submitted"
                );
                Ok((tx_hash, nonce))
            }
            Err(e) => {
                signing.next_nonce = None;
                Err(e)
            }
        }
    }

    async fn reset_nonce(&self) {
        self.context.lock().await.next_nonce = None;
    }

    /// `Ok(status)` once mined, `Err(Timeout)` past the configured bound
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<bool, ChainError> {
        let deadline = Instant::now() + self.confirmation.timeout;

        loop {
            match self.backend.receipt_status(tx_hash).await {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => debug!(tx_hash = %tx_hash, error = %e, "Receipt lookup failed"),
            }

            if Instant::now() >= deadline {
                return Err(ChainError::Timeout(format!(
                    "transaction {} not mined after {:?}",
                    tx_hash, self.confirmation.timeout
                )));
            }
            sleep(self.confirmation.poll_interval).await;
        }
    }
}
