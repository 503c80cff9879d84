//! Retry and error recovery utilities for bridge calls
//!
//! Provides exponential backoff and classification of node error strings into
//! retry decisions.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::chain::ChainError;

/// Transaction retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per call, including the first
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Gas price bump percentage after an underpriced rejection
    pub gas_bump_percent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            gas_bump_percent: 20,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeout, network issues
    Transient,
    /// Retry with a higher gas price
    Underpriced,
    /// Nonce already used or ahead of the chain; refetch before retrying
    NonceConflict,
    /// The bridge already recorded this vote or execution
    AlreadyProcessed,
    /// Retrying cannot help (revert, insufficient funds, bad params)
    Permanent,
    Unknown,
}

/// Classify a node error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Bridge reverts that mean another attempt (ours or another relayer's) won
    if error_lower.contains("relayer already voted")
        || error_lower.contains("proposal already passed")
        || error_lower.contains("proposal already executed")
        || error_lower.contains("proposal already cancelled")
        || error_lower.contains("already executed")
    {
        return ErrorClass::AlreadyProcessed;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("invalid nonce")
    {
        return ErrorClass::NonceConflict;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Classify a collaborator error
pub fn classify_chain_error(error: &ChainError) -> ErrorClass {
    match error {
        ChainError::Timeout(_) => ErrorClass::Transient,
        ChainError::Reverted(reason) => match classify_error(reason) {
            ErrorClass::AlreadyProcessed => ErrorClass::AlreadyProcessed,
            _ => ErrorClass::Permanent,
        },
        ChainError::Rpc(msg) => classify_error(msg),
        ChainError::InvalidResponse(_) => ErrorClass::Permanent,
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Retry with a bumped gas price
    RetryWithBump(Duration),
    /// Refetch the nonce from the chain, then retry
    RefreshNonce(Duration),
    /// Nothing left to do; the call's effect is already on chain
    AlreadyProcessed,
    /// Stop and report
    GiveUp,
}

/// Retry context for one bridge call
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub config: RetryConfig,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_class: Option<ErrorClass>,
}

impl RetryContext {
    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_error: None,
            last_class: None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &ChainError) -> ErrorClass {
        let class = classify_chain_error(error);
        self.attempt += 1;
        self.last_error = Some(error.to_string());
        self.last_class = Some(class);
        class
    }

    /// Get the decision for the next attempt
    pub fn next_action(&self) -> RetryAction {
        let Some(class) = self.last_class else {
            return RetryAction::RetryAfter(Duration::ZERO);
        };

        match class {
            ErrorClass::AlreadyProcessed => RetryAction::AlreadyProcessed,
            ErrorClass::Permanent => {
                warn!(error = ?self.last_error, "Permanent error, not retrying");
                RetryAction::GiveUp
            }
            _ if !self.config.should_retry(self.attempt) => RetryAction::GiveUp,
            // Retry quickly with bumped gas
            ErrorClass::Underpriced => RetryAction::RetryWithBump(Duration::from_secs(1)),
            ErrorClass::NonceConflict => {
                RetryAction::RefreshNonce(self.config.backoff_for_attempt(0))
            }
            ErrorClass::Transient | ErrorClass::Unknown => {
                let backoff = self.config.backoff_for_attempt(self.attempt - 1);
                debug!(?backoff, attempt = self.attempt, "Transient error - retrying");
                RetryAction::RetryAfter(backoff)
            }
        }
    }

    pub fn last_error(&self) -> String {
        self.last_error.clone().unwrap_or_default()
    }
}

/// Run a read with retry on transient failures
///
/// Reverts and other permanent errors are returned on the first failure.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut ctx = RetryContext::with_config(config.clone());

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match ctx.record_failure(&e) {
                ErrorClass::Transient | ErrorClass::Unknown if config.should_retry(ctx.attempt) => {
                    let backoff = config.backoff_for_attempt(ctx.attempt - 1);
                    warn!(
                        call = label,
                        attempt = ctx.attempt,
                        max = config.max_retries,
                        ?backoff,
                        error = %e,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                _ => return Err(e),
            },
        }
    }
}
