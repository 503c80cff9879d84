//! EVM event watcher for bridge Deposit events
//!
//! Scans `[checkpoint + 1, head - confirmations]`, routes one message per
//! deposit in log order, and only then commits the window's upper bound.
//! A stop mid-window or a transient writer failure leaves the checkpoint
//! where it was, so the window is scanned again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::blockstore::BlockStore;
use crate::chain::{ChainError, ChainReader};
use crate::codec;
use crate::contracts::bridge::Bridge;
use crate::errors::{report, Component, ErrorSender, RelayerError};
use crate::metrics::Metrics;
use crate::router::{RouteError, Router};
use crate::types::{DomainId, Message, MessageMetadata, ResourceId, TransferType};
use crate::writers::{ProposalOutcome, RetryConfig};

/// Per-chain listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub domain_id: DomainId,
    pub start_block: u64,
    pub block_confirmations: u64,
    pub poll_interval: Duration,
    /// Ignore the stored checkpoint and start at `start_block`
    pub fresh_start: bool,
    /// Start at the current head
    pub latest_block: bool,
    /// Largest window scanned at once; `None` scans everything confirmed
    pub max_block_range: Option<u64>,
    /// Source-chain handler contracts and the transfer type each one carries
    pub handlers: HashMap<Address, TransferType>,
}

/// Blocks to scan given the head, confirmation depth and checkpoint
///
/// `None` while the chain has not moved far enough past `checkpoint`.
pub fn scan_window(
    head: u64,
    confirmations: u64,
    checkpoint: u64,
    max_range: Option<u64>,
) -> Option<(u64, u64)> {
    let safe = head.checked_sub(confirmations)?;
    if safe <= checkpoint {
        return None;
    }
    let from = checkpoint + 1;
    let to = match max_range {
        Some(range) if range > 0 => safe.min(from.saturating_add(range - 1)),
        _ => safe,
    };
    Some((from, to))
}

fn chain_error(e: ChainError) -> RelayerError {
    match e {
        ChainError::Rpc(msg) | ChainError::Timeout(msg) => RelayerError::TransientNetwork(msg),
        // A view call reverting means the bridge does not have the ABI we expect
        ChainError::Reverted(msg) | ChainError::InvalidResponse(msg) => {
            RelayerError::MalformedEvent(msg)
        }
    }
}

#[derive(Debug)]
enum Poll {
    Advanced(u64),
    Idle,
    /// Stop arrived before the window was fully delivered
    Stopped,
}

/// What happened to one deposit
#[derive(Debug)]
enum Delivery {
    /// Routed to completion, or dropped and reported
    Handled,
    /// Not processed because the relayer is stopping
    Stopped,
}

pub struct EventListener {
    config: ListenerConfig,
    chain: Arc<dyn ChainReader>,
    router: Arc<Router>,
    store: BlockStore,
    errors: ErrorSender,
    backoff: RetryConfig,
    stop: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl EventListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ListenerConfig,
        chain: Arc<dyn ChainReader>,
        router: Arc<Router>,
        store: BlockStore,
        errors: ErrorSender,
        backoff: RetryConfig,
        stop: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            chain,
            router,
            store,
            errors,
            backoff,
            stop,
            metrics,
        }
    }

    pub fn domain_id(&self) -> DomainId {
        self.config.domain_id
    }

    /// Run until stopped or a chain-fatal error occurs
    pub async fn run(mut self) -> Result<(), RelayerError> {
        let mut checkpoint = match self.starting_checkpoint().await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e)),
        };
        info!(
            domain_id = self.domain_id(),
            resume_from = checkpoint + 1,
            confirmations = self.config.block_confirmations,
            "Event listener started"
        );

        let mut failures = 0u32;
        loop {
            if *self.stop.borrow() {
                info!(domain_id = self.domain_id(), checkpoint, "Event listener stopped");
                return Ok(());
            }

            match self.poll_once(checkpoint).await {
                Ok(Poll::Advanced(to)) => {
                    checkpoint = to;
                    failures = 0;
                }
                Ok(Poll::Idle) => {
                    failures = 0;
                    self.pause(self.config.poll_interval).await;
                }
                Ok(Poll::Stopped) => {
                    info!(
                        domain_id = self.domain_id(),
                        checkpoint,
                        "Window interrupted, checkpoint left in place"
                    );
                }
                Err(e) if e.is_retryable() => {
                    let backoff = self.backoff.backoff_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        domain_id = self.domain_id(),
                        checkpoint,
                        error = %e,
                        ?backoff,
                        "RPC error, retrying window"
                    );
                    self.pause(backoff).await;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn fail(&self, e: RelayerError) -> RelayerError {
        error!(domain_id = self.domain_id(), error = %e, "Event listener halted");
        report(&self.errors, self.domain_id(), Component::Listener, e.clone());
        e
    }

    /// Sleep, waking early on stop
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            Ok(()) = self.stop.changed() => {}
        }
    }

    async fn with_backoff<T, F, Fut>(&self, mut op: F) -> Result<T, RelayerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await.map_err(chain_error) {
                Err(e) if e.is_retryable() && !*self.stop.borrow() => {
                    let backoff = self.backoff.backoff_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(domain_id = self.domain_id(), error = %e, ?backoff, "Retrying chain read");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Checkpoint the first window starts after
    async fn starting_checkpoint(&self) -> Result<u64, RelayerError> {
        let configured = self.config.start_block.saturating_sub(1);

        if self.config.latest_block {
            let chain = &self.chain;
            let head = self.with_backoff(move || chain.latest_block()).await?;
            info!(domain_id = self.domain_id(), head, "Starting from latest block");
            return Ok(head.saturating_sub(1));
        }

        if self.config.fresh_start {
            info!(
                domain_id = self.domain_id(),
                start_block = self.config.start_block,
                "Fresh start, ignoring stored checkpoint"
            );
            return Ok(configured);
        }

        let stored = self
            .store
            .get(self.domain_id())
            .await
            .map_err(|e| RelayerError::Store(e.to_string()))?;
        Ok(stored.max(configured))
    }

    async fn poll_once(&self, checkpoint: u64) -> Result<Poll, RelayerError> {
        let head = self.chain.latest_block().await.map_err(chain_error)?;
        self.metrics.set_latest_block(self.domain_id(), head);

        let Some((from_block, to_block)) = scan_window(
            head,
            self.config.block_confirmations,
            checkpoint,
            self.config.max_block_range,
        ) else {
            debug!(
                domain_id = self.domain_id(),
                head,
                checkpoint,
                "Waiting for confirmations"
            );
            return Ok(Poll::Idle);
        };

        let logs = self
            .chain
            .deposit_logs(from_block, to_block)
            .await
            .map_err(chain_error)?;

        info!(
            domain_id = self.domain_id(),
            from_block,
            to_block,
            deposits = logs.len(),
            "Processing blocks"
        );

        for log in &logs {
            if *self.stop.borrow() {
                return Ok(Poll::Stopped);
            }
            if let Delivery::Stopped = self.handle_log(log).await? {
                return Ok(Poll::Stopped);
            }
        }

        self.store
            .put(self.domain_id(), to_block)
            .await
            .map_err(|e| RelayerError::Store(e.to_string()))?;
        self.metrics.set_checkpoint(self.domain_id(), to_block);
        debug!(domain_id = self.domain_id(), checkpoint = to_block, "Checkpoint committed");

        Ok(Poll::Advanced(to_block))
    }

    /// Build the message for one deposit log and hand it to the router
    async fn handle_log(&self, log: &Log) -> Result<Delivery, RelayerError> {
        let decoded = log.log_decode::<Bridge::Deposit>().map_err(|e| {
            RelayerError::MalformedEvent(format!(
                "undecodable Deposit log tx={:?} index={:?}: {}",
                log.transaction_hash, log.log_index, e
            ))
        })?;
        let event = &decoded.inner.data;
        self.metrics.deposit_detected(self.domain_id());

        let resource_id = ResourceId::from(event.resourceID);
        let chain = &self.chain;
        let handler = self
            .with_backoff(move || chain.resource_handler(resource_id))
            .await?;

        let Some(transfer_type) = self.config.handlers.get(&handler).copied() else {
            warn!(
                domain_id = self.domain_id(),
                deposit_nonce = event.depositNonce,
                resource_id = %resource_id,
                handler = %handler,
                "No handler configured for resource, dropping deposit"
            );
            self.metrics.message_dropped(self.domain_id(), "unknown_handler");
            report(
                &self.errors,
                self.domain_id(),
                Component::Listener,
                RelayerError::Configuration(format!(
                    "unknown handler {} for resource {}",
                    handler, resource_id
                )),
            );
            return Ok(Delivery::Handled);
        };

        let payload = codec::decode(transfer_type, &event.data).map_err(|e| {
            RelayerError::MalformedEvent(format!(
                "deposit {} data does not match {} layout: {}",
                event.depositNonce, transfer_type, e
            ))
        })?;

        let destination = event.destinationDomainID;
        let message = Message::new(
            self.domain_id(),
            destination,
            event.depositNonce,
            resource_id,
            payload,
            MessageMetadata {
                block_number: log.block_number.unwrap_or_default(),
                tx_hash: log.transaction_hash,
                log_index: log.log_index,
                handler_response: event.handlerResponse.clone(),
            },
        );
        let id = message.id();

        info!(
            domain_id = self.domain_id(),
            destination,
            deposit_nonce = event.depositNonce,
            %transfer_type,
            tx_hash = ?log.transaction_hash,
            "Deposit detected"
        );

        match self.router.send(destination, message).await {
            Ok(ProposalOutcome::Interrupted) => {
                debug!(message = %id, "Writer stopped before finishing message");
                return Ok(Delivery::Stopped);
            }
            Ok(ProposalOutcome::AwaitingThreshold) => {
                self.metrics.message_routed(self.domain_id(), destination);
                warn!(message = %id, "Voted but proposal did not pass within watch limit");
                report(
                    &self.errors,
                    destination,
                    Component::Writer,
                    RelayerError::UnfinishedProposal(format!(
                        "{} voted, still awaiting threshold",
                        id
                    )),
                );
            }
            Ok(outcome) => {
                self.metrics.message_routed(self.domain_id(), destination);
                debug!(message = %id, ?outcome, "Message delivered");
            }
            Err(RouteError::NotFound(_)) => {
                warn!(message = %id, "No writer for destination, dropping message");
                self.metrics.message_dropped(self.domain_id(), "no_route");
                report(
                    &self.errors,
                    self.domain_id(),
                    Component::Listener,
                    RelayerError::Configuration(format!("no writer registered for domain {}", destination)),
                );
            }
            Err(RouteError::Writer(e)) => {
                let err = RelayerError::from(e);
                if err.is_retryable() {
                    // Replayed on the next scan of this window
                    warn!(message = %id, error = %err, "Writer hit a network error, window will be retried");
                    report(&self.errors, destination, Component::Writer, err.clone());
                    return Err(err);
                }
                warn!(message = %id, error = %err, "Writer failed message");
                self.metrics.message_dropped(self.domain_id(), err.kind());
                report(&self.errors, destination, Component::Writer, err);
            }
        }

        Ok(Delivery::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_channel;
    use crate::testing::{deposit_log, fungible_data, FakeChain, RecordingWriter, HANDLER_ERC20};
    use alloy::primitives::Bytes;

    #[test]
    fn test_scan_window() {
        assert_eq!(scan_window(100, 5, 80, None), Some((81, 95)));
        assert_eq!(scan_window(100, 5, 95, None), None);
        assert_eq!(scan_window(100, 5, 99, None), None);
        assert_eq!(scan_window(3, 5, 0, None), None);
        assert_eq!(scan_window(100, 0, 99, None), Some((100, 100)));
        assert_eq!(scan_window(100, 5, 80, Some(10)), Some((81, 90)));
        assert_eq!(scan_window(100, 5, 90, Some(10)), Some((91, 95)));
    }

    struct Setup {
        chain: Arc<FakeChain>,
        router: Arc<Router>,
        store: BlockStore,
        writer: Arc<RecordingWriter>,
        errors: crate::errors::ErrorReceiver,
        stop: watch::Sender<bool>,
        listener: EventListener,
    }

    async fn setup(start_block: u64) -> Setup {
        let chain = Arc::new(FakeChain::new(1));
        let router = Arc::new(Router::new());
        let writer = Arc::new(RecordingWriter::default());
        router.set_writer(2, writer.clone()).await;
        let store = BlockStore::in_memory();
        let (tx, errors) = error_channel();
        let (stop, stop_rx) = watch::channel(false);

        let listener = EventListener::new(
            ListenerConfig {
                domain_id: 1,
                start_block,
                block_confirmations: 5,
                poll_interval: Duration::from_secs(1),
                fresh_start: false,
                latest_block: false,
                max_block_range: None,
                handlers: HashMap::from([(HANDLER_ERC20, TransferType::Fungible)]),
            },
            chain.clone(),
            router.clone(),
            store.clone(),
            tx,
            RetryConfig::default(),
            stop_rx,
            Arc::new(Metrics::new()),
        );

        Setup {
            chain,
            router,
            store,
            writer,
            errors,
            stop,
            listener,
        }
    }

    #[tokio::test]
    async fn test_window_is_delivered_then_committed() {
        let s = setup(0).await;
        s.store.put(1, 80).await.unwrap();
        s.chain.set_head(100);
        s.chain.push_log(deposit_log(82, 2, 1, fungible_data(500)));
        s.chain.push_log(deposit_log(90, 2, 2, fungible_data(600)));
        s.chain.push_log(deposit_log(97, 2, 3, fungible_data(700)));

        let checkpoint = s.listener.starting_checkpoint().await.unwrap();
        assert_eq!(checkpoint, 80);
        assert!(matches!(
            s.listener.poll_once(checkpoint).await.unwrap(),
            Poll::Advanced(95)
        ));

        assert_eq!(s.chain.log_queries(), vec![(81, 95)]);
        let nonces: Vec<u64> = s.writer.received().iter().map(|m| m.deposit_nonce).collect();
        assert_eq!(nonces, vec![1, 2]);
        assert_eq!(s.store.get(1).await.unwrap(), 95);
    }

    #[tokio::test]
    async fn test_idle_when_not_enough_confirmations() {
        let s = setup(0).await;
        s.chain.set_head(100);
        assert!(matches!(s.listener.poll_once(95).await.unwrap(), Poll::Idle));
        assert!(s.chain.log_queries().is_empty());
        assert_eq!(s.store.get(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_block_policy() {
        let s = setup(50).await;
        assert_eq!(s.listener.starting_checkpoint().await.unwrap(), 49);

        s.store.put(1, 120).await.unwrap();
        assert_eq!(s.listener.starting_checkpoint().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_missing_route_drops_message_and_advances() {
        let s = setup(0).await;
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 7, 1, fungible_data(1)));
        s.chain.push_log(deposit_log(11, 2, 2, fungible_data(2)));

        let mut errors = s.errors;
        assert!(matches!(
            s.listener.poll_once(0).await.unwrap(),
            Poll::Advanced(25)
        ));
        assert_eq!(s.writer.received().len(), 1);
        assert_eq!(s.store.get(1).await.unwrap(), 25);

        let report = errors.try_recv().unwrap();
        assert!(matches!(report.error, RelayerError::Configuration(_)));
        assert!(!s.router.has_writer(7).await);
    }

    #[tokio::test]
    async fn test_unknown_handler_is_dropped() {
        let s = setup(0).await;
        s.chain.set_head(30);
        s.chain.set_handler(Address::repeat_byte(0x77));
        s.chain.push_log(deposit_log(10, 2, 1, fungible_data(1)));

        assert!(matches!(
            s.listener.poll_once(0).await.unwrap(),
            Poll::Advanced(25)
        ));
        assert!(s.writer.received().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_data_is_fatal_and_blocks_checkpoint() {
        let s = setup(0).await;
        s.chain.set_head(30);
        s.chain
            .push_log(deposit_log(10, 2, 1, Bytes::from_static(&[0x01, 0x02])));

        let err = s.listener.poll_once(0).await.unwrap_err();
        assert!(matches!(err, RelayerError::MalformedEvent(_)));
        assert!(err.is_fatal_for_chain());
        assert_eq!(s.store.get(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rpc_error_never_advances() {
        let s = setup(0).await;
        s.chain.set_head(30);
        s.chain.fail_next_log_query(ChainError::Rpc("connection reset".into()));

        let err = s.listener.poll_once(0).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s.store.get(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_failure_is_reported_for_destination() {
        let s = setup(0).await;
        s.router
            .set_writer(
                2,
                Arc::new(RecordingWriter::failing(
                    crate::writers::WriterError::UnknownResource(ResourceId::default()),
                )),
            )
            .await;
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 2, 1, fungible_data(1)));

        let mut errors = s.errors;
        s.listener.poll_once(0).await.unwrap();
        let report = errors.try_recv().unwrap();
        assert_eq!(report.domain_id, 2);
        assert_eq!(report.component, Component::Writer);
        assert_eq!(s.store.get(1).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_transient_writer_failure_keeps_checkpoint() {
        let s = setup(0).await;
        s.router
            .set_writer(
                2,
                Arc::new(RecordingWriter::failing(crate::writers::WriterError::Read(
                    ChainError::Rpc("connection refused".into()),
                ))),
            )
            .await;
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 2, 1, fungible_data(1)));
        s.chain.push_log(deposit_log(11, 2, 2, fungible_data(2)));

        let mut errors = s.errors;
        let err = s.listener.poll_once(0).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s.store.get(1).await.unwrap(), 0);

        let report = errors.try_recv().unwrap();
        assert_eq!(report.domain_id, 2);
        assert_eq!(report.component, Component::Writer);
        assert!(matches!(report.error, RelayerError::TransientNetwork(_)));
    }

    #[tokio::test]
    async fn test_interrupted_message_leaves_window_uncommitted() {
        let s = setup(0).await;
        let writer = Arc::new(RecordingWriter::answering(Ok(ProposalOutcome::Interrupted)));
        s.router.set_writer(2, writer.clone()).await;
        s.store.put(1, 5).await.unwrap();
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 2, 1, fungible_data(1)));
        s.chain.push_log(deposit_log(11, 2, 2, fungible_data(2)));

        assert!(matches!(s.listener.poll_once(5).await.unwrap(), Poll::Stopped));
        // the second deposit is never handed over
        assert_eq!(writer.received().len(), 1);
        assert_eq!(s.store.get(1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stop_between_deposits_leaves_window_uncommitted() {
        let s = setup(0).await;
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 2, 1, fungible_data(1)));
        s.stop.send(true).unwrap();

        assert!(matches!(s.listener.poll_once(0).await.unwrap(), Poll::Stopped));
        assert!(s.writer.received().is_empty());
        assert_eq!(s.store.get(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unpassed_proposal_is_reported() {
        let s = setup(0).await;
        s.router
            .set_writer(
                2,
                Arc::new(RecordingWriter::answering(Ok(
                    ProposalOutcome::AwaitingThreshold,
                ))),
            )
            .await;
        s.chain.set_head(30);
        s.chain.push_log(deposit_log(10, 2, 4, fungible_data(1)));

        let mut errors = s.errors;
        assert!(matches!(
            s.listener.poll_once(0).await.unwrap(),
            Poll::Advanced(25)
        ));
        let report = errors.try_recv().unwrap();
        assert_eq!(report.domain_id, 2);
        assert_eq!(report.component, Component::Writer);
        assert!(matches!(report.error, RelayerError::UnfinishedProposal(_)));
        assert_eq!(report.error.kind(), "unfinished_proposal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_catches_up_then_stops() {
        let s = setup(0).await;
        s.chain.set_head(100);
        s.chain.push_log(deposit_log(40, 2, 1, fungible_data(1)));

        let stop = s.stop;
        let handle = tokio::spawn(s.listener.run());
        tokio::time::sleep(Duration::from_secs(3)).await;
        stop.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(s.store.get(1).await.unwrap(), 95);
        assert_eq!(s.writer.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_halts_listener() {
        let s = setup(0).await;
        s.chain.set_head(100);
        s.store.close().await.unwrap();

        let mut errors = s.errors;
        let err = s.listener.run().await.unwrap_err();
        assert!(matches!(err, RelayerError::Store(_)));
        assert_eq!(errors.try_recv().unwrap().component, Component::Listener);
        drop(s.stop);
    }
}
