//! End-to-end pipeline tests: listener -> router -> writer against in-memory chains

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use relayer::blockstore::BlockStore;
use relayer::chain::{ChainError, GasSettings, StaticGasPricer};
use relayer::codec;
use relayer::errors::RelayerError;
use relayer::metrics::Metrics;
use relayer::relayer::{ChainHandles, HaltedChain, Relayer};
use relayer::router::Router;
use relayer::testing::{
    deposit_log, fungible_data, sample_message, FakeBackend, FakeBridge, FakeChain, FixedFees,
    RecordingWriter, HANDLER_ERC20,
};
use relayer::types::{Payload, ProposalStatus, TransferType};
use relayer::watchers::ListenerConfig;
use relayer::writers::{ConfirmationConfig, RetryConfig, WriterConfig};
use tokio::sync::watch;

/// Deposit data that decodes to the same payload as `sample_message`
fn sample_data() -> Bytes {
    fungible_data(1_000)
}

struct Chain {
    reader: Arc<FakeChain>,
    bridge: Arc<FakeBridge>,
    backend: Arc<FakeBackend>,
}

impl Chain {
    fn new(domain_id: u8) -> Self {
        let bridge = Arc::new(FakeBridge::new());
        Self {
            reader: Arc::new(FakeChain::new(domain_id)),
            backend: Arc::new(FakeBackend::new(0).with_bridge(bridge.clone())),
            bridge,
        }
    }

    /// Same source and destination bridge, different signer
    fn second_relayer(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            bridge: self.bridge.clone(),
            backend: Arc::new(
                FakeBackend::new(0)
                    .with_bridge(self.bridge.clone())
                    .with_sender(Address::repeat_byte(0x77)),
            ),
        }
    }

    fn handles(&self, domain_id: u8) -> ChainHandles {
        ChainHandles {
            listener: ListenerConfig {
                domain_id,
                start_block: 0,
                block_confirmations: 5,
                poll_interval: Duration::from_secs(1),
                fresh_start: false,
                latest_block: false,
                max_block_range: None,
                handlers: HashMap::from([(HANDLER_ERC20, TransferType::Fungible)]),
            },
            writer: WriterConfig {
                domain_id,
                poll_interval: Duration::from_secs(1),
                execute_watch_limit: 20,
            },
            reader: self.reader.clone(),
            bridge: self.bridge.clone(),
            backend: self.backend.clone(),
            pricer: Arc::new(StaticGasPricer::new(
                Arc::new(FixedFees::legacy(1_000_000_000)),
                GasSettings::default(),
            )),
            gas_limit: 500_000,
            max_gas_price: None,
        }
    }
}

fn build_relayer(
    store: &BlockStore,
    chains: &[(&Chain, u8)],
    stop: watch::Receiver<bool>,
) -> Relayer {
    let mut relayer = Relayer::new(
        store.clone(),
        RetryConfig {
            max_retries: 3,
            ..RetryConfig::default()
        },
        ConfirmationConfig::default(),
        Arc::new(Metrics::new()),
        stop,
    );
    for (chain, domain_id) in chains {
        relayer.add_chain(chain.handles(*domain_id));
    }
    relayer
}

/// Run for `secs` of (paused) time, then stop and collect halted chains
async fn run_for(relayer: Relayer, stop: watch::Sender<bool>, secs: u64) -> Vec<HaltedChain> {
    let handle = tokio::spawn(relayer.run());
    tokio::time::sleep(Duration::from_secs(secs)).await;
    stop.send(true).unwrap();
    handle.await.unwrap()
}

#[test]
fn test_fungible_encoding_example() {
    let data = codec::encode(
        TransferType::Fungible,
        &Payload::Fungible {
            amount: U256::from(500u64),
            recipient: Bytes::from_static(&[0xab, 0xcd]),
        },
    )
    .unwrap();

    let mut expected = vec![0u8; 64];
    expected[30] = 0x01;
    expected[31] = 0xf4;
    expected[63] = 0x02;
    expected.extend_from_slice(&[0xab, 0xcd]);
    assert_eq!(data.to_vec(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_window_delivered_and_executed_then_committed() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    let store = BlockStore::in_memory();
    store.put(1, 80).await.unwrap();

    source.reader.set_head(100);
    source.reader.push_log(deposit_log(85, 2, 1, sample_data()));
    source.reader.push_log(deposit_log(95, 2, 2, sample_data()));
    // not yet confirmed
    source.reader.push_log(deposit_log(96, 2, 3, sample_data()));

    let (stop, stop_rx) = watch::channel(false);
    let halted = run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 5).await;
    assert!(halted.is_empty());

    assert_eq!(source.reader.log_queries()[0], (81, 95));
    assert_eq!(store.get(1).await.unwrap(), 95);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 1)),
        ProposalStatus::Executed
    );
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 2)),
        ProposalStatus::Executed
    );
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 3)),
        ProposalStatus::Inactive
    );
    assert_eq!(
        dest.backend.sent_calls(),
        vec![
            "voteProposal",
            "executeProposal",
            "voteProposal",
            "executeProposal"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unrouted_destination_does_not_affect_other_chains() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    let store = BlockStore::in_memory();

    source.reader.set_head(50);
    source.reader.push_log(deposit_log(10, 7, 1, sample_data()));
    source.reader.push_log(deposit_log(11, 2, 2, sample_data()));

    let (stop, stop_rx) = watch::channel(false);
    let halted = run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 5).await;
    assert!(halted.is_empty());

    assert_eq!(store.get(1).await.unwrap(), 45);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 2)),
        ProposalStatus::Executed
    );
    assert_eq!(dest.backend.sent().len(), 2);
    assert!(dest.backend.sent().iter().all(|tx| tx.deposit_nonce == 2));
}

#[tokio::test]
async fn test_router_send_without_writer_invokes_nothing() {
    let router = Router::new();
    let writer = Arc::new(RecordingWriter::default());
    router.set_writer(2, writer.clone()).await;

    assert!(router.send(7, sample_message(1, 7, 1)).await.is_err());
    assert!(writer.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_already_voted_relayer_goes_straight_to_execute() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    let store = BlockStore::in_memory();
    dest.bridge.set_threshold(1);
    // a previous run voted; with threshold 1 that already passed the proposal
    dest.bridge
        .record_vote_for(&sample_message(1, 2, 1), dest.backend.sender_address());

    source.reader.set_head(30);
    source.reader.push_log(deposit_log(12, 2, 1, sample_data()));

    let (stop, stop_rx) = watch::channel(false);
    run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 3).await;

    assert_eq!(dest.backend.sent_calls(), vec!["executeProposal"]);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 1)),
        ProposalStatus::Executed
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_after_checkpoint() {
    let store = BlockStore::in_memory();
    let dest = Chain::new(2);

    let first = Chain::new(1);
    first.reader.set_head(100);
    first.reader.push_log(deposit_log(90, 2, 1, sample_data()));
    let (stop, stop_rx) = watch::channel(false);
    run_for(build_relayer(&store, &[(&first, 1), (&dest, 2)], stop_rx), stop, 3).await;
    assert_eq!(store.get(1).await.unwrap(), 95);

    // Process restart: a fresh source client sees the same history
    let second = Chain {
        reader: Arc::new(FakeChain::new(1)),
        bridge: first.bridge.clone(),
        backend: first.backend.clone(),
    };
    second.reader.set_head(110);
    second.reader.push_log(deposit_log(90, 2, 1, sample_data()));
    second.reader.push_log(deposit_log(100, 2, 2, sample_data()));

    let (stop, stop_rx) = watch::channel(false);
    run_for(build_relayer(&store, &[(&second, 1), (&dest, 2)], stop_rx), stop, 3).await;

    assert_eq!(second.reader.log_queries()[0], (96, 105));
    assert_eq!(store.get(1).await.unwrap(), 105);
    let nonces: Vec<u64> = dest.backend.sent().iter().map(|tx| tx.deposit_nonce).collect();
    assert_eq!(nonces, vec![1, 1, 2, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_two_relayers_reach_threshold_and_execute_once() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    dest.bridge.set_threshold(2);
    source.reader.set_head(30);
    source.reader.push_log(deposit_log(10, 2, 1, sample_data()));

    let other_source = source.second_relayer();
    let other_dest = dest.second_relayer();

    let (stop, stop_rx) = watch::channel(false);
    let a = tokio::spawn(
        build_relayer(&BlockStore::in_memory(), &[(&source, 1), (&dest, 2)], stop_rx.clone()).run(),
    );
    let b = tokio::spawn(
        build_relayer(
            &BlockStore::in_memory(),
            &[(&other_source, 1), (&other_dest, 2)],
            stop_rx,
        )
        .run(),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;
    stop.send(true).unwrap();
    assert!(a.await.unwrap().is_empty());
    assert!(b.await.unwrap().is_empty());

    let calls: Vec<&str> = dest
        .backend
        .sent_calls()
        .into_iter()
        .chain(other_dest.backend.sent_calls())
        .collect();
    assert_eq!(calls.iter().filter(|c| **c == "voteProposal").count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == "executeProposal").count(), 1);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 1)),
        ProposalStatus::Executed
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_deposit_halts_only_that_chain() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    let store = BlockStore::in_memory();

    source.reader.set_head(30);
    source
        .reader
        .push_log(deposit_log(10, 2, 1, Bytes::from_static(&[0xde, 0xad])));
    dest.reader.set_head(30);
    dest.reader.push_log(deposit_log(12, 1, 1, sample_data()));

    let (stop, stop_rx) = watch::channel(false);
    let halted = run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 5).await;

    assert_eq!(halted.len(), 1);
    assert_eq!(halted[0].domain_id, 1);
    assert!(matches!(halted[0].error, RelayerError::MalformedEvent(_)));
    assert_eq!(store.get(1).await.unwrap(), 0);
    // chain 2 kept going and its deposit reached chain 1's bridge
    assert_eq!(store.get(2).await.unwrap(), 25);
    assert_eq!(
        source.bridge.status_for(&sample_message(2, 1, 1)),
        ProposalStatus::Executed
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_window_keeps_checkpoint() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    dest.bridge.set_threshold(2);
    let store = BlockStore::in_memory();
    store.put(1, 80).await.unwrap();

    source.reader.set_head(100);
    source.reader.push_log(deposit_log(85, 2, 1, sample_data()));
    source.reader.push_log(deposit_log(90, 2, 2, sample_data()));

    // stop lands while the writer is still waiting on the first proposal
    let (stop, stop_rx) = watch::channel(false);
    let halted = run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 5).await;
    assert!(halted.is_empty());

    assert_eq!(store.get(1).await.unwrap(), 80);
    assert_eq!(dest.backend.sent_calls(), vec!["voteProposal"]);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 1)),
        ProposalStatus::Active
    );
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 2)),
        ProposalStatus::Inactive
    );
}

#[tokio::test(start_paused = true)]
async fn test_destination_outage_retries_window() {
    let source = Chain::new(1);
    let dest = Chain::new(2);
    let store = BlockStore::in_memory();

    source.reader.set_head(100);
    source.reader.push_log(deposit_log(90, 2, 1, sample_data()));
    // outlasts the writer's own read retries
    dest.bridge
        .fail_next_reads(vec![ChainError::Rpc("connection refused".into()); 3]);

    let (stop, stop_rx) = watch::channel(false);
    let halted = run_for(build_relayer(&store, &[(&source, 1), (&dest, 2)], stop_rx), stop, 20).await;
    assert!(halted.is_empty());

    assert_eq!(source.reader.log_queries()[..2], [(1, 95), (1, 95)]);
    assert_eq!(store.get(1).await.unwrap(), 95);
    assert_eq!(dest.backend.sent_calls(), vec!["voteProposal", "executeProposal"]);
    assert_eq!(
        dest.bridge.status_for(&sample_message(1, 2, 1)),
        ProposalStatus::Executed
    );
}
