//! Relayer orchestration
//!
//! One listener and one writer per configured chain. Writers are registered
//! with a shared [`Router`] before any listener starts; listeners run on a
//! [`JoinSet`] and share the checkpoint store and the error channel.

use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::blockstore::BlockStore;
use crate::chain::{
    BridgeContract, ChainReader, EvmClient, GasPricer, LondonGasPricer, StaticGasPricer,
    TransactionBackend,
};
use crate::config::{Config, GasPricing};
use crate::db::PostgresStore;
use crate::errors::{error_channel, ErrorReport, RelayerError};
use crate::metrics::Metrics;
use crate::router::Router;
use crate::types::DomainId;
use crate::watchers::{EventListener, ListenerConfig};
use crate::writers::{ConfirmationConfig, ProposalWriter, RetryConfig, Transactor, WriterConfig};

/// Collaborators and settings for one chain
pub struct ChainHandles {
    pub listener: ListenerConfig,
    pub writer: WriterConfig,
    pub reader: Arc<dyn ChainReader>,
    pub bridge: Arc<dyn BridgeContract>,
    pub backend: Arc<dyn TransactionBackend>,
    pub pricer: Arc<dyn GasPricer>,
    pub gas_limit: u64,
    pub max_gas_price: Option<u128>,
}

/// A listener that stopped with a chain-fatal error
#[derive(Debug, Clone)]
pub struct HaltedChain {
    pub domain_id: DomainId,
    pub error: RelayerError,
}

pub struct Relayer {
    chains: Vec<ChainHandles>,
    store: BlockStore,
    retry: RetryConfig,
    confirmation: ConfirmationConfig,
    metrics: Arc<Metrics>,
    stop: watch::Receiver<bool>,
}

impl Relayer {
    pub fn new(
        store: BlockStore,
        retry: RetryConfig,
        confirmation: ConfirmationConfig,
        metrics: Arc<Metrics>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chains: Vec::new(),
            store,
            retry,
            confirmation,
            metrics,
            stop,
        }
    }

    pub fn add_chain(&mut self, chain: ChainHandles) {
        self.chains.push(chain);
    }

    /// Checkpoint store shared by every listener
    pub fn store(&self) -> BlockStore {
        self.store.clone()
    }

    pub fn domains(&self) -> Vec<DomainId> {
        self.chains.iter().map(|c| c.listener.domain_id).collect()
    }

    /// Connect every configured chain and the checkpoint store
    pub async fn connect(
        config: &Config,
        metrics: Arc<Metrics>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("RELAYER_PRIVATE_KEY is not a valid secp256k1 key")?;

        let store = match &config.database_url {
            Some(url) => BlockStore::new(Arc::new(PostgresStore::connect(url).await?)),
            None => {
                warn!("DATABASE_URL not set, checkpoints will not survive a restart");
                BlockStore::in_memory()
            }
        };

        let mut relayer = Self::new(
            store,
            config.retry_config(),
            ConfirmationConfig::default(),
            metrics,
            stop,
        );

        for chain in &config.chains {
            let client = Arc::new(
                EvmClient::connect(chain.domain_id, &chain.rpc_url, chain.bridge()?, signer.clone())
                    .await
                    .wrap_err_with(|| format!("Failed to connect to {}", chain.name))?,
            );

            let pricer: Arc<dyn GasPricer> = match chain.gas_pricing {
                GasPricing::Static => {
                    Arc::new(StaticGasPricer::new(client.clone(), chain.gas_settings()))
                }
                GasPricing::London => {
                    Arc::new(LondonGasPricer::new(client.clone(), chain.gas_settings()))
                }
            };

            info!(
                name = %chain.name,
                domain_id = chain.domain_id,
                chain_id = client.chain_id(),
                pricing = ?chain.gas_pricing,
                "Chain configured"
            );

            relayer.add_chain(ChainHandles {
                listener: chain.listener_config()?,
                writer: chain.writer_config(),
                reader: client.clone(),
                bridge: client.clone(),
                backend: client,
                pricer,
                gas_limit: chain.gas_limit,
                max_gas_price: Some(chain.max_gas_price),
            });
        }

        Ok(relayer)
    }

    /// Run every chain until stop is signalled or all listeners have exited.
    /// Returns the chains whose listener halted on a fatal error.
    pub async fn run(self) -> Vec<HaltedChain> {
        let router = Arc::new(Router::new());
        let (errors, mut reports) = error_channel();

        for chain in &self.chains {
            let transactor = Transactor::new(
                chain.writer.domain_id,
                chain.backend.clone(),
                chain.pricer.clone(),
                chain.gas_limit,
                chain.max_gas_price,
                self.retry.clone(),
                self.confirmation,
                self.metrics.clone(),
            );
            let writer = ProposalWriter::new(
                chain.writer.clone(),
                chain.bridge.clone(),
                transactor,
                self.retry.clone(),
                self.stop.clone(),
                self.metrics.clone(),
            );
            router.set_writer(chain.writer.domain_id, Arc::new(writer)).await;
        }

        let mut tasks = JoinSet::new();
        for chain in self.chains {
            let domain_id = chain.listener.domain_id;
            let listener = EventListener::new(
                chain.listener,
                chain.reader,
                router.clone(),
                self.store.clone(),
                errors.clone(),
                self.retry.clone(),
                self.stop.clone(),
                self.metrics.clone(),
            );
            tasks.spawn(async move { (domain_id, listener.run().await) });
        }
        drop(errors);

        self.metrics.up.set(1);
        info!(chains = tasks.len(), "Relayer running");

        let mut halted = Vec::new();
        loop {
            tokio::select! {
                Some(report) = reports.recv() => record(&self.metrics, &report),
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((domain_id, Ok(())))) => {
                        info!(domain_id, "Listener exited");
                    }
                    Some(Ok((domain_id, Err(e)))) => {
                        error!(domain_id, error = %e, "Chain halted");
                        halted.push(HaltedChain { domain_id, error: e });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Listener task failed");
                    }
                }
            }
        }

        while let Ok(report) = reports.try_recv() {
            record(&self.metrics, &report);
        }

        self.metrics.up.set(0);
        info!(halted = halted.len(), "Relayer stopped");
        halted
    }
}

/// Log and count one error report
fn record(metrics: &Metrics, report: &ErrorReport) {
    metrics.error(report.domain_id, report.error.kind());
    if report.error.is_fatal_for_chain() {
        error!(
            domain_id = report.domain_id,
            component = %report.component,
            kind = report.error.kind(),
            error = %report.error,
            "Fatal error reported"
        );
    } else {
        warn!(
            domain_id = report.domain_id,
            component = %report.component,
            kind = report.error.kind(),
            error = %report.error,
            "Error reported"
        );
    }
}
