//! alloy-backed chain client
//!
//! One [`EvmClient`] per configured chain serves both roles: it reads deposit
//! logs when the chain is a source and signs bridge calls when it is a
//! destination.

use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::aliases::U72;
use alloy::primitives::{Address, B256};
use alloy::providers::fillers::{FillProvider, JoinFill, WalletFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info};

use super::{
    BridgeCall, BridgeContract, ChainError, ChainReader, FeeSource, GasPrice, TransactionBackend,
    TxOptions,
};
use crate::contracts::bridge::Bridge;
use crate::types::{DepositNonce, DomainId, Proposal, ProposalState, ProposalStatus, ResourceId};

type HttpProvider = RootProvider<Http<Client>>;

type SigningProvider = FillProvider<
    JoinFill<Identity, WalletFiller<EthereumWallet>>,
    HttpProvider,
    Http<Client>,
    Ethereum,
>;

/// RPC client for one EVM chain's bridge
pub struct EvmClient {
    domain_id: DomainId,
    chain_id: u64,
    bridge_address: Address,
    sender: Address,
    provider: HttpProvider,
    signing: SigningProvider,
    bridge: Bridge::BridgeInstance<Http<Client>, HttpProvider>,
}

impl EvmClient {
    /// Connect to `rpc_url` and resolve the chain ID
    pub async fn connect(
        domain_id: DomainId,
        rpc_url: &str,
        bridge_address: Address,
        signer: PrivateKeySigner,
    ) -> Result<Self> {
        let url: alloy::transports::http::reqwest::Url =
            rpc_url.parse().wrap_err("Invalid RPC URL")?;

        let sender = signer.address();
        let provider = ProviderBuilder::new().on_http(url.clone());
        let signing = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .on_http(url);

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| eyre!("Failed to query chain ID for domain {}: {}", domain_id, e))?;

        let bridge = Bridge::new(bridge_address, provider.clone());

        info!(
            domain_id,
            chain_id,
            bridge_address = %bridge_address,
            relayer = %sender,
            "EVM client connected"
        );

        Ok(Self {
            domain_id,
            chain_id,
            bridge_address,
            sender,
            provider,
            signing,
            bridge,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn build_request(&self, call: BridgeCall<'_>, opts: &TxOptions) -> TransactionRequest {
        let input = encode_call(call);
        let mut tx = TransactionRequest::default()
            .with_from(self.sender)
            .with_to(self.bridge_address)
            .with_input(input)
            .with_nonce(opts.nonce)
            .with_gas_limit(opts.gas_limit)
            .with_chain_id(self.chain_id);

        match opts.gas_price {
            GasPrice::Legacy(price) => tx.set_gas_price(price),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                tx.set_max_fee_per_gas(max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(max_priority_fee_per_gas);
            }
        }
        tx
    }
}

/// ABI calldata for a bridge write
pub fn encode_call(call: BridgeCall<'_>) -> Vec<u8> {
    let p = call.proposal();
    match call {
        BridgeCall::Vote(_) => Bridge::voteProposalCall {
            domainID: p.origin_domain_id,
            depositNonce: p.deposit_nonce,
            resourceID: p.resource_id.into(),
            data: p.data.clone(),
        }
        .abi_encode(),
        BridgeCall::Execute(_) => Bridge::executeProposalCall {
            domainID: p.origin_domain_id,
            depositNonce: p.deposit_nonce,
            data: p.data.clone(),
            resourceID: p.resource_id.into(),
            revertOnFail: true,
        }
        .abi_encode(),
    }
}

fn rpc_err(context: &str, e: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(format!("{}: {}", context, e))
}

/// Node errors for failed `eth_call`s carry "execution reverted"
fn call_err(context: &str, e: impl std::fmt::Display) -> ChainError {
    let msg = e.to_string();
    if msg.to_lowercase().contains("revert") {
        ChainError::Reverted(msg)
    } else {
        ChainError::Rpc(format!("{}: {}", context, msg))
    }
}

#[async_trait]
impl ChainReader for EvmClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| rpc_err("eth_blockNumber", e))
    }

    async fn deposit_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(Bridge::Deposit::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_err("eth_getLogs", e))
    }

    async fn resource_handler(&self, resource_id: ResourceId) -> Result<Address, ChainError> {
        BridgeContract::resource_handler(self, resource_id).await
    }
}

#[async_trait]
impl BridgeContract for EvmClient {
    async fn resource_handler(&self, resource_id: ResourceId) -> Result<Address, ChainError> {
        let handler = self
            .bridge
            ._resourceIDToHandlerAddress(resource_id.into())
            .call()
            .await
            .map_err(|e| call_err("_resourceIDToHandlerAddress", e))?;
        Ok(handler._0)
    }

    async fn get_proposal(
        &self,
        origin_domain_id: DomainId,
        deposit_nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalState, ChainError> {
        let raw = self
            .bridge
            .getProposal(origin_domain_id, deposit_nonce, data_hash)
            .call()
            .await
            .map_err(|e| call_err("getProposal", e))?
            ._0;

        let status = ProposalStatus::try_from(raw._status).map_err(|byte| {
            ChainError::InvalidResponse(format!("unknown proposal status {}", byte))
        })?;

        Ok(ProposalState {
            status,
            yes_votes_total: raw._yesVotesTotal,
            proposed_block: raw._proposedBlock.to::<u64>(),
        })
    }

    async fn has_voted(&self, proposal: &Proposal, relayer: Address) -> Result<bool, ChainError> {
        let voted = self
            .bridge
            ._hasVotedOnProposal(
                U72::from(proposal.nonce_and_id()),
                proposal.data_hash(),
                relayer,
            )
            .call()
            .await
            .map_err(|e| call_err("_hasVotedOnProposal", e))?;
        Ok(voted._0)
    }
}

#[async_trait]
impl TransactionBackend for EvmClient {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(self.sender)
            .pending()
            .await
            .map_err(|e| rpc_err("eth_getTransactionCount", e))
    }

    async fn send_call(&self, call: BridgeCall<'_>, opts: &TxOptions) -> Result<B256, ChainError> {
        let tx = self.build_request(call, opts);

        // Simulate first so reverts come back with their reason string
        self.provider
            .call(&tx)
            .await
            .map_err(|e| call_err(call.name(), e))?;

        let pending = self
            .signing
            .send_transaction(tx)
            .await
            .map_err(|e| rpc_err(call.name(), e))?;
        let tx_hash = *pending.tx_hash();

        debug!(
            domain_id = self.domain_id,
            call = call.name(),
            nonce = opts.nonce,
            tx_hash = %tx_hash,
            "Transaction broadcast"
        );
        Ok(tx_hash)
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| rpc_err("eth_getTransactionReceipt", e))?;
        Ok(receipt.map(|r| r.status()))
    }
}

#[async_trait]
impl FeeSource for EvmClient {
    async fn suggested_gas_price(&self) -> Result<u128, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| rpc_err("eth_gasPrice", e))
    }

    async fn base_fee(&self) -> Result<Option<u128>, ChainError> {
        let history = self
            .provider
            .get_fee_history(1, BlockNumberOrTag::Latest, &[])
            .await
            .map_err(|e| rpc_err("eth_feeHistory", e))?;
        Ok(history
            .base_fee_per_gas
            .last()
            .copied()
            .filter(|fee| *fee > 0))
    }

    async fn suggested_priority_fee(&self) -> Result<u128, ChainError> {
        self.provider
            .get_max_priority_fee_per_gas()
            .await
            .map_err(|e| rpc_err("eth_maxPriorityFeePerGas", e))
    }
}
