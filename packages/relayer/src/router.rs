//! Destination routing
//!
//! [`Router::send`] awaits the writer directly, so a slow destination holds
//! back the listener that feeds it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{DomainId, Message};
use crate::writers::{ProposalOutcome, WriterError};

/// Anything that can take a message to its destination chain
#[async_trait]
pub trait MessageWriter: Send + Sync {
    async fn write(&self, message: Message) -> Result<ProposalOutcome, WriterError>;
}

#[derive(Debug, Error)]
pub enum RouteError {
    /// No writer registered for the destination
    #[error("no writer registered for domain {0}")]
    NotFound(DomainId),

    #[error(transparent)]
    Writer(#[from] WriterError),
}

#[derive(Default)]
pub struct Router {
    writers: RwLock<HashMap<DomainId, Arc<dyn MessageWriter>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the writer for `domain_id`, replacing any previous one
    pub async fn set_writer(&self, domain_id: DomainId, writer: Arc<dyn MessageWriter>) {
        if self.writers.write().await.insert(domain_id, writer).is_some() {
            debug!(domain_id, "Replaced writer");
        }
    }

    pub async fn has_writer(&self, domain_id: DomainId) -> bool {
        self.writers.read().await.contains_key(&domain_id)
    }

    /// Deliver `message` to the writer for `destination` and wait for it
    pub async fn send(
        &self,
        destination: DomainId,
        message: Message,
    ) -> Result<ProposalOutcome, RouteError> {
        // Clone out so the map lock is not held across the write
        let writer = self
            .writers
            .read()
            .await
            .get(&destination)
            .cloned()
            .ok_or(RouteError::NotFound(destination))?;

        Ok(writer.write(message).await?)
    }
}
