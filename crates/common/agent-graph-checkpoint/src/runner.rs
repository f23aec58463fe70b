//! Drives an external state producer against the store, one step at a time.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{CheckpointError, Result};
use crate::store::CheckpointStore;
use crate::types::{Checkpoint, CheckpointSource, Metadata, Payload};

/// Output of one producer step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Produced {
    pub payload: Payload,
    pub metadata: Metadata,
}

impl Produced {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Anything that can compute the next state from the prior one, such as a
/// compiled graph or a model call.
#[async_trait]
pub trait StateProducer: Send + Sync {
    /// `prior` is the payload at the active head, `None` for a fresh thread.
    async fn produce(&self, prior: Option<&Payload>) -> Result<Produced>;
}

#[derive(Clone)]
pub struct StepRunner {
    store: CheckpointStore,
}

impl StepRunner {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    /// Record client input on the active branch.
    pub async fn input(&self, thread_id: &str, namespace: &str, payload: Payload) -> Result<String> {
        self.store
            .append_to_active(thread_id, namespace, CheckpointSource::Input, payload, Metadata::new())
            .await
    }

    /// Record a manual state edit on the active branch.
    pub async fn update(
        &self,
        thread_id: &str,
        namespace: &str,
        payload: Payload,
        metadata: Metadata,
    ) -> Result<String> {
        self.store
            .append_to_active(thread_id, namespace, CheckpointSource::Update, payload, metadata)
            .await
    }

    /// Load the head payload, run the producer on it and append the result.
    #[instrument(skip(self, producer))]
    pub async fn step<P>(&self, thread_id: &str, namespace: &str, producer: &P) -> Result<Checkpoint>
    where
        P: StateProducer + ?Sized,
    {
        let prior = match self.store.get(thread_id, namespace, None).await {
            Ok(head) => Some(head.payload),
            Err(CheckpointError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let Produced { payload, metadata } = producer.produce(prior.as_ref()).await?;

        let checkpoint = self
            .store
            .append_checkpoint_to_active(thread_id, namespace, CheckpointSource::Loop, payload, metadata)
            .await?;

        debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            step = checkpoint.step,
            "Producer step recorded"
        );
        Ok(checkpoint)
    }
}
