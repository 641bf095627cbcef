use std::sync::Arc;
use uuid::Uuid;

use crate::event_sourcing::core::EventMetadata;
use crate::event_sourcing::repository::{AggregateRepository, RepositoryError};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, IsTransient, RetryConfig};

use super::aggregate::InventoryItem;
use super::commands::InventoryCommand;
use super::errors::InventoryError;

// ============================================================================
// Inventory Command Handler
// ============================================================================
//
// Orchestrates: Command → load Aggregate → Events → save (conditional append)
//
// A ConcurrencyConflict means someone else wrote first. The whole cycle is
// re-run against the fresh state (bounded attempts); every other failure is
// returned as-is.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command rejected: {0}")]
    Rejected(#[from] InventoryError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl IsTransient for CommandError {
    fn is_transient(&self) -> bool {
        matches!(self, CommandError::Repository(e) if e.is_retryable())
    }
}

pub struct InventoryCommandHandler {
    repository: AggregateRepository<InventoryItem>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl InventoryCommandHandler {
    pub fn new(repository: AggregateRepository<InventoryItem>) -> Self {
        Self {
            repository,
            retry: RetryConfig::conservative(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn repository(&self) -> &AggregateRepository<InventoryItem> {
        &self.repository
    }

    /// Handle a command and persist resulting events. Returns the new version.
    pub async fn handle(
        &self,
        aggregate_id: Uuid,
        command: InventoryCommand,
        metadata: EventMetadata,
    ) -> Result<i64, CommandError> {
        let repository = &self.repository;
        let metrics = &self.metrics;
        let command = &command;
        let metadata = &metadata;

        retry_on_transient(self.retry.clone(), move |attempt| async move {
            if attempt > 1 {
                tracing::debug!(aggregate_id = %aggregate_id, attempt = attempt, "Re-running command after conflict");
                if let Some(metrics) = metrics {
                    metrics.record_retry_attempt("command");
                }
            }

            let mut root = repository.load(aggregate_id).await?;
            let creates = matches!(command, InventoryCommand::CreateItem { .. });
            if !creates && root.version() == 0 {
                return Err(InventoryError::NotCreated(aggregate_id).into());
            }

            root.execute(command, metadata)?;
            Ok::<i64, CommandError>(repository.save(&mut root).await?)
        })
        .await
        .into_result()
    }
}
