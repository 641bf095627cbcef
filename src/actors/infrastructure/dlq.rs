use async_trait::async_trait;
use kameo::actor::ActorRef;
use kameo::error::{Infallible, SendError};
use kameo::message::{Context, Message};
use kameo::Actor;
use std::sync::Arc;

use crate::forwarding::{DeadLetter, DeadLetterError, DeadLetterStats, DeadLetterStore, ErrorSink};
use crate::metrics::Metrics;

// ============================================================================
// Dead Letter Queue Actor
// ============================================================================
//
// Single writer for the dead letter store. Every forwarder shard routes its
// poison events here; operators query it for manual follow-up.
//
// ============================================================================

pub struct DeadLetterActor {
    store: Arc<dyn DeadLetterStore>,
    metrics: Option<Arc<Metrics>>,
    recorded: u64,
}

impl DeadLetterActor {
    pub fn new(store: Arc<dyn DeadLetterStore>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            store,
            metrics,
            recorded: 0,
        }
    }
}

impl Actor for DeadLetterActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("DeadLetterActor started - Dead Letter Queue ready");
        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordDeadLetter(pub DeadLetter);

#[derive(Debug, Clone, Copy)]
pub struct GetDeadLetters {
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GetDeadLetterStats;

// ============================================================================
// Handlers
// ============================================================================

impl Message<RecordDeadLetter> for DeadLetterActor {
    type Reply = Result<(), DeadLetterError>;

    async fn handle(&mut self, msg: RecordDeadLetter, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let letter = msg.0;
        tracing::error!(
            event_id = %letter.id,
            event_type = %letter.event_type,
            aggregate_id = %letter.aggregate_id,
            sequence_number = letter.sequence_number,
            error = %letter.error_message,
            "💀 Adding event to Dead Letter Queue"
        );

        let event_type = letter.event_type.clone();
        self.store.record(letter).await?;
        self.recorded += 1;

        if let Some(metrics) = &self.metrics {
            metrics.record_dlq_message(&event_type);
        }
        tracing::debug!(recorded = self.recorded, "Dead letter stored");
        Ok(())
    }
}

impl Message<GetDeadLetters> for DeadLetterActor {
    type Reply = Result<Vec<DeadLetter>, DeadLetterError>;

    async fn handle(&mut self, msg: GetDeadLetters, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.store.list(msg.limit).await
    }
}

impl Message<GetDeadLetterStats> for DeadLetterActor {
    type Reply = Result<DeadLetterStats, DeadLetterError>;

    async fn handle(&mut self, _msg: GetDeadLetterStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.store.stats().await
    }
}

#[async_trait]
impl ErrorSink for ActorRef<DeadLetterActor> {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DeadLetterError> {
        match self.ask(RecordDeadLetter(dead_letter)).await {
            Ok(()) => Ok(()),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(_) => Err(DeadLetterError::Unavailable("dead letter actor is not running".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use crate::forwarding::InMemoryDeadLetterStore;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_actor_records_and_reports() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let dlq = DeadLetterActor::spawn(DeadLetterActor::new(store.clone(), Some(metrics.clone())));

        let event = EventEnvelope::new(Uuid::new_v4(), "InventoryItem", "ItemCreated", 1, json!({}), EventMetadata::default());
        ErrorSink::record(&dlq, DeadLetter::from_event(&event, None, "message too large"))
            .await
            .unwrap();

        let letters = dlq.ask(GetDeadLetters { limit: 10 }).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, event.event_id);

        let stats = dlq.ask(GetDeadLetterStats).await.unwrap();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(metrics.dlq_messages_total.get(), 1);
    }
}
