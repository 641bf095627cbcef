use std::sync::Arc;
use std::time::Instant;

use super::dead_letter::{DeadLetter, ErrorSink};
use super::envelope::{DefaultEnvelopeMapper, EnvelopeMapper};
use super::ForwardingError;
use crate::event_sourcing::core::{RawEvent, UpcasterRegistry};
use crate::messaging::{MessageBus, PublishError};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Publish Pipeline
// ============================================================================
//
// upcast -> map to integration envelope -> publish (confirmed) -> done
//
// Transient bus failures are retried with exponential backoff (forever by
// default). A permanent failure sends the event to the error sink and counts
// as handled, so one poison event never stalls a shard.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    DeadLettered,
}

pub struct PublishPipeline {
    bus: Arc<dyn MessageBus>,
    mapper: Arc<dyn EnvelopeMapper>,
    upcasters: UpcasterRegistry,
    retry: RetryConfig,
    error_sink: Option<Arc<dyn ErrorSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl PublishPipeline {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            mapper: Arc::new(DefaultEnvelopeMapper::default()),
            upcasters: UpcasterRegistry::new(),
            retry: RetryConfig::unbounded(),
            error_sink: None,
            metrics: None,
        }
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn EnvelopeMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_upcasters(mut self, upcasters: UpcasterRegistry) -> Self {
        self.upcasters = upcasters;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(error_sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish one stored event; returns once the bus confirmed it or it was dead-lettered.
    pub async fn publish(&self, event: &RawEvent) -> Result<PublishOutcome, ForwardingError> {
        let started = Instant::now();
        let event = event.upcast(&self.upcasters);

        let integration = match self.mapper.map(&event) {
            Ok(integration) => integration,
            Err(e) => return self.dead_letter(&event, None, e.to_string()).await,
        };
        let message = match integration.to_bus_message() {
            Ok(message) => message,
            Err(e) => return self.dead_letter(&event, Some(integration.topic), e.to_string()).await,
        };

        let bus = &self.bus;
        let metrics = &self.metrics;
        let message_ref = &message;
        let result = retry_on_transient(self.retry.clone(), |attempt| async move {
            if attempt > 1 {
                if let Some(metrics) = metrics {
                    metrics.record_retry_attempt("publish");
                }
            }
            let result = bus.publish(message_ref).await;
            if let (Err(PublishError::Transient(_)), Some(metrics)) = (&result, metrics) {
                metrics.record_publish_failure("transient");
            }
            result
        })
        .await;

        match result {
            RetryResult::Success(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_forwarded(&event.event_type, started.elapsed().as_secs_f64());
                }
                tracing::debug!(
                    event_id = %event.event_id,
                    aggregate_id = %event.aggregate_id,
                    sequence_number = event.sequence_number,
                    topic = %message.topic,
                    "Event published"
                );
                Ok(PublishOutcome::Published)
            }
            RetryResult::PermanentFailure(e) => self.dead_letter(&event, Some(message.topic), e.to_string()).await,
            RetryResult::Failed(e) => Err(ForwardingError::Transient(e)),
        }
    }

    async fn dead_letter(
        &self,
        event: &RawEvent,
        topic: Option<String>,
        reason: String,
    ) -> Result<PublishOutcome, ForwardingError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish_failure("permanent");
        }

        let Some(sink) = &self.error_sink else {
            return Err(ForwardingError::Permanent {
                event_id: event.event_id,
                reason,
            });
        };

        tracing::error!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            sequence_number = event.sequence_number,
            reason = %reason,
            "Unpublishable event routed to error sink"
        );
        sink.record(DeadLetter::from_event(event, topic, reason)).await?;
        Ok(PublishOutcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::DeadLetterActor;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use crate::forwarding::{DeadLetterStore, IntegrationEvent, InMemoryDeadLetterStore};
    use crate::messaging::InMemoryBus;
    use kameo::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn stock_changed_v1() -> RawEvent {
        let mut raw = EventEnvelope::new(
            Uuid::new_v4(),
            "InventoryItem",
            "StockChanged",
            1,
            json!({"delta": -3}),
            EventMetadata::default(),
        );
        raw.sequence_number = 2;
        raw
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::unbounded().with_delays(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_publishes_upcast_payload() {
        let bus = Arc::new(InMemoryBus::new());
        let upcasters = UpcasterRegistry::new().register("StockChanged", 1, |mut payload| {
            payload["reason"] = json!("unspecified");
            payload
        });
        let pipeline = PublishPipeline::new(bus.clone()).with_upcasters(upcasters);

        let outcome = pipeline.publish(&stock_changed_v1()).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published);

        let body: IntegrationEvent = serde_json::from_slice(&bus.published()[0].payload).unwrap();
        assert_eq!(body.event_version, 2);
        assert_eq!(body.payload["reason"], "unspecified");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_confirmed() {
        let bus = Arc::new(InMemoryBus::new());
        bus.fail_next(4);
        let metrics = Arc::new(Metrics::new().unwrap());
        let pipeline = PublishPipeline::new(bus.clone())
            .with_retry(fast_retry())
            .with_metrics(metrics.clone());

        assert_eq!(pipeline.publish(&stock_changed_v1()).await.unwrap(), PublishOutcome::Published);
        assert_eq!(bus.attempts(), 5);
        assert_eq!(bus.published_count(), 1);
        assert_eq!(metrics.retry_attempts_total.with_label_values(&["publish"]).get(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_to_dead_letter_actor() {
        let bus = Arc::new(InMemoryBus::new());
        let event = stock_changed_v1();
        bus.reject_message(event.event_id.to_string());

        let store = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = DeadLetterActor::spawn(DeadLetterActor::new(store.clone(), None));
        let pipeline = PublishPipeline::new(bus.clone()).with_error_sink(Arc::new(dlq));

        assert_eq!(pipeline.publish(&event).await.unwrap(), PublishOutcome::DeadLettered);
        assert_eq!(bus.attempts(), 1);
        assert_eq!(store.stats().await.unwrap().total_messages, 1);
        assert_eq!(
            store.get(event.event_id).await.unwrap().topic.as_deref(),
            Some("inventoryitem-events")
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_without_sink_is_an_error() {
        let bus = Arc::new(InMemoryBus::new());
        let event = stock_changed_v1();
        bus.reject_message(event.event_id.to_string());

        let err = PublishPipeline::new(bus).publish(&event).await.unwrap_err();
        assert!(matches!(err, ForwardingError::Permanent { event_id, .. } if event_id == event.event_id));
    }

    #[tokio::test]
    async fn test_bounded_retry_reports_transient() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_unavailable(true);
        let pipeline = PublishPipeline::new(bus).with_retry(fast_retry().with_max_attempts(3));

        let err = pipeline.publish(&stock_changed_v1()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
