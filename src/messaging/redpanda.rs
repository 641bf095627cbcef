use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use std::sync::Arc;
use std::time::Duration;

use super::bus::{BusMessage, MessageBus, PublishError};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka/Redpanda publisher with broker acknowledgement from all in-sync replicas.
pub struct RedpandaClient {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
}

impl RedpandaClient {
    pub fn new(brokers: &str, metrics: Option<Arc<Metrics>>) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "5000")
            .create()?;

        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        };
        let mut circuit_breaker = CircuitBreaker::new("redpanda", cb_config);
        if let Some(metrics) = &metrics {
            circuit_breaker = circuit_breaker.with_observer(metrics.circuit_breaker_observer("redpanda"));
        }

        tracing::info!(brokers = %brokers, "🔌 Redpanda producer created");
        Ok(Self {
            producer,
            circuit_breaker,
        })
    }

    pub async fn get_circuit_breaker_state(&self) -> CircuitState {
        self.circuit_breaker.get_state().await
    }

    pub async fn reset_circuit_breaker(&self) {
        self.circuit_breaker.reset().await;
    }

    async fn send(&self, message: &BusMessage) -> Result<(), PublishError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| classify(e))
    }
}

// A rejected record will be rejected again; everything else may heal
fn classify(error: KafkaError) -> PublishError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize,
        ) => PublishError::Permanent(error.to_string()),
        _ => PublishError::Transient(error.to_string()),
    }
}

#[async_trait]
impl MessageBus for RedpandaClient {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        let result = self
            .circuit_breaker
            .call_classified(self.send(message), |e| matches!(e, PublishError::Transient(_)))
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %message.topic, key = %message.key, "Published to Redpanda");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                Err(PublishError::Transient("circuit breaker open for Redpanda".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::warn!(error = %e, topic = %message.topic, "Failed to publish to Redpanda");
                Err(e)
            }
        }
    }
}
