use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::bus::{BusMessage, MessageBus, PublishError};

/// In-process bus recording every confirmed message, with scripted failures.
#[derive(Default)]
pub struct InMemoryBus {
    published: Mutex<Vec<BusMessage>>,
    rejected_ids: Mutex<HashSet<String>>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    attempts: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` publish calls fail transiently.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// While unavailable every publish fails transiently.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Permanently reject the message carrying this `message_id` header.
    pub fn reject_message(&self, message_id: impl Into<String>) {
        self.rejected_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.into());
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Publish calls made, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Transient("bus unavailable".to_string()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(PublishError::Transient("broker timeout".to_string()));
        }

        if let Some(message_id) = message.header("message_id") {
            let rejected = self
                .rejected_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(message_id);
            if rejected {
                return Err(PublishError::Permanent(format!("message {message_id} rejected")));
            }
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::IsTransient;

    fn message(id: &str) -> BusMessage {
        BusMessage {
            topic: "inventoryitem-events".to_string(),
            key: "k".to_string(),
            payload: b"{}".to_vec(),
            headers: vec![("message_id".to_string(), id.to_string())],
        }
    }

    #[tokio::test]
    async fn test_scripted_transient_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next(2);

        assert!(bus.publish(&message("a")).await.unwrap_err().is_transient());
        assert!(bus.publish(&message("a")).await.is_err());
        assert!(bus.publish(&message("a")).await.is_ok());
        assert_eq!(bus.attempts(), 3);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_message_is_permanent() {
        let bus = InMemoryBus::new();
        bus.reject_message("poison");

        let err = bus.publish(&message("poison")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(bus.publish(&message("fine")).await.is_ok());
        assert_eq!(bus.published()[0].header("message_id"), Some("fine"));
    }

    #[tokio::test]
    async fn test_unavailable_bus() {
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        assert!(matches!(bus.publish(&message("a")).await, Err(PublishError::Transient(_))));
        bus.set_unavailable(false);
        assert!(bus.publish(&message("a")).await.is_ok());
    }
}
