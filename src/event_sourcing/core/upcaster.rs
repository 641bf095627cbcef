use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Event Versioning Support
// ============================================================================
//
// eventType -> ordered chain of single-step transforms (v -> v+1). Stored
// payloads are never rewritten; upcasting happens on read, before decoding.
//
// ============================================================================

pub type UpcastFn = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
struct UpcastStep {
    from_version: i32,
    transform: UpcastFn,
}

#[derive(Clone, Default)]
pub struct UpcasterRegistry {
    chains: HashMap<String, Vec<UpcastStep>>,
}

impl UpcasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transform that lifts `event_type` from `from_version` to `from_version + 1`.
    pub fn register<F>(mut self, event_type: &str, from_version: i32, transform: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        let chain = self.chains.entry(event_type.to_string()).or_default();
        chain.retain(|step| step.from_version != from_version);
        chain.push(UpcastStep {
            from_version,
            transform: Arc::new(transform),
        });
        chain.sort_by_key(|step| step.from_version);
        self
    }

    /// Apply every consecutive step starting at `version`.
    ///
    /// Stops at the first missing step, so the returned version is the highest
    /// one reachable from the stored version.
    pub fn upcast(
        &self,
        event_type: &str,
        version: i32,
        payload: serde_json::Value,
    ) -> (i32, serde_json::Value) {
        let Some(chain) = self.chains.get(event_type) else {
            return (version, payload);
        };

        let stored_version = version;
        let mut version = version;
        let mut payload = payload;
        for step in chain {
            if step.from_version == version {
                payload = (step.transform)(payload);
                version += 1;
            }
        }

        if version != stored_version {
            tracing::trace!(
                event_type = %event_type,
                from_version = stored_version,
                to_version = version,
                "Upcast event payload"
            );
        }
        (version, payload)
    }

    /// Latest version this registry can produce for an event type, if any step exists.
    pub fn latest_version(&self, event_type: &str) -> Option<i32> {
        self.chains
            .get(event_type)
            .and_then(|chain| chain.last())
            .map(|step| step.from_version + 1)
    }
}

impl std::fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.chains.keys().collect();
        types.sort();
        f.debug_struct("UpcasterRegistry").field("event_types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> UpcasterRegistry {
        UpcasterRegistry::new()
            .register("PriceSet", 2, |mut v| {
                v["currency"] = json!("EUR");
                v
            })
            .register("PriceSet", 1, |v| json!({ "amount": v["price"] }))
    }

    #[test]
    fn test_chain_applies_in_version_order() {
        let (version, payload) = registry().upcast("PriceSet", 1, json!({"price": 10}));
        assert_eq!(version, 3);
        assert_eq!(payload, json!({"amount": 10, "currency": "EUR"}));
    }

    #[test]
    fn test_partial_chain_starts_mid_way() {
        let (version, payload) = registry().upcast("PriceSet", 2, json!({"amount": 5}));
        assert_eq!(version, 3);
        assert_eq!(payload["currency"], "EUR");
    }

    #[test]
    fn test_current_version_untouched() {
        let (version, payload) = registry().upcast("PriceSet", 3, json!({"amount": 1, "currency": "USD"}));
        assert_eq!(version, 3);
        assert_eq!(payload["currency"], "USD");
    }

    #[test]
    fn test_unregistered_type_passes_through() {
        let (version, payload) = registry().upcast("Other", 1, json!({"x": 1}));
        assert_eq!(version, 1);
        assert_eq!(payload, json!({"x": 1}));
        assert_eq!(registry().latest_version("PriceSet"), Some(3));
        assert_eq!(registry().latest_version("Other"), None);
    }
}
