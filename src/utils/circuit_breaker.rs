use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker Pattern Implementation
// ============================================================================
//
// Stops hammering an unhealthy bus: after `failure_threshold` consecutive
// failures calls are rejected for `timeout`, then a trial call decides.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Too many failures, requests blocked immediately
// - HalfOpen: Testing if service recovered, limited requests allowed
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

pub type StateObserver = Arc<dyn Fn(CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    state: Arc<Mutex<CircuitBreakerState>>,
    config: CircuitBreakerConfig,
    observer: Option<StateObserver>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before attempting recovery
    pub timeout: Duration,
    /// Number of successes needed to close circuit from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("operation failed: {0}")]
    OperationFailed(E),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
            config,
            observer: None,
        }
    }

    /// Called with the new state on every transition.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run `operation` behind the breaker. Only errors for which `trips`
    /// returns true count against it; a rejected message says nothing about
    /// bus health.
    pub async fn call_classified<F, T, E, C>(&self, operation: F, trips: C) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.admit().await?;

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                if trips(&err) {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Open {
            return Ok(());
        }
        let cooled_down = state
            .last_failure_time
            .is_none_or(|last_failure| last_failure.elapsed() >= self.config.timeout);
        if !cooled_down {
            return Err(CircuitBreakerError::CircuitOpen);
        }
        tracing::info!(breaker = %self.name, "Circuit breaker transitioning to HalfOpen");
        state.state = CircuitState::HalfOpen;
        state.success_count = 0;
        self.notify(CircuitState::HalfOpen);
        Ok(())
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(
                        breaker = %self.name,
                        successes = state.success_count,
                        "✅ Circuit breaker closed"
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_time = None;
                    self.notify(CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        "Circuit breaker opened"
                    );
                    state.state = CircuitState::Open;
                    self.notify(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "Failure during half-open, reopening circuit");
                state.state = CircuitState::Open;
                state.success_count = 0;
                self.notify(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn notify(&self, state: CircuitState) {
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Manually reset the circuit breaker
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
        self.notify(CircuitState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, Duration::from_secs(1), 2);

        for _ in 0..3 {
            let result = cb.call_classified(async { Err::<(), _>("error") }, |_| true).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.get_state().await, CircuitState::Open);

        let result = cb.call_classified(async { Ok::<_, &str>(()) }, |_| true).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let transitions = Arc::new(StdMutex::new(Vec::new()));
        let seen = transitions.clone();
        let cb = breaker(2, Duration::from_millis(50), 1).with_observer(Arc::new(move |state| {
            seen.lock().unwrap().push(state);
        }));

        for _ in 0..2 {
            let _ = cb.call_classified(async { Err::<(), _>("error") }, |_| true).await;
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call_classified(async { Ok::<_, &str>(()) }, |_| true).await;
        assert!(result.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(
            *transitions.lock().unwrap(),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_trip() {
        let cb = breaker(2, Duration::from_secs(60), 1);

        for _ in 0..5 {
            let result = cb.call_classified(async { Err::<(), _>("rejected") }, |_| false).await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed("rejected"))));
        }
        assert_eq!(cb.get_state().await, CircuitState::Closed);

        // a real failure still counts from zero
        let _ = cb.call_classified(async { Err::<(), _>("timeout") }, |_| true).await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }
}
