//! Single-flight reconnect scheduling with capped exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Ceiling for the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub multiplier: f64,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt may be made after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Connection status as seen by the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connected,
    Reconnecting { attempt: u32 },
    /// Attempt cap exceeded; nothing further is scheduled.
    Disconnected,
}

/// Owns at most one pending reconnect timer.
///
/// Scheduling a new attempt aborts the previous timer. Once the attempt cap
/// is exceeded the state becomes [`ConnectionState::Disconnected`] and
/// `schedule` refuses until [`mark_connected`](Self::mark_connected) or
/// [`reset`](Self::reset).
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
    pending: Option<JoinHandle<()>>,
    state: watch::Sender<ConnectionState>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            policy,
            attempts: 0,
            pending: None,
            state,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Attempts scheduled since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Schedule `attempt` after the next backoff delay, cancelling any
    /// pending timer. Returns `false` once the attempt cap is exceeded.
    pub fn schedule<F, Fut>(&mut self, attempt: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.abort_pending();

        if !self.policy.should_retry(self.attempts) {
            tracing::warn!(
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts,
                "Reconnect attempts exhausted"
            );
            self.state.send_replace(ConnectionState::Disconnected);
            return false;
        }

        let delay = self.policy.delay_for_attempt(self.attempts);
        self.attempts += 1;
        self.state.send_replace(ConnectionState::Reconnecting {
            attempt: self.attempts,
        });
        tracing::info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            attempt().await;
        }));
        true
    }

    /// Record a successful connection and reset the attempt counter.
    ///
    /// A running attempt is left to finish.
    pub fn mark_connected(&mut self) {
        self.pending = None;
        self.attempts = 0;
        self.state.send_replace(ConnectionState::Connected);
    }

    /// Cancel any pending attempt and return to `Idle`.
    pub fn reset(&mut self) {
        self.abort_pending();
        self.attempts = 0;
        self.state.send_replace(ConnectionState::Idle);
    }

    /// Cancel any pending attempt without touching the counter.
    pub fn cancel(&mut self) {
        self.abort_pending();
    }

    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.abort_pending();
    }
}
