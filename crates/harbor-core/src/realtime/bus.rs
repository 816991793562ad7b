//! In-process publish/subscribe over named channels.
//!
//! Each subscription owns a bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the new message is rejected for that
//! subscriber and counted as dropped. Closed subscribers are pruned on the
//! next publish.

use super::message::{BroadcastMessage, EventPayload, Priority};
use super::policy::{Access, AccessPolicySet, Subject};
use super::rate_limit::RateLimiter;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue capacity per subscription.
    pub capacity: usize,
    /// TTL applied when a publish does not set one.
    pub default_ttl: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            default_ttl: None,
        }
    }
}

impl BusConfig {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Rate-limit key within the channel; defaults to the payload's path or
    /// status, then its event type.
    pub key_hint: Option<String>,
    pub priority: Priority,
    /// Drop the message if not delivered within this long.
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key_hint: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of an accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Broadcast identifier.
    pub id: Uuid,
    /// Subscribers that received the message.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<BroadcastMessage>>,
}

struct BusInner {
    channels: DashMap<String, Vec<Subscriber>>,
    policies: AccessPolicySet,
    limiter: RateLimiter,
    config: BusConfig,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl BusInner {
    fn remove(&self, channel: &str, id: u64) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.retain(|s| s.id != id);
        }
        self.channels.remove_if(channel, |_, subs| subs.is_empty());
    }
}

/// Access-controlled broadcast bus.
///
/// Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct ChannelBus {
    inner: Arc<BusInner>,
}

impl ChannelBus {
    pub fn new(policies: AccessPolicySet, limiter: RateLimiter, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                policies,
                limiter,
                config,
                next_id: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Policies in force.
    pub fn policies(&self) -> &AccessPolicySet {
        &self.inner.policies
    }

    /// Rate limiter shared by every channel.
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.channels.get(channel).map_or(0, |subs| subs.len())
    }

    /// Messages rejected by full subscriber queues since start.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Subscribe to `channel`. The subscription ends when the returned value
    /// is dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe(&self, channel: &str, subject: &Subject) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.inner.config.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subs = self.inner.channels.entry(channel.to_string()).or_default();
            if let Err(e) = self
                .inner
                .policies
                .evaluate(channel, subject, Access::Subscribe, subs.len())
            {
                let empty = subs.is_empty();
                drop(subs);
                if empty {
                    self.inner.channels.remove_if(channel, |_, s| s.is_empty());
                }
                tracing::debug!(channel, subject = %subject.id, error = %e, "Subscribe denied");
                return Err(e);
            }
            subs.push(Subscriber { id, tx });
        }

        tracing::debug!(channel, subject = %subject.id, subscription_id = id, "Subscribed");
        Ok(Subscription {
            id,
            channel: channel.to_string(),
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribe with a handler; one task per subscription reads the queue
    /// and awaits the handler for each message in order.
    pub fn subscribe_with<H>(&self, channel: &str, subject: &Subject, handler: H) -> Result<SubscriptionHandle>
    where
        H: MessageHandler,
    {
        let mut subscription = self.subscribe(channel, subject)?;
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                handler.handle(message).await;
            }
        });
        Ok(SubscriptionHandle {
            channel: channel.to_string(),
            task,
        })
    }

    /// Publish `payload` on `channel`.
    ///
    /// Fails with `AccessDenied` if the subject may not publish, and with
    /// `RateLimited` if the `(channel, key)` budget is exhausted.
    pub fn publish(
        &self,
        channel: &str,
        subject: &Subject,
        payload: EventPayload,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let policy = self.inner.policies.evaluate(
            channel,
            subject,
            Access::Publish,
            self.subscriber_count(channel),
        )?;

        let key = options
            .key_hint
            .as_deref()
            .or_else(|| payload.default_key())
            .unwrap_or_else(|| payload.event_type());
        let limit_key = format!("{channel}|{key}");
        let decision = self
            .inner
            .limiter
            .check_and_increment_with(&limit_key, &policy.rate);
        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(policy.rate.window);
            tracing::debug!(
                channel,
                key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Publish rate limited"
            );
            return Err(CoreError::RateLimited { retry_after });
        }

        let mut message = BroadcastMessage::new(channel, subject.id.clone(), payload);
        message.priority = options.priority;
        if let Some(ttl) = options.ttl.or(self.inner.config.default_ttl) {
            message.expires_at = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| message.sent_at.checked_add_signed(ttl));
        }

        let id = message.id;
        let event = message.event_type();
        let (delivered, dropped) = self.deliver(Arc::new(message));
        tracing::debug!(channel, event, message_id = %id, delivered, dropped, "Published");

        Ok(PublishReceipt {
            id,
            delivered,
            dropped,
        })
    }

    fn deliver(&self, message: Arc<BroadcastMessage>) -> (usize, usize) {
        if message.is_expired(Utc::now()) {
            return (0, 0);
        }

        let (mut delivered, mut dropped) = (0, 0);
        if let Some(mut subs) = self.inner.channels.get_mut(&message.channel) {
            subs.retain(|sub| match sub.tx.try_send(Arc::clone(&message)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        if dropped > 0 {
            self.inner
                .dropped_total
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::warn!(channel = %message.channel, dropped, "Subscriber queues full, message rejected");
        }
        (delivered, dropped)
    }
}

/// A live subscription.
pub struct Subscription {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Arc<BroadcastMessage>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next unexpired message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastMessage>> {
        loop {
            let message = self.rx.recv().await?;
            if message.is_expired(Utc::now()) {
                tracing::trace!(channel = %self.channel, message_id = %message.id, "Skipping expired message");
                continue;
            }
            return Some(message);
        }
    }

    /// End the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.channel, self.id);
            tracing::debug!(channel = %self.channel, subscription_id = self.id, "Unsubscribed");
        }
    }
}

/// Handle to a handler-driven subscription; dropping it unsubscribes.
pub struct SubscriptionHandle {
    channel: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Receives delivered messages. Handlers must tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<BroadcastMessage>);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<BroadcastMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Arc<BroadcastMessage>) {
        (self)(message).await
    }
}
