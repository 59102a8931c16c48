//! # Channel Runtime
//!
//! Topic-based, at-least-once delivery of deferred work.
//!
//! ```text
//! publish ──► [topic queue] ──► consumer ──► handler ──► Completed
//!                                   │            │
//!                                   │            └─ retryable error ──► backoff ──► redeliver
//!                                   │            └─ other error / retries spent ──► Failed (dead letter)
//!                                   └─ up to `max_in_flight` deliveries at once
//! ```
//!
//! `publish` returns as soon as the message sits in the topic's bounded queue;
//! it never waits for the handler. A queue exists from the first publish or
//! subscribe, so messages published before the consumer starts wait for it.
//! Each topic has exactly one consumer group.

use super::message::{
    ChannelHandler, ChannelMessage, DeadLetter, DeliveryContext, DeliveryOutcome, MessageState,
};
use crate::config::ChannelConfig;
use crate::context::CallContext;
use crate::error::{ChannelError, ServiceError};
use crate::events::EventBus;
use crate::store::Record;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

struct TopicQueue {
    sender: mpsc::Sender<ChannelMessage>,
    /// Taken by the topic's single consumer.
    receiver: Option<mpsc::Receiver<ChannelMessage>>,
}

#[derive(Debug, Default)]
struct DeliveryStats {
    published: AtomicU64,
    delivered: AtomicU64,
    completed: AtomicU64,
    redelivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub completed: u64,
    pub redelivered: u64,
    pub failed: u64,
}

struct Inner {
    config: ChannelConfig,
    events: EventBus,
    topics: Mutex<HashMap<String, TopicQueue>>,
    handlers: Mutex<HashMap<String, Arc<dyn ChannelHandler>>>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    stats: DeliveryStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ChannelRuntime {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRuntime")
            .field("config", &self.inner.config)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChannelRuntime {
    pub fn new(config: ChannelConfig, events: EventBus) -> Self {
        let (outcomes, _) = broadcast::channel(config.buffer.max(16));
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                topics: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                outcomes,
                dead_letters: Mutex::new(VecDeque::new()),
                stats: DeliveryStats::default(),
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Hands `payload` to the topic queue and returns the message id.
    ///
    /// Waits only for queue capacity, never for the handler.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Record,
        ctx: &CallContext,
    ) -> Result<Uuid, ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let sender = self.inner.queue(topic)?;
        let message = ChannelMessage::new(topic, payload, ctx.correlation());
        let id = message.id;

        // Published is recorded before the consumer can see the message.
        let permit = sender
            .reserve()
            .await
            .map_err(|_| ChannelError::TopicClosed(topic.to_string()))?;
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        self.inner.record(id, topic, MessageState::Published, 0, None);
        permit.send(message);

        debug!(topic, message_id = %id, "Published");
        Ok(id)
    }

    /// Starts the consumer for `topic`. Each topic takes one subscription.
    pub fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<(), ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let receiver = {
            let mut topics = self.inner.topics.lock().map_err(|_| ChannelError::Closed)?;
            let queue = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicQueue::new(self.inner.config.buffer));
            queue
                .receiver
                .take()
                .ok_or_else(|| ChannelError::DuplicateSubscription(topic.to_string()))?
        };

        self.inner
            .handlers
            .lock()
            .map_err(|_| ChannelError::Closed)?
            .insert(topic.to_string(), handler.clone());

        let worker = tokio::spawn(consume(
            self.inner.clone(),
            topic.to_string(),
            group.to_string(),
            receiver,
            handler,
        ));
        self.inner
            .workers
            .lock()
            .map_err(|_| ChannelError::Closed)?
            .push(worker);
        info!(topic, group, "Subscribed");
        Ok(())
    }

    /// Runs the topic's handler once, in the caller's task, bypassing the
    /// queue and the retry policy.
    pub async fn invoke_local(
        &self,
        topic: &str,
        payload: Record,
        ctx: &CallContext,
    ) -> Result<(), ServiceError> {
        let handler = self.inner.handler(topic)?;

        let mut message = ChannelMessage::new(topic, payload, ctx.correlation());
        message.attempt = 1;
        let delivery = DeliveryContext::new(&message, self.inner.events.clone());
        handler.handle(delivery, message).await
    }

    /// State transitions of every message, for observers and tests.
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .map(|letters| letters.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        let stats = &self.inner.stats;
        DeliveryStatsSnapshot {
            published: stats.published.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            redelivered: stats.redelivered.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner
            .handlers
            .lock()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops accepting messages, lets consumers drain their queues and waits
    /// for in-flight deliveries.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.close_queues();
        for worker in self.inner.take_workers() {
            if let Err(e) = worker.await {
                error!(error = %e, "Channel consumer panicked");
            }
        }
        info!(stats = ?self.stats(), "Channel runtime stopped");
    }
}

impl TopicQueue {
    fn new(buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

impl Inner {
    fn queue(&self, topic: &str) -> Result<mpsc::Sender<ChannelMessage>, ChannelError> {
        let mut topics = self.topics.lock().map_err(|_| ChannelError::Closed)?;
        let queue = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicQueue::new(self.config.buffer));
        Ok(queue.sender.clone())
    }

    fn handler(&self, topic: &str) -> Result<Arc<dyn ChannelHandler>, ChannelError> {
        let handlers = self.handlers.lock().map_err(|_| ChannelError::Closed)?;
        handlers
            .get(topic)
            .cloned()
            .ok_or_else(|| ChannelError::NoHandler(topic.to_string()))
    }

    /// Dropping the senders ends each consumer once its queue is drained.
    fn close_queues(&self) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.clear();
        }
    }

    fn take_workers(&self) -> Vec<JoinHandle<()>> {
        self.workers
            .lock()
            .map(|mut workers| std::mem::take(&mut *workers))
            .unwrap_or_default()
    }

    fn record(
        &self,
        message_id: Uuid,
        topic: &str,
        state: MessageState,
        attempt: u32,
        error: Option<String>,
    ) {
        let _ = self.outcomes.send(DeliveryOutcome {
            message_id,
            topic: topic.to_string(),
            state,
            attempt,
            error,
        });
    }

    fn dead_letter(&self, message: ChannelMessage, error: ServiceError) {
        if let Ok(mut letters) = self.dead_letters.lock() {
            if letters.len() >= self.config.dead_letter_capacity.max(1) {
                letters.pop_front();
            }
            letters.push_back(DeadLetter { message, error });
        }
    }
}

async fn consume(
    inner: Arc<Inner>,
    topic: String,
    group: String,
    mut receiver: mpsc::Receiver<ChannelMessage>,
    handler: Arc<dyn ChannelHandler>,
) {
    let permits = Arc::new(Semaphore::new(inner.config.max_in_flight.max(1)));
    let mut in_flight = JoinSet::new();
    info!(%topic, %group, "Consumer started");

    while let Some(message) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let inner = inner.clone();
        let handler = handler.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            deliver(&inner, handler, message).await;
        });
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(%topic, error = %e, "Delivery task panicked");
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(%topic, error = %e, "Delivery task panicked");
        }
    }
    info!(%topic, %group, "Consumer stopped");
}

/// Delivers until the handler succeeds, fails for good or retries run out.
async fn deliver(inner: &Inner, handler: Arc<dyn ChannelHandler>, mut message: ChannelMessage) {
    loop {
        message.attempt += 1;
        let span = info_span!(
            "channel.delivery",
            topic = %message.topic,
            message_id = %message.id,
            attempt = message.attempt
        );
        inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
        inner.record(
            message.id,
            &message.topic,
            MessageState::Delivered,
            message.attempt,
            None,
        );

        let ctx = DeliveryContext::new(&message, inner.events.clone());
        let attempt = {
            let handler = handler.clone();
            let message = message.clone();
            tokio::spawn(async move { handler.handle(ctx, message).await }.instrument(span.clone()))
        };
        // A panicking handler counts as a retryable failure.
        let result = attempt
            .await
            .unwrap_or_else(|e| Err(ServiceError::Handler(format!("handler panicked: {e}"))));

        match result {
            Ok(()) => {
                inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                inner.record(
                    message.id,
                    &message.topic,
                    MessageState::Completed,
                    message.attempt,
                    None,
                );
                span.in_scope(|| debug!("Completed"));
                return;
            }
            Err(e) if e.is_retryable() && message.attempt <= inner.config.max_retries => {
                let delay = inner.config.retry_delay(message.attempt);
                inner.stats.redelivered.fetch_add(1, Ordering::Relaxed);
                span.in_scope(|| warn!(error = %e, ?delay, "Delivery failed, redelivering"));
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                inner.record(
                    message.id,
                    &message.topic,
                    MessageState::Failed,
                    message.attempt,
                    Some(e.to_string()),
                );
                span.in_scope(|| {
                    error!(
                        error = %e,
                        retryable = e.is_retryable(),
                        "Delivery failed, moved to dead letters"
                    )
                });
                inner.dead_letter(message, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn payload(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn runtime(max_retries: u32) -> ChannelRuntime {
        ChannelRuntime::new(
            ChannelConfig {
                max_retries,
                retry_backoff_ms: 1,
                ..Default::default()
            },
            EventBus::default(),
        )
    }

    async fn wait_for(
        outcomes: &mut broadcast::Receiver<DeliveryOutcome>,
        state: MessageState,
    ) -> DeliveryOutcome {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let outcome = outcomes.recv().await.unwrap();
                if outcome.state == state {
                    return outcome;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Fails with a retryable error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<ChannelMessage>>,
    }

    #[async_trait]
    impl ChannelHandler for Flaky {
        async fn handle(
            &self,
            _ctx: DeliveryContext,
            message: ChannelMessage,
        ) -> Result<(), ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(message);
            if call < self.failures {
                Err(ServiceError::Handler("external call failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_publish_returns_before_handler_completes() {
        struct Gated(Arc<Notify>);

        #[async_trait]
        impl ChannelHandler for Gated {
            async fn handle(&self, _: DeliveryContext, _: ChannelMessage) -> Result<(), ServiceError> {
                self.0.notified().await;
                Ok(())
            }
        }

        let channels = runtime(0);
        let gate = Arc::new(Notify::new());
        let mut outcomes = channels.outcomes();
        channels
            .subscribe("inventory.reserve", "inventory", Arc::new(Gated(gate.clone())))
            .unwrap();

        channels
            .publish("inventory.reserve", payload(json!({ "quantity": 1 })), &CallContext::new())
            .await
            .unwrap();
        wait_for(&mut outcomes, MessageState::Delivered).await;
        assert_eq!(channels.stats().completed, 0);

        gate.notify_one();
        wait_for(&mut outcomes, MessageState::Completed).await;
        assert_eq!(channels.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_with_same_message() {
        let channels = runtime(3);
        let handler = flaky(2);
        let mut outcomes = channels.outcomes();
        channels.subscribe("t.work", "g", handler.clone()).unwrap();

        let ctx = CallContext::new();
        let id = channels.publish("t.work", payload(json!({ "n": 1 })), &ctx).await.unwrap();
        let done = wait_for(&mut outcomes, MessageState::Completed).await;

        assert_eq!(done.message_id, id);
        assert_eq!(done.attempt, 3);
        let seen = handler.seen.lock().unwrap();
        assert!(seen.iter().all(|m| m.id == id && m.payload["n"] == 1));
        assert!(seen.iter().all(|m| m.correlation.correlation_id == ctx.correlation_id));
        assert_eq!(channels.stats().redelivered, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letters() {
        let channels = runtime(1);
        let mut outcomes = channels.outcomes();
        channels.subscribe("t.work", "g", flaky(10)).unwrap();

        channels.publish("t.work", payload(json!({})), &CallContext::new()).await.unwrap();
        let failed = wait_for(&mut outcomes, MessageState::Failed).await;

        assert_eq!(failed.attempt, 2);
        let letters = channels.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message.topic, "t.work");
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_redelivered() {
        struct Rejecting;

        #[async_trait]
        impl ChannelHandler for Rejecting {
            async fn handle(&self, _: DeliveryContext, _: ChannelMessage) -> Result<(), ServiceError> {
                Err(ServiceError::EntityNotFound("42".into()))
            }
        }

        let channels = runtime(5);
        let mut outcomes = channels.outcomes();
        channels.subscribe("t.work", "g", Arc::new(Rejecting)).unwrap();
        channels.publish("t.work", payload(json!({})), &CallContext::new()).await.unwrap();

        let failed = wait_for(&mut outcomes, MessageState::Failed).await;
        assert_eq!(failed.attempt, 1);
        assert_eq!(channels.stats().redelivered, 0);
    }

    #[tokio::test]
    async fn test_messages_published_before_subscribe_are_kept() {
        let channels = runtime(0);
        let handler = flaky(0);
        channels.publish("t.early", payload(json!({ "n": 7 })), &CallContext::new()).await.unwrap();

        let mut outcomes = channels.outcomes();
        channels.subscribe("t.early", "g", handler.clone()).unwrap();
        wait_for(&mut outcomes, MessageState::Completed).await;
        assert_eq!(handler.seen.lock().unwrap()[0].payload["n"], 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_outcomes_follow_state_order() {
        let channels = runtime(0);
        channels.subscribe("t.order", "g", flaky(0)).unwrap();
        let mut outcomes = channels.outcomes();

        let mut ids = Vec::new();
        for n in 0..50 {
            let id = channels
                .publish("t.order", payload(json!({ "n": n })), &CallContext::new())
                .await
                .unwrap();
            ids.push(id);
        }
        channels.shutdown().await;

        let mut states: HashMap<Uuid, Vec<MessageState>> = HashMap::new();
        while let Ok(outcome) = outcomes.try_recv() {
            states.entry(outcome.message_id).or_default().push(outcome.state);
        }
        for id in ids {
            assert_eq!(
                states[&id],
                vec![MessageState::Published, MessageState::Delivered, MessageState::Completed]
            );
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscription_and_shutdown() {
        let channels = runtime(0);
        channels.subscribe("t.once", "g", flaky(0)).unwrap();
        assert_eq!(
            channels.subscribe("t.once", "g", flaky(0)),
            Err(ChannelError::DuplicateSubscription("t.once".into()))
        );

        channels.shutdown().await;
        assert_eq!(
            channels.publish("t.once", Record::new(), &CallContext::new()).await,
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn test_invoke_local_runs_handler_directly() {
        let channels = runtime(0);
        let handler = flaky(0);
        channels.subscribe("t.local", "g", handler.clone()).unwrap();

        channels
            .invoke_local("t.local", payload(json!({ "n": 3 })), &CallContext::new())
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(channels.stats().published, 0);

        let missing = channels.invoke_local("t.none", Record::new(), &CallContext::new()).await;
        assert!(matches!(missing, Err(ServiceError::Channel(ChannelError::NoHandler(_)))));
    }
}
