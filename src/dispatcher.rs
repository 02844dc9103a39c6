// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module delivers messages from queues to subscribed consumers.
//!
//! Every subscription runs its own delivery loop on a tokio task. The loop observes
//! its cancel flag at the top of each iteration, takes the next message the queue
//! grants it (prefetch and round-robin are enforced by the queue), hands it to the
//! consumer stream and otherwise parks on the queue's notification. Unacked
//! deliveries may carry a timeout after which they are requeued.
//!
//! Cancellation is cooperative. An immediate cancel requeues everything the consumer
//! still holds; a graceful one waits until every in-flight delivery is resolved
//! before the consumer leaves the registry.

use crate::{
    consumer::{
        consume, ConsumerDefinition, ConsumerHandler, ConsumerState, DeliveryStream,
        GENERATED_TAG_PREFIX,
    },
    errors::AmqpError,
    message::{Delivery, DeliveryId},
    queue::Queue,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Stream buffer used when the consumer has no prefetch limit
pub const UNBOUNDED_PREFETCH_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelMode {
    Running,
    Graceful,
    Immediate,
}

struct ConsumerEntry {
    queue: Arc<Queue>,
    cancel: watch::Sender<CancelMode>,
    state: watch::Receiver<ConsumerState>,
}

type Registry = Arc<Mutex<HashMap<String, ConsumerEntry>>>;

/// Registry of consumers and owner of their delivery loops.
#[derive(Clone, Default)]
pub struct Dispatcher {
    consumers: Registry,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ConsumerEntry>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a consumer on `queue` and starts its delivery loop.
    ///
    /// An empty tag is replaced by a generated one. Tags are unique per dispatcher.
    /// Must be called within a tokio runtime.
    pub fn subscribe(
        &self,
        queue: Arc<Queue>,
        mut def: ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        if def.tag.is_empty() {
            def.tag = format!("{}{}", GENERATED_TAG_PREFIX, Uuid::new_v4().simple());
        }

        let mut registry = self.registry();
        if registry.contains_key(&def.tag) {
            return Err(AmqpError::ConsumerTagInUse(def.tag));
        }
        queue.register_consumer(&def.tag, def.prefetch, def.exclusive)?;

        let buffer = match def.prefetch {
            0 => UNBOUNDED_PREFETCH_BUFFER,
            n => n as usize,
        };
        let (tx, rx) = mpsc::channel(buffer);
        let (cancel_tx, cancel_rx) = watch::channel(CancelMode::Running);
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        let revoked = Arc::new(AtomicBool::new(false));

        registry.insert(
            def.tag.clone(),
            ConsumerEntry {
                queue: queue.clone(),
                cancel: cancel_tx,
                state: state_rx,
            },
        );
        drop(registry);

        debug!(queue = queue.name(), consumer = def.tag.as_str(), "consumer subscribed");

        let tag = def.tag.clone();
        tokio::spawn(delivery_loop(
            queue,
            def,
            tx,
            cancel_rx,
            state_tx,
            revoked.clone(),
            Arc::downgrade(&self.consumers),
        ));

        Ok(DeliveryStream::revocable(tag, rx, revoked))
    }

    /// Subscribes a consumer whose deliveries are processed by `handler`.
    ///
    /// Manual-ack deliveries are processed concurrently, bounded by the prefetch;
    /// auto-ack deliveries are processed one at a time. Returns the consumer tag.
    pub fn subscribe_with_handler(
        &self,
        queue: Arc<Queue>,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, AmqpError> {
        let auto_ack = def.auto_ack;
        let mut stream = self.subscribe(queue, def)?;
        let tag = stream.consumer_tag().to_owned();

        tokio::spawn(async move {
            let tracer = global::tracer("consumer");
            let mut in_flight = JoinSet::new();

            while let Some(delivery) = stream.next().await {
                if auto_ack {
                    if let Err(err) = consume(&tracer, &delivery, &handler, true).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                    continue;
                }

                let handler = handler.clone();
                in_flight.spawn(async move {
                    let tracer = global::tracer("consumer");
                    if let Err(err) = consume(&tracer, &delivery, &handler, false).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                });

                // reap finished handlers so the set stays small
                while in_flight.try_join_next().is_some() {}
            }

            while in_flight.join_next().await.is_some() {}
            debug!(consumer = stream.consumer_tag(), "handler stopped");
        });

        Ok(tag)
    }

    /// Starts `workers` auto-ack consumers with prefetch 1 sharing `queue`.
    /// Workers share nothing but the queue. Returns their tags.
    pub fn work_pool(
        &self,
        queue: Arc<Queue>,
        tag_prefix: &str,
        workers: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Vec<String>, AmqpError> {
        let mut tags = Vec::with_capacity(workers);
        for i in 0..workers {
            let def = ConsumerDefinition::new(&format!("{}-{}", tag_prefix, i))
                .prefetch(1)
                .auto_ack();
            match self.subscribe_with_handler(queue.clone(), def, handler.clone()) {
                Ok(tag) => tags.push(tag),
                Err(err) => {
                    for tag in &tags {
                        self.request_cancel(tag, CancelMode::Immediate);
                    }
                    return Err(err);
                }
            }
        }
        Ok(tags)
    }

    /// Cancels a consumer.
    ///
    /// With `immediate`, unacked deliveries are requeued at once. Otherwise the call
    /// returns only after every in-flight delivery was acked, nacked or expired.
    pub async fn cancel(&self, consumer_tag: &str, immediate: bool) -> Result<(), AmqpError> {
        let mode = if immediate {
            CancelMode::Immediate
        } else {
            CancelMode::Graceful
        };

        let Some(mut state) = self.request_cancel(consumer_tag, mode) else {
            return Err(AmqpError::UnknownConsumer(consumer_tag.to_owned()));
        };

        // the loop drops its sender only after publishing Cancelled
        let _ = state.wait_for(|s| *s == ConsumerState::Cancelled).await;
        debug!(consumer = consumer_tag, immediate, "consumer cancelled");
        Ok(())
    }

    /// Cancels every consumer, e.g. on connection teardown.
    pub async fn cancel_all(&self, immediate: bool) {
        for tag in self.consumer_tags() {
            if let Err(err) = self.cancel(&tag, immediate).await {
                debug!(error = err.to_string(), consumer = tag.as_str(), "consumer already gone");
            }
        }
    }

    fn request_cancel(
        &self,
        consumer_tag: &str,
        mode: CancelMode,
    ) -> Option<watch::Receiver<ConsumerState>> {
        let registry = self.registry();
        let entry = registry.get(consumer_tag)?;
        entry.cancel.send_if_modified(|current| {
            // an immediate cancel is never downgraded
            if *current == CancelMode::Immediate || *current == mode {
                return false;
            }
            *current = mode;
            true
        });
        Some(entry.state.clone())
    }

    /// Renegotiates a consumer's prefetch. Applies to deliveries made from now on.
    pub fn set_prefetch(&self, consumer_tag: &str, prefetch: u16) -> Result<(), AmqpError> {
        let registry = self.registry();
        let entry = registry
            .get(consumer_tag)
            .ok_or_else(|| AmqpError::UnknownConsumer(consumer_tag.to_owned()))?;
        entry.queue.set_prefetch(consumer_tag, prefetch)
    }

    pub fn consumer_state(&self, consumer_tag: &str) -> Option<ConsumerState> {
        self.registry()
            .get(consumer_tag)
            .map(|entry| *entry.state.borrow())
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.registry().contains_key(consumer_tag)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("consumers", &self.consumer_tags())
            .finish()
    }
}

/// Resolves to the requested cancel mode. A dropped sender counts as immediate.
async fn cancelled(rx: &mut watch::Receiver<CancelMode>) -> CancelMode {
    match rx.wait_for(|mode| *mode != CancelMode::Running).await {
        Ok(mode) => *mode,
        Err(_) => CancelMode::Immediate,
    }
}

fn arm_expiry(queue: Arc<Queue>, id: DeliveryId, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if queue.expire(id) {
            warn!(
                queue = queue.name(),
                delivery_id = id.0,
                "delivery was not acknowledged in time, requeued"
            );
        }
    });
}

fn publish_state(queue: &Queue, tag: &str, state_tx: &watch::Sender<ConsumerState>) {
    let next = if queue.outstanding(tag) > 0 {
        ConsumerState::Delivering
    } else {
        ConsumerState::Idle
    };
    state_tx.send_if_modified(|current| {
        if *current == next || *current == ConsumerState::Cancelling {
            return false;
        }
        *current = next;
        true
    });
}

async fn delivery_loop(
    queue: Arc<Queue>,
    def: ConsumerDefinition,
    tx: mpsc::Sender<Delivery>,
    mut cancel_rx: watch::Receiver<CancelMode>,
    state_tx: watch::Sender<ConsumerState>,
    revoked: Arc<AtomicBool>,
    registry: Weak<Mutex<HashMap<String, ConsumerEntry>>>,
) {
    let tag = def.tag.as_str();

    let mode = 'deliver: loop {
        let mode = *cancel_rx.borrow_and_update();
        if mode != CancelMode::Running {
            break mode;
        }
        publish_state(&queue, tag, &state_tx);

        // never take a message that cannot be handed over
        let permit = tokio::select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(consumer = tag, "delivery stream dropped");
                    break CancelMode::Immediate;
                }
            },
            mode = cancelled(&mut cancel_rx) => break mode,
        };

        // the permit is held while parked, so a consumer the queue sees as idle
        // is always able to take
        let delivery = loop {
            let notified = queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match queue.take(tag) {
                Ok(Some(delivery)) => break delivery,
                Ok(None) => {
                    publish_state(&queue, tag, &state_tx);
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tx.closed() => break 'deliver CancelMode::Immediate,
                        mode = cancelled(&mut cancel_rx) => break 'deliver mode,
                    }
                }
                Err(err) => {
                    debug!(error = err.to_string(), consumer = tag, "queue is gone");
                    break 'deliver CancelMode::Immediate;
                }
            }
        };

        let id = delivery.delivery_id;
        if def.auto_ack {
            if let Err(err) = queue.ack_delivery(id) {
                error!(error = err.to_string(), "error whiling auto ack msg");
            }
        } else if let Some(timeout) = def.delivery_timeout {
            arm_expiry(queue.clone(), id, timeout);
        }
        permit.send(delivery);
    };

    state_tx.send_replace(ConsumerState::Cancelling);
    queue.unregister_consumer(tag);

    match mode {
        CancelMode::Graceful => drain(&queue, tag).await,
        _ => {
            // buffered deliveries must not reach the consumer once requeued
            revoked.store(true, Ordering::Release);
            let requeued = queue.requeue_consumer(tag);
            if !requeued.is_empty() {
                debug!(consumer = tag, count = requeued.len(), "requeued in-flight deliveries");
            }
        }
    }

    if let Some(registry) = registry.upgrade() {
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag);
    }
    drop(tx);
    state_tx.send_replace(ConsumerState::Cancelled);
}

/// Waits until every delivery held by `tag` is resolved.
async fn drain(queue: &Queue, tag: &str) {
    loop {
        let notified = queue.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if queue.outstanding(tag) == 0 {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{HandlerError, MockConsumerHandler},
        message::{Message, Publishing},
        queue::QueueDefinition,
        store::NoopStore,
    };
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn queue(name: &str) -> Arc<Queue> {
        Queue::new(
            QueueDefinition::new(name),
            Arc::new(AtomicU64::new(0)),
            Arc::new(NoopStore),
        )
    }

    fn publish(q: &Queue, body: &str) {
        q.enqueue(Arc::new(Message::from_publishing(
            "",
            q.name(),
            Publishing::new(body),
        )))
        .unwrap();
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        timeout(WAIT, stream.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager"))
            .unwrap();

        publish(&q, "a");
        publish(&q, "b");

        let a = next(&mut stream).await;
        let b = next(&mut stream).await;
        assert_eq!(a.body(), b"a");
        assert_eq!(b.body(), b"b");

        a.ack().await.unwrap();
        b.ack().await.unwrap();
        assert_eq!(q.unacked_count(), 0);
    }

    #[tokio::test]
    async fn generated_tags_and_duplicates() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new(""))
            .unwrap();
        assert!(stream.consumer_tag().starts_with(GENERATED_TAG_PREFIX));

        let _pager = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager"))
            .unwrap();
        assert_eq!(
            dispatcher
                .subscribe(q.clone(), ConsumerDefinition::new("pager"))
                .unwrap_err(),
            AmqpError::ConsumerTagInUse("pager".to_owned())
        );
    }

    #[tokio::test]
    async fn prefetch_is_never_exceeded() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager").prefetch(2))
            .unwrap();

        for body in ["a", "b", "c", "d"] {
            publish(&q, body);
        }

        let a = next(&mut stream).await;
        let _b = next(&mut stream).await;
        assert!(timeout(Duration::from_millis(100), stream.recv())
            .await
            .is_err());
        assert_eq!(q.outstanding("pager"), 2);

        a.ack().await.unwrap();
        let c = next(&mut stream).await;
        assert_eq!(c.body(), b"c");
        assert_eq!(q.outstanding("pager"), 2);
    }

    #[tokio::test]
    async fn auto_ack_resolves_on_hand_off() {
        let q = queue("firehose");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("fh").auto_ack())
            .unwrap();

        publish(&q, "a");
        let a = next(&mut stream).await;
        assert_eq!(q.unacked_count(), 0);
        assert_eq!(
            a.ack().await,
            Err(AmqpError::UnknownDeliveryError(a.delivery_id.0))
        );
    }

    #[tokio::test]
    async fn nack_requeue_is_redelivered_first() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager").prefetch(1))
            .unwrap();

        publish(&q, "first");
        publish(&q, "second");

        let first = next(&mut stream).await;
        first.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.body(), b"first");
        assert!(again.redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_expires_and_is_requeued() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(
                q.clone(),
                ConsumerDefinition::new("pager")
                    .prefetch(1)
                    .delivery_timeout(Duration::from_secs(30)),
            )
            .unwrap();

        publish(&q, "slow");
        let first = next(&mut stream).await;

        let again = timeout(Duration::from_secs(60), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.body(), b"slow");
        assert!(again.redelivered);
        assert_eq!(
            first.ack().await,
            Err(AmqpError::UnknownDeliveryError(first.delivery_id.0))
        );
    }

    #[tokio::test]
    async fn graceful_cancel_waits_for_in_flight_delivery() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager"))
            .unwrap();

        publish(&q, "a");
        let a = next(&mut stream).await;

        let cancel = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.cancel("pager", false).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cancel.is_finished());
        assert!(dispatcher.contains("pager"));
        assert_eq!(
            dispatcher.consumer_state("pager"),
            Some(ConsumerState::Cancelling)
        );

        a.ack().await.unwrap();
        timeout(WAIT, cancel).await.unwrap().unwrap().unwrap();
        assert!(!dispatcher.contains("pager"));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn immediate_cancel_requeues_in_flight_deliveries() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager"))
            .unwrap();

        publish(&q, "a");
        let a = next(&mut stream).await;

        timeout(WAIT, dispatcher.cancel("pager", true))
            .await
            .unwrap()
            .unwrap();
        assert!(!dispatcher.contains("pager"));
        assert_eq!(q.message_count(), 1);
        assert_eq!(
            a.ack().await,
            Err(AmqpError::UnknownDeliveryError(a.delivery_id.0))
        );
        assert_eq!(
            dispatcher.cancel("pager", true).await,
            Err(AmqpError::UnknownConsumer("pager".to_owned()))
        );
    }

    #[tokio::test]
    async fn immediate_cancel_revokes_buffered_deliveries() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager").prefetch(3))
            .unwrap();

        for body in ["a", "b", "c"] {
            publish(&q, body);
        }
        timeout(WAIT, async {
            while q.outstanding("pager") < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        timeout(WAIT, dispatcher.cancel("pager", true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(q.message_count(), 3);
        assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());

        let mut next_stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager2"))
            .unwrap();
        for body in ["a", "b", "c"] {
            let delivery = next(&mut next_stream).await;
            assert_eq!(delivery.body(), body.as_bytes());
            assert!(delivery.redelivered);
            delivery.ack().await.unwrap();
        }
        assert_eq!(q.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_cancel_completes_when_delivery_expires() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(
                q.clone(),
                ConsumerDefinition::new("pager").delivery_timeout(Duration::from_secs(30)),
            )
            .unwrap();

        publish(&q, "slow");
        let _never_acked = next(&mut stream).await;
        let started = tokio::time::Instant::now();

        let cancel = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.cancel("pager", false).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!cancel.is_finished());
        assert!(dispatcher.contains("pager"));
        assert_eq!(q.message_count(), 0);

        timeout(Duration::from_secs(60), cancel)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(!dispatcher.contains("pager"));
        assert_eq!(q.unacked_count(), 0);
        assert_eq!(q.message_count(), 1);

        q.register_consumer("after", 0, false).unwrap();
        let again = q.take("after").unwrap().unwrap();
        assert!(again.redelivered);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn round_robin_across_consumers() {
        let q = queue("email");
        let dispatcher = Dispatcher::new();
        let mut s1 = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("c1").prefetch(1))
            .unwrap();
        let mut s2 = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("c2").prefetch(1))
            .unwrap();

        publish(&q, "a");
        publish(&q, "b");

        let d1 = next(&mut s1).await;
        let d2 = next(&mut s2).await;
        let mut bodies = vec![d1.body().to_vec(), d2.body().to_vec()];
        bodies.sort();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn handler_subscription_acks_on_success() {
        let q = queue("email");
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let mut handler = MockConsumerHandler::new();
        let counter = seen.clone();
        handler.expect_exec().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher
            .subscribe_with_handler(
                q.clone(),
                ConsumerDefinition::new("mailer").prefetch(3),
                Arc::new(handler),
            )
            .unwrap();

        for body in ["a", "b", "c", "d"] {
            publish(&q, body);
        }

        timeout(WAIT, async {
            while seen.load(Ordering::SeqCst) < 4 || q.unacked_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(q.message_count(), 0);
    }

    #[tokio::test]
    async fn handler_failure_can_reject() {
        let q = queue("email");
        let dispatcher = Dispatcher::new();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::reject("bad payload")));

        dispatcher
            .subscribe_with_handler(q.clone(), ConsumerDefinition::new("mailer"), Arc::new(handler))
            .unwrap();
        publish(&q, "garbage");

        timeout(WAIT, async {
            while q.message_count() > 0 || q.unacked_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn work_pool_spreads_messages() {
        let q = queue("firehose");
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let mut handler = MockConsumerHandler::new();
        let counter = seen.clone();
        handler.expect_exec().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let tags = dispatcher
            .work_pool(q.clone(), "worker", 4, Arc::new(handler))
            .unwrap();
        assert_eq!(tags.len(), 4);

        for i in 0..20 {
            publish(&q, &i.to_string());
        }

        timeout(WAIT, async {
            while seen.load(Ordering::SeqCst) < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.cancel_all(false).await;
        assert!(dispatcher.consumer_tags().is_empty());
    }

    #[tokio::test]
    async fn deleting_the_queue_ends_the_stream() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager"))
            .unwrap();

        q.delete();
        assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
        assert!(!dispatcher.contains("pager"));
    }

    #[tokio::test]
    async fn prefetch_renegotiation_applies_to_later_deliveries() {
        let q = queue("page");
        let dispatcher = Dispatcher::new();
        let mut stream = dispatcher
            .subscribe(q.clone(), ConsumerDefinition::new("pager").prefetch(1))
            .unwrap();

        for body in ["a", "b", "c"] {
            publish(&q, body);
        }
        let _a = next(&mut stream).await;
        assert!(timeout(Duration::from_millis(50), stream.recv())
            .await
            .is_err());

        dispatcher.set_prefetch("pager", 3).unwrap();
        let b = next(&mut stream).await;
        let c = next(&mut stream).await;
        assert_eq!((b.body(), c.body()), (&b"b"[..], &b"c"[..]));
    }
}
