// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module provides the queue definition builders and the runtime `Queue`.
//!
//! A runtime queue is an ordered, bounded buffer of pending messages plus the map of
//! deliveries awaiting acknowledgment. Every operation runs inside one mutex per queue;
//! independent queues never contend. Waiting consumers park on the queue's `Notify`,
//! which is signalled whenever work or prefetch capacity may have appeared.

use crate::{
    errors::AmqpError,
    message::{Acknowledger, Delivery, DeliveryId, Message},
    store::MessageStore,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::{futures::Notified, Notify};
use tracing::{debug, warn};

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) max_length: Option<usize>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, unbounded, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            passive: false,
            max_length: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the queue durable. Persistent messages published to a durable queue are
    /// written to the message store before the publish returns.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the declaration passive: it only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the maximum number of pending messages. Publishing beyond it is rejected.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key pattern for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[derive(Debug)]
struct Pending {
    message: Arc<Message>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    message: Arc<Message>,
    consumer_tag: String,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    prefetch: u16,
    outstanding: usize,
    waiting: bool,
    exclusive: bool,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.outstanding < self.prefetch as usize
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    unacked: HashMap<DeliveryId, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    deleted: bool,
}

impl QueueState {
    fn slot_mut(&mut self, tag: &str) -> Option<&mut ConsumerSlot> {
        self.consumers.iter_mut().find(|slot| slot.tag == tag)
    }

    fn release(&mut self, tag: &str) {
        if let Some(slot) = self.slot_mut(tag) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }
    }

    /// Next consumer in round-robin order that is waiting for work and below its prefetch.
    fn next_eligible(&self) -> Option<usize> {
        let n = self.consumers.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&idx| self.consumers[idx].waiting && self.consumers[idx].has_capacity())
    }
}

/// Runtime queue shared by the router (enqueue) and the dispatcher (take/ack/nack).
pub struct Queue {
    def: QueueDefinition,
    state: Mutex<QueueState>,
    notify: Notify,
    sequence: Arc<AtomicU64>,
    store: Arc<dyn MessageStore>,
}

impl Queue {
    /// Creates a queue. Delivery ids are drawn from `sequence`, which is shared by
    /// every queue of a broker so ids are unique across queues.
    pub fn new(
        def: QueueDefinition,
        sequence: Arc<AtomicU64>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<Queue> {
        Arc::new(Queue {
            def,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            sequence,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.def
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Future resolved at the next signal. Enable it before calling `take` so a
    /// signal raised in between is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Appends a message to the tail of the queue.
    ///
    /// Persistent messages on a durable queue are written to the store first; a store
    /// failure leaves the queue untouched.
    pub fn enqueue(&self, message: Arc<Message>) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            if state.deleted {
                return Err(AmqpError::UnknownQueue(self.def.name.clone()));
            }

            if let Some(max) = self.def.max_length {
                if state.pending.len() >= max {
                    warn!(queue = self.def.name.as_str(), max, "queue is full, rejecting message");
                    return Err(AmqpError::QueueFull(self.def.name.clone()));
                }
            }

            if self.def.durable && message.persistent {
                self.store.persist(&self.def.name, &message)?;
            }

            state.pending.push_back(Pending {
                message,
                redelivered: false,
            });
        }

        self.wake();
        Ok(())
    }

    /// Registers a consumer slot. Tags are unique per queue.
    pub fn register_consumer(
        &self,
        tag: &str,
        prefetch: u16,
        exclusive: bool,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            if state.deleted {
                return Err(AmqpError::UnknownQueue(self.def.name.clone()));
            }
            if state.consumers.iter().any(|slot| slot.tag == tag) {
                return Err(AmqpError::ConsumerTagInUse(tag.to_owned()));
            }
            let held_exclusively = state.consumers.iter().any(|slot| slot.exclusive);
            if held_exclusively || (exclusive && !state.consumers.is_empty()) {
                return Err(AmqpError::ExclusiveConsumer(self.def.name.clone()));
            }

            state.consumers.push(ConsumerSlot {
                tag: tag.to_owned(),
                prefetch,
                outstanding: 0,
                waiting: false,
                exclusive,
            });
        }

        self.wake();
        Ok(())
    }

    /// Removes a consumer slot. Its unacked deliveries stay unacked until they are
    /// resolved or requeued with `requeue_consumer`.
    pub fn unregister_consumer(&self, tag: &str) {
        {
            let mut state = self.state();
            if let Some(idx) = state.consumers.iter().position(|slot| slot.tag == tag) {
                state.consumers.remove(idx);
                if idx < state.cursor {
                    state.cursor -= 1;
                }
                if state.cursor >= state.consumers.len() {
                    state.cursor = 0;
                }
            }
        }

        self.wake();
    }

    /// Changes a consumer's prefetch. Deliveries already made are not revoked.
    pub fn set_prefetch(&self, tag: &str, prefetch: u16) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            let slot = state
                .slot_mut(tag)
                .ok_or_else(|| AmqpError::UnknownConsumer(tag.to_owned()))?;
            slot.prefetch = prefetch;
        }

        self.wake();
        Ok(())
    }

    /// Pops the head of the queue for `consumer_tag` without blocking.
    ///
    /// Returns `None` when the queue is empty, when the consumer reached its prefetch,
    /// or when another idle consumer is next in round-robin order. Fails when the
    /// queue was deleted or the consumer is not registered.
    pub fn take(self: &Arc<Self>, consumer_tag: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.state();
        if state.deleted {
            return Err(AmqpError::UnknownQueue(self.def.name.clone()));
        }

        let Some(idx) = state.consumers.iter().position(|s| s.tag == consumer_tag) else {
            return Err(AmqpError::UnknownConsumer(consumer_tag.to_owned()));
        };
        state.consumers[idx].waiting = true;

        if state.pending.is_empty() {
            return Ok(None);
        }

        match state.next_eligible() {
            Some(next) if next == idx => {}
            // another idle consumer is up; it was woken by the same signal
            Some(_) | None => return Ok(None),
        }

        let Some(Pending {
            message,
            redelivered,
        }) = state.pending.pop_front()
        else {
            return Ok(None);
        };

        let delivery_id = DeliveryId(self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        state.unacked.insert(
            delivery_id,
            Unacked {
                message: message.clone(),
                consumer_tag: consumer_tag.to_owned(),
            },
        );

        let slot = &mut state.consumers[idx];
        slot.outstanding += 1;
        slot.waiting = false;
        state.cursor = (idx + 1) % state.consumers.len();

        let more = !state.pending.is_empty();
        drop(state);
        if more {
            self.wake();
        }

        Ok(Some(Delivery {
            delivery_id,
            queue: self.def.name.clone(),
            consumer_tag: consumer_tag.to_owned(),
            redelivered,
            message,
            acker: self.clone(),
        }))
    }

    /// Resolves a delivery positively and forgets the message.
    pub fn ack_delivery(&self, id: DeliveryId) -> Result<(), AmqpError> {
        let unacked = {
            let mut state = self.state();
            let unacked = state
                .unacked
                .remove(&id)
                .ok_or(AmqpError::UnknownDeliveryError(id.0))?;
            state.release(&unacked.consumer_tag);
            unacked
        };

        self.wake();
        self.forget(&unacked.message)
    }

    /// Resolves a delivery negatively. With `requeue` the message goes back to the
    /// head of the queue, flagged as redelivered; otherwise it is discarded.
    pub fn nack_delivery(&self, id: DeliveryId, requeue: bool) -> Result<(), AmqpError> {
        let unacked = {
            let mut state = self.state();
            let unacked = state
                .unacked
                .remove(&id)
                .ok_or(AmqpError::UnknownDeliveryError(id.0))?;
            state.release(&unacked.consumer_tag);

            if requeue {
                state.pending.push_front(Pending {
                    message: unacked.message.clone(),
                    redelivered: true,
                });
            }
            unacked
        };

        self.wake();
        if requeue {
            Ok(())
        } else {
            self.forget(&unacked.message)
        }
    }

    /// Requeues a delivery whose acknowledgment timed out. Returns false when the
    /// delivery was resolved in the meantime.
    pub fn expire(&self, id: DeliveryId) -> bool {
        match self.nack_delivery(id, true) {
            Ok(()) => {
                debug!(queue = self.def.name.as_str(), delivery_id = id.0, "delivery expired");
                true
            }
            Err(_) => false,
        }
    }

    /// Requeues every unacked delivery of a consumer, oldest first at the head.
    pub fn requeue_consumer(&self, tag: &str) -> Vec<DeliveryId> {
        let ids = {
            let mut state = self.state();
            let mut ids: Vec<DeliveryId> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.consumer_tag == tag)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();

            for id in ids.iter().rev() {
                if let Some(unacked) = state.unacked.remove(id) {
                    state.pending.push_front(Pending {
                        message: unacked.message,
                        redelivered: true,
                    });
                }
            }
            if let Some(slot) = state.slot_mut(tag) {
                slot.outstanding = 0;
            }
            ids
        };

        self.wake();
        ids
    }

    /// Number of unacked deliveries held by a consumer.
    pub fn outstanding(&self, tag: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|u| u.consumer_tag == tag)
            .count()
    }

    pub fn owns(&self, id: DeliveryId) -> bool {
        self.state().unacked.contains_key(&id)
    }

    /// Number of messages ready for delivery.
    pub fn message_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.state().deleted
    }

    /// Drops every pending message. Unacked deliveries are kept.
    pub fn purge(&self) -> Result<usize, AmqpError> {
        let dropped: Vec<Pending> = self.state().pending.drain(..).collect();
        for pending in &dropped {
            self.forget(&pending.message)?;
        }
        Ok(dropped.len())
    }

    /// Marks the queue deleted, dropping pending and unacked messages alike.
    /// Every parked consumer loop is woken so it can observe the deletion.
    pub(crate) fn delete(&self) -> usize {
        let (pending, unacked) = {
            let mut state = self.state();
            state.deleted = true;
            state.consumers.clear();
            state.cursor = 0;
            let pending: Vec<Pending> = state.pending.drain(..).collect();
            let unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
            (pending, unacked)
        };

        self.wake();

        let messages = pending
            .iter()
            .map(|p| &p.message)
            .chain(unacked.iter().map(|u| &u.message));
        let mut dropped = 0;
        for message in messages {
            if let Err(err) = self.forget(message) {
                warn!(error = err.to_string(), queue = self.def.name.as_str(), "failure to drop stored message");
            }
            dropped += 1;
        }
        dropped
    }

    fn forget(&self, message: &Message) -> Result<(), AmqpError> {
        if self.def.durable && message.persistent {
            self.store.remove(&self.def.name, &message.message_id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("def", &self.def).finish()
    }
}

#[async_trait]
impl Acknowledger for Queue {
    async fn ack(&self, id: DeliveryId) -> Result<(), AmqpError> {
        self.ack_delivery(id)
    }

    async fn nack(&self, id: DeliveryId, requeue: bool) -> Result<(), AmqpError> {
        self.nack_delivery(id, requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Publishing,
        store::{MockMessageStore, NoopStore},
    };

    fn queue(def: QueueDefinition) -> Arc<Queue> {
        Queue::new(def, Arc::new(AtomicU64::new(0)), Arc::new(NoopStore))
    }

    fn msg(body: &str) -> Arc<Message> {
        Arc::new(Message::from_publishing("", "testing", Publishing::new(body)))
    }

    #[test]
    fn take_is_fifo_and_moves_to_unacked() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(msg("a")).unwrap();
        q.enqueue(msg("b")).unwrap();

        let first = q.take("c1").unwrap().unwrap();
        assert_eq!(first.body(), b"a");
        assert_eq!(q.message_count(), 1);
        assert_eq!(q.unacked_count(), 1);

        let second = q.take("c1").unwrap().unwrap();
        assert_eq!(second.body(), b"b");
        assert_ne!(first.delivery_id, second.delivery_id);
    }

    #[test]
    fn take_respects_prefetch() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 2, false).unwrap();
        for body in ["a", "b", "c"] {
            q.enqueue(msg(body)).unwrap();
        }

        let a = q.take("c1").unwrap().unwrap();
        let _b = q.take("c1").unwrap().unwrap();
        assert!(q.take("c1").unwrap().is_none());
        assert_eq!(q.outstanding("c1"), 2);

        q.ack_delivery(a.delivery_id).unwrap();
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"c");
    }

    #[test]
    fn double_ack_is_unknown() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(msg("a")).unwrap();

        let d = q.take("c1").unwrap().unwrap();
        q.ack_delivery(d.delivery_id).unwrap();
        assert_eq!(
            q.ack_delivery(d.delivery_id),
            Err(AmqpError::UnknownDeliveryError(d.delivery_id.0))
        );
    }

    #[test]
    fn ack_after_discarding_nack_is_unknown() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(msg("a")).unwrap();

        let d = q.take("c1").unwrap().unwrap();
        q.nack_delivery(d.delivery_id, false).unwrap();
        assert_eq!(q.message_count(), 0);
        assert_eq!(
            q.ack_delivery(d.delivery_id),
            Err(AmqpError::UnknownDeliveryError(d.delivery_id.0))
        );
    }

    #[test]
    fn requeue_goes_to_the_head() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(msg("first")).unwrap();

        let d = q.take("c1").unwrap().unwrap();
        q.enqueue(msg("newer")).unwrap();
        q.nack_delivery(d.delivery_id, true).unwrap();

        let again = q.take("c1").unwrap().unwrap();
        assert_eq!(again.body(), b"first");
        assert!(again.redelivered);
        assert_ne!(again.delivery_id, d.delivery_id);
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"newer");
    }

    #[test]
    fn round_robin_between_idle_consumers() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.register_consumer("c2", 0, false).unwrap();

        // both consumers park on the empty queue
        assert!(q.take("c1").unwrap().is_none());
        assert!(q.take("c2").unwrap().is_none());
        for body in ["a", "b", "c"] {
            q.enqueue(msg(body)).unwrap();
        }

        // c1 is first in turn, so c2 is refused
        assert!(q.take("c2").unwrap().is_none());
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"a");
        assert_eq!(q.take("c2").unwrap().unwrap().body(), b"b");
        // c1 is busy, so c2 is the only idle consumer left
        assert_eq!(q.take("c2").unwrap().unwrap().body(), b"c");
    }

    #[test]
    fn round_robin_skips_consumers_without_capacity() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 1, false).unwrap();
        q.register_consumer("c2", 1, false).unwrap();
        for body in ["a", "b", "c"] {
            q.enqueue(msg(body)).unwrap();
        }

        let a = q.take("c1").unwrap().unwrap();
        let b = q.take("c2").unwrap().unwrap();
        assert!(q.take("c1").unwrap().is_none());
        assert!(q.take("c2").unwrap().is_none());

        q.ack_delivery(a.delivery_id).unwrap();
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"c");
        q.ack_delivery(b.delivery_id).unwrap();
    }

    #[test]
    fn max_length_rejects_publishes() {
        let q = queue(QueueDefinition::new("bounded").max_length(1));
        q.enqueue(msg("a")).unwrap();
        assert_eq!(
            q.enqueue(msg("b")),
            Err(AmqpError::QueueFull("bounded".to_owned()))
        );
    }

    #[test]
    fn requeue_consumer_keeps_original_order() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        for body in ["a", "b", "c"] {
            q.enqueue(msg(body)).unwrap();
        }
        q.take("c1").unwrap().unwrap();
        q.take("c1").unwrap().unwrap();

        assert_eq!(q.requeue_consumer("c1").len(), 2);
        assert_eq!(q.outstanding("c1"), 0);
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"a");
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"b");
        assert_eq!(q.take("c1").unwrap().unwrap().body(), b"c");
    }

    #[test]
    fn exclusive_consumer_blocks_others() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("only", 0, true).unwrap();
        assert_eq!(
            q.register_consumer("other", 0, false),
            Err(AmqpError::ExclusiveConsumer("testing".to_owned()))
        );
        assert_eq!(
            q.register_consumer("only", 0, false),
            Err(AmqpError::ConsumerTagInUse("only".to_owned()))
        );
    }

    #[test]
    fn delete_drops_everything() {
        let q = queue(QueueDefinition::new("testing"));
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(msg("a")).unwrap();
        q.enqueue(msg("b")).unwrap();
        let d = q.take("c1").unwrap().unwrap();

        assert_eq!(q.delete(), 2);
        assert!(q.is_deleted());
        assert_eq!(
            q.ack_delivery(d.delivery_id),
            Err(AmqpError::UnknownDeliveryError(d.delivery_id.0))
        );
        assert_eq!(
            q.take("c1").unwrap_err(),
            AmqpError::UnknownQueue("testing".to_owned())
        );
    }

    #[test]
    fn durable_queue_persists_before_enqueue() {
        let mut store = MockMessageStore::new();
        store
            .expect_persist()
            .withf(|queue, msg| queue == "durable" && msg.body == b"keep")
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_remove()
            .withf(|queue, _| queue == "durable")
            .times(1)
            .returning(|_, _| Ok(()));

        let q = Queue::new(
            QueueDefinition::new("durable").durable(),
            Arc::new(AtomicU64::new(0)),
            Arc::new(store),
        );
        q.register_consumer("c1", 0, false).unwrap();
        q.enqueue(Arc::new(Message::from_publishing(
            "",
            "durable",
            Publishing::new("keep").persistent(),
        )))
        .unwrap();

        let d = q.take("c1").unwrap().unwrap();
        q.ack_delivery(d.delivery_id).unwrap();
    }

    #[test]
    fn store_failure_leaves_queue_untouched() {
        let mut store = MockMessageStore::new();
        store
            .expect_persist()
            .returning(|_, _| Err(AmqpError::StorageError("disk full".to_owned())));

        let q = Queue::new(
            QueueDefinition::new("durable").durable(),
            Arc::new(AtomicU64::new(0)),
            Arc::new(store),
        );
        let result = q.enqueue(Arc::new(Message::from_publishing(
            "",
            "durable",
            Publishing::new("keep").persistent(),
        )));

        assert_eq!(result, Err(AmqpError::StorageError("disk full".to_owned())));
        assert_eq!(q.message_count(), 0);
    }
}
