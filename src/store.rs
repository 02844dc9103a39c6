// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Store
//!
//! Durable queues hand persistent messages to a `MessageStore` before an enqueue
//! returns, and remove them once they are acked or dropped. The store is an external
//! collaborator: this crate ships a no-op store and an in-memory one.

use crate::{errors::AmqpError, message::Message};
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};
use uuid::Uuid;

/// Synchronous persistence hook called inside the queue's critical section.
#[cfg_attr(test, mockall::automock)]
pub trait MessageStore: Send + Sync {
    fn persist(&self, queue: &str, message: &Message) -> Result<(), AmqpError>;

    fn remove(&self, queue: &str, message_id: &Uuid) -> Result<(), AmqpError>;
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl MessageStore for NoopStore {
    fn persist(&self, _queue: &str, _message: &Message) -> Result<(), AmqpError> {
        Ok(())
    }

    fn remove(&self, _queue: &str, _message_id: &Uuid) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Store keeping persisted messages in memory, keyed by queue and message id.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    messages: Mutex<BTreeMap<(String, Uuid), Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the messages currently persisted for `queue`.
    pub fn stored(&self, queue: &str) -> Vec<Uuid> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(q, _)| q == queue)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for InMemoryStore {
    fn persist(&self, queue: &str, message: &Message) -> Result<(), AmqpError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((queue.to_owned(), message.message_id), message.clone());
        Ok(())
    }

    fn remove(&self, queue: &str, message_id: &Uuid) -> Result<(), AmqpError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(queue.to_owned(), *message_id));
        Ok(())
    }
}
