// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! A `Publishing` is what a producer hands to an exchange. Once routed it becomes an
//! immutable `Message`, shared by every queue it reached. A `Delivery` is a message
//! handed to one consumer under a delivery id assigned at dispatch time.

use crate::errors::AmqpError;
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc, time::SystemTime};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type used when publishing raw text
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Identifier of one delivery attempt. Assigned when a message is taken for a
/// consumer, never when it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as submitted by a publisher.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub message_id: Option<Uuid>,
    pub headers: BTreeMap<String, String>,
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Publishing {
        Publishing {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Serializes `payload` as JSON and sets the JSON content type.
    pub fn json<T: Serialize>(payload: &T) -> Result<Publishing, AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|_| AmqpError::ParsePayloadError)?;
        Ok(Publishing::new(body).content_type(JSON_CONTENT_TYPE))
    }

    /// Marks the message persistent so durable queues hand it to the message store.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: Uuid) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// A routed message. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub enqueued_at: SystemTime,
}

impl Message {
    /// Builds the routed form of a publishing, stamping the time and a message id.
    pub fn from_publishing(exchange: &str, routing_key: &str, publishing: Publishing) -> Message {
        Message {
            message_id: publishing.message_id.unwrap_or_else(Uuid::new_v4),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: publishing.body,
            persistent: publishing.persistent,
            content_type: publishing.content_type,
            msg_type: publishing.msg_type,
            headers: publishing.headers,
            enqueued_at: SystemTime::now(),
        }
    }
}

/// Resolves deliveries on whatever owns them: an in-process queue or a remote channel.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, id: DeliveryId) -> Result<(), AmqpError>;

    async fn nack(&self, id: DeliveryId, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumer.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub queue: String,
    pub consumer_tag: String,
    pub redelivered: bool,
    pub message: Arc<Message>,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    /// Acknowledges the delivery. Fails with `UnknownDeliveryError` when the
    /// delivery was already resolved, expired or auto-acked.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_id).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_id, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("redelivered", &self.redelivered)
            .field("message", &self.message)
            .finish()
    }
}
