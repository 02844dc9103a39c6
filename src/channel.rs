// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connections and Channels
//!
//! This module defines the client-facing `Connection` and `Channel` interfaces and
//! their in-process implementation on top of a `Broker`. The lapin-backed
//! implementation for a remote RabbitMQ lives in the `amqp` module.
//!
//! A connection opens channels; a channel declares topology, publishes, consumes and
//! resolves deliveries. Closing a connection closes its channels and cancels their
//! consumers immediately, requeueing whatever they still held.

use crate::{
    broker::{Broker, QueueInfo},
    consumer::DeliveryStream,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryId, Publishing},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tracing::{debug, warn};

/// A connection to a broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A session on a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its current status.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Sets the prefetch of consumers of this channel. Applies to subsequent deliveries.
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
        mandatory: bool,
    ) -> Result<(), AmqpError>;

    /// Subscribes to a queue. An empty tag lets the broker generate one.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_id: DeliveryId) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_id: DeliveryId, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str, immediate: bool) -> Result<(), AmqpError>;
}

/// In-process connection to a `Broker`.
pub struct LocalConnection {
    broker: Arc<Broker>,
    channels: Mutex<Vec<Arc<LocalChannel>>>,
    closed: AtomicBool,
}

impl LocalConnection {
    pub(crate) fn new(broker: Arc<Broker>) -> LocalConnection {
        LocalConnection {
            broker,
            channels: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn channels(&self) -> MutexGuard<'_, Vec<Arc<LocalChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelError);
        }

        let channel = Arc::new(LocalChannel::new(self.broker.clone()));
        self.channels().push(channel.clone());
        debug!("channel created");
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channels = std::mem::take(&mut *self.channels());
        for channel in channels {
            channel.close().await;
        }
        debug!("connection closed");
        Ok(())
    }
}

/// In-process channel. Tracks the consumers it opened and their qos.
pub struct LocalChannel {
    broker: Arc<Broker>,
    prefetch: AtomicU16,
    consumers: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl LocalChannel {
    fn new(broker: Arc<Broker>) -> LocalChannel {
        let prefetch = broker.configs().default_prefetch;
        LocalChannel {
            broker,
            prefetch: AtomicU16::new(prefetch),
            consumers: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn consumers(&self) -> MutexGuard<'_, Vec<String>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }

    /// Tags of the consumers still owned by this channel.
    pub fn consumer_tags(&self) -> Vec<String> {
        self.consumers().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let tags = std::mem::take(&mut *self.consumers());
        for tag in tags {
            match self.broker.cancel(&tag, true).await {
                Ok(()) | Err(AmqpError::UnknownConsumer(_)) => {}
                Err(err) => warn!(error = err.to_string(), tag, "failure to cancel consumer"),
            }
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.declare_exchange(def)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        self.ensure_open()?;
        self.broker.declare_queue(def)
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.bind(binding)
    }

    async fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.unbind(binding)
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::Release);

        let dispatcher = self.broker.dispatcher();
        self.consumers().retain(|tag| {
            match dispatcher.set_prefetch(tag, prefetch_count) {
                Ok(()) => true,
                // already cancelled, or its queue went away
                Err(_) => false,
            }
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
        mandatory: bool,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker
            .publish(exchange, routing_key, publishing, mandatory)
            .map(|_| ())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let def = self
            .broker
            .consumer_definition(consumer_tag, auto_ack)
            .prefetch(self.prefetch.load(Ordering::Acquire));

        let stream = self.broker.consume(queue, def)?;
        self.consumers().push(stream.consumer_tag().to_owned());
        Ok(stream)
    }

    async fn ack(&self, delivery_id: DeliveryId) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.ack(delivery_id)
    }

    async fn nack(&self, delivery_id: DeliveryId, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.nack(delivery_id, requeue)
    }

    async fn cancel(&self, consumer_tag: &str, immediate: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.consumers().retain(|tag| tag != consumer_tag);
        self.broker.cancel(consumer_tag, immediate).await
    }
}
