// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! This module provides the consumer-facing side of the dispatcher: the consumer
//! definition builder, the stream of deliveries handed to a subscribed consumer, the
//! `ConsumerHandler` trait for callback-style consumers, and the processing of a
//! single delivery through a handler, including acknowledgment and tracing.

use crate::{errors::AmqpError, message::Delivery, otel};
use async_trait::async_trait;
use futures_util::Stream;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    future::poll_fn,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{self, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Prefix of server-generated consumer tags
pub const GENERATED_TAG_PREFIX: &str = "amq.ctag-";

/// Definition of a consumer subscription.
///
/// A prefetch of 0 means the number of unacked deliveries is not limited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) tag: String,
    pub(crate) prefetch: u16,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) delivery_timeout: Option<Duration>,
}

impl ConsumerDefinition {
    /// Creates a manual-ack consumer definition. An empty tag lets the dispatcher
    /// generate one.
    pub fn new(tag: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            tag: tag.to_owned(),
            ..Default::default()
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Maximum number of unacked deliveries held at once.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Deliveries are acknowledged as soon as they are handed to the consumer.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Refuses other consumers on the queue while this one is subscribed.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Requeues deliveries that are not acknowledged within `timeout`.
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = Some(timeout);
        self
    }
}

/// Lifecycle of a (queue, consumer) pair as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for work, nothing unacked.
    Idle,
    /// At least one delivery awaits acknowledgment.
    Delivering,
    /// Cancel requested, in-flight deliveries are draining.
    Cancelling,
    /// Removed from the dispatcher.
    Cancelled,
}

/// Failure reported by a handler. `requeue` decides whether the message is put back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
    pub requeue: bool,
}

impl HandlerError {
    /// Failure after which the message is retried.
    pub fn retry(reason: &str) -> HandlerError {
        HandlerError {
            reason: reason.to_owned(),
            requeue: true,
        }
    }

    /// Failure after which the message is discarded.
    pub fn reject(reason: &str) -> HandlerError {
        HandlerError {
            reason: reason.to_owned(),
            requeue: false,
        }
    }
}

/// Callback invoked for every delivery of a handler-driven subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Deliveries of one consumer. Ends once the consumer is cancelled or its queue is
/// deleted; a cancelled consumer can only be restarted by subscribing again.
///
/// When the consumer is cancelled immediately its unacked deliveries go back to the
/// queue, so whatever the stream still buffers is revoked and never yielded.
#[derive(Debug)]
pub struct DeliveryStream {
    consumer_tag: String,
    rx: mpsc::Receiver<Delivery>,
    revoked: Arc<AtomicBool>,
}

impl DeliveryStream {
    pub(crate) fn new(consumer_tag: String, rx: mpsc::Receiver<Delivery>) -> DeliveryStream {
        DeliveryStream::revocable(consumer_tag, rx, Arc::default())
    }

    pub(crate) fn revocable(
        consumer_tag: String,
        rx: mpsc::Receiver<Delivery>,
        revoked: Arc<AtomicBool>,
    ) -> DeliveryStream {
        DeliveryStream {
            consumer_tag,
            rx,
            revoked,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        poll_fn(|cx| self.poll_delivery(cx)).await
    }

    fn poll_delivery(&mut self, cx: &mut task::Context<'_>) -> Poll<Option<Delivery>> {
        if self.revoked.load(Ordering::Acquire) {
            self.discard();
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            // revoked while this delivery was being received
            Poll::Ready(Some(_)) if self.revoked.load(Ordering::Acquire) => {
                self.discard();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn discard(&mut self) {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(consumer = self.consumer_tag.as_str(), dropped, "discarded revoked deliveries");
        }
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Delivery>> {
        self.poll_delivery(cx)
    }
}

/// Runs a handler over one delivery and resolves it.
///
/// This function:
/// 1. Extracts the trace context from the message headers and opens a consumer span
/// 2. Executes the handler
/// 3. Acks on success, or nacks with the handler's requeue decision on failure
///
/// With `auto_ack` the delivery was already acknowledged at hand-off, so the
/// handler's outcome is only recorded.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: &Arc<dyn ConsumerHandler>,
    auto_ack: bool,
) -> Result<(), AmqpError> {
    let name = delivery.message.msg_type.as_deref().unwrap_or(&delivery.queue);
    let (ctx, mut span) = otel::new_span(&delivery.message, tracer, name);

    debug!(
        "received: {} - queue: {} - consumer: {}",
        delivery.delivery_id, delivery.queue, delivery.consumer_tag,
    );

    let result = handler.exec(&ctx, delivery).await;

    if auto_ack {
        match result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                warn!(error = err.to_string(), "handler failure on auto-acked message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.reason),
                });
            }
        }
        return Ok(());
    }

    match result {
        Ok(()) => {
            debug!("message successfully processed");
            match delivery.ack().await {
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }
        Err(handler_err) => {
            warn!(
                error = handler_err.to_string(),
                requeue = handler_err.requeue,
                "error whiling handling msg"
            );
            span.record_error(&handler_err);
            span.set_status(Status::Error {
                description: Cow::from(handler_err.reason.clone()),
            });

            if let Err(err) = delivery.nack(handler_err.requeue).await {
                error!(error = err.to_string(), "error whiling nack msg");
                return Err(err);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Message, Publishing},
        queue::{Queue, QueueDefinition},
        store::NoopStore,
    };
    use opentelemetry::global;
    use std::sync::atomic::AtomicU64;

    fn queue_with(bodies: &[&str]) -> Arc<Queue> {
        let q = Queue::new(
            QueueDefinition::new("work"),
            Arc::new(AtomicU64::new(0)),
            Arc::new(NoopStore),
        );
        q.register_consumer("c1", 0, false).unwrap();
        for body in bodies {
            q.enqueue(Arc::new(Message::from_publishing(
                "",
                "work",
                Publishing::new(*body),
            )))
            .unwrap();
        }
        q
    }

    #[test]
    fn definition_builder() {
        let def = ConsumerDefinition::new("pager")
            .prefetch(3)
            .delivery_timeout(Duration::from_secs(5));
        assert_eq!(def.tag(), "pager");
        assert_eq!(def.prefetch, 3);
        assert!(!def.auto_ack);
        assert_eq!(def.delivery_timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let q = queue_with(&["a"]);
        let delivery = q.take("c1").unwrap().unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, d| d.body() == b"a")
            .times(1)
            .returning(|_, _| Ok(()));
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);

        consume(&global::tracer("test"), &delivery, &handler, false)
            .await
            .unwrap();
        assert_eq!(q.unacked_count(), 0);
        assert_eq!(q.message_count(), 0);
    }

    #[tokio::test]
    async fn failing_handler_requeues_when_asked() {
        let q = queue_with(&["a"]);
        let delivery = q.take("c1").unwrap().unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::retry("downstream unavailable")));
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);

        consume(&global::tracer("test"), &delivery, &handler, false)
            .await
            .unwrap();
        assert_eq!(q.message_count(), 1);
        assert!(q.take("c1").unwrap().unwrap().redelivered);
    }

    #[tokio::test]
    async fn rejecting_handler_discards() {
        let q = queue_with(&["a"]);
        let delivery = q.take("c1").unwrap().unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::reject("malformed")));
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);

        consume(&global::tracer("test"), &delivery, &handler, false)
            .await
            .unwrap();
        assert_eq!(q.message_count(), 0);
        assert_eq!(q.unacked_count(), 0);
    }

    #[tokio::test]
    async fn ack_of_expired_delivery_surfaces_error() {
        let q = queue_with(&["a"]);
        let delivery = q.take("c1").unwrap().unwrap();
        assert!(q.expire(delivery.delivery_id));

        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, _| Ok(()));
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);

        let result = consume(&global::tracer("test"), &delivery, &handler, false).await;
        assert_eq!(
            result,
            Err(AmqpError::UnknownDeliveryError(delivery.delivery_id.0))
        );
    }
}
