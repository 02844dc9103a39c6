// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topic Router and Dispatcher
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum covers topology redeclaration conflicts, routing failures,
//! acknowledgment of unknown deliveries, consumer registration problems and
//! failures of the external collaborators (remote broker, message store).

use thiserror::Error;

/// Represents errors that can occur while declaring topology, routing,
/// enqueuing, dispatching or acknowledging messages.
///
/// Only `nack(requeue = true)` and delivery-timeout expiry retry automatically;
/// every other variant is surfaced synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker. Fatal to that connection only.
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel")]
    ChannelError,

    /// Redeclaration of an exchange or queue with different properties
    #[error("conflicting redeclaration of `{0}`: {1}")]
    ConflictError(String, String),

    /// Ack or nack of a delivery id that is absent or already resolved
    #[error("unknown delivery `{0}`")]
    UnknownDeliveryError(u64),

    /// Mandatory publish that matched no queue
    #[error("message to exchange `{0}` with key `{1}` is unroutable")]
    MandatoryError(String, String),

    /// The exchange does not exist
    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    /// The queue does not exist or was deleted
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),

    /// No consumer is registered under the tag
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),

    /// The consumer tag is already registered
    #[error("consumer tag `{0}` already in use")]
    ConsumerTagInUse(String),

    /// The queue has an exclusive consumer, or exclusivity was requested on a busy queue
    #[error("queue `{0}` is in exclusive use")]
    ExclusiveConsumer(String),

    /// The binding pattern could not be parsed
    #[error("invalid binding pattern `{0}`")]
    InvalidPattern(String),

    /// The exchange kind cannot be routed in process
    #[error("unsupported exchange kind `{0}`")]
    UnsupportedExchangeKind(String),

    /// Operation not permitted on a reserved entity such as the default exchange
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The queue reached its maximum length
    #[error("queue `{0}` is full")]
    QueueFull(String),

    /// The message store failed to persist or remove a message
    #[error("failure to store message: {0}")]
    StorageError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message on a remote broker
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message on a remote broker
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error loading configuration
    #[error("failure to load configs: {0}")]
    ConfigError(String),
}
