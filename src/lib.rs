// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # topicmq
//!
//! An in-process AMQP-style topic router and ack-aware dispatcher. Exchanges route
//! published messages to bound queues by routing-key pattern; queues hand messages to
//! subscribed consumers round-robin under a prefetch window and redeliver whatever is
//! nacked, expired or left unacked by a cancelled consumer.
//!
//! The same `Connection`/`Channel` interface is implemented for the in-process
//! `Broker` and for a remote RabbitMQ over lapin.

mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod pattern;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod store;
pub mod table;
pub mod topology;
