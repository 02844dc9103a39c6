// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides a builder for declaring a set of exchanges, queues and
//! bindings in one go. The topology is installed through a `Channel`, so the same
//! definition works against the in-process broker and a remote RabbitMQ.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `ChannelTopology`: Implementation installing through a `Channel`

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed through a `Channel`.
pub struct ChannelTopology<'tp> {
    channel: Arc<dyn Channel>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
}

impl<'tp> ChannelTopology<'tp> {
    pub fn new(channel: Arc<dyn Channel>) -> ChannelTopology<'tp> {
        ChannelTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for ChannelTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl ChannelTopology<'_> {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            if let Err(err) = self.channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                return Err(err);
            }
            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            match self.channel.declare_queue(def).await {
                Err(err) => {
                    error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                    return Err(err);
                }
                Ok(info) => debug!(
                    "queue: {} was created with {} messages",
                    info.name, info.message_count
                ),
            }
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = self.channel.bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queues were bound");
        Ok(())
    }
}
