// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Table
//!
//! Holds the declared exchanges and queues and the bindings between them. The table
//! is only changed by explicit declare, bind, unbind and delete calls; nothing is
//! pruned automatically.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    pattern::BindingPattern,
    queue::{QueueBinding, QueueDefinition},
};
use std::collections::HashMap;
use tracing::debug;

/// Rule associating a routing-key pattern with a destination queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue_name: String,
    pub exchange_name: String,
    pub pattern: BindingPattern,
}

/// Exchange → binding → queue mappings.
#[derive(Debug)]
pub struct TopologyTable {
    delimiter: char,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: HashMap<String, Vec<Binding>>,
}

impl TopologyTable {
    pub fn new(delimiter: char) -> TopologyTable {
        TopologyTable {
            delimiter,
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: HashMap::default(),
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Declares an exchange. Returns true when it was created.
    ///
    /// Redeclaring with identical properties is a no-op; a differing kind, durability
    /// or internal flag fails with `ConflictError`.
    pub fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<bool, AmqpError> {
        if def.name == DEFAULT_EXCHANGE {
            return Err(AmqpError::AccessRefused(
                "the default exchange cannot be declared".to_owned(),
            ));
        }

        if let Some(existing) = self.exchanges.get(&def.name) {
            if def.passive {
                return Ok(false);
            }
            return match existing.conflict_with(def) {
                Some(reason) => Err(AmqpError::ConflictError(def.name.clone(), reason)),
                None => Ok(false),
            };
        }

        if def.passive {
            return Err(AmqpError::UnknownExchange(def.name.clone()));
        }
        if def.kind == ExchangeKind::Headers {
            return Err(AmqpError::UnsupportedExchangeKind(def.kind.to_string()));
        }

        debug!("exchange: {} was created", def.name);
        self.exchanges.insert(def.name.clone(), def.clone());
        Ok(true)
    }

    /// Declares a queue. Returns true when it was created.
    pub fn declare_queue(&mut self, def: &QueueDefinition) -> Result<bool, AmqpError> {
        if let Some(existing) = self.queues.get(&def.name) {
            if !def.passive && existing.durable != def.durable {
                return Err(AmqpError::ConflictError(
                    def.name.clone(),
                    format!("durable {} != {}", def.durable, existing.durable),
                ));
            }
            return Ok(false);
        }

        if def.passive {
            return Err(AmqpError::UnknownQueue(def.name.clone()));
        }

        debug!("queue: {} was created", def.name);
        self.queues.insert(def.name.clone(), def.clone());
        Ok(true)
    }

    /// Binds a queue to an exchange. Returns false when the binding already existed.
    pub fn bind(&mut self, binding: &QueueBinding) -> Result<bool, AmqpError> {
        let pattern = self.pattern_for(binding)?;
        if !self.queues.contains_key(&binding.queue_name) {
            return Err(AmqpError::UnknownQueue(binding.queue_name.clone()));
        }

        let bindings = self
            .bindings
            .entry(binding.exchange_name.clone())
            .or_default();

        if bindings
            .iter()
            .any(|b| b.queue_name == binding.queue_name && b.pattern == pattern)
        {
            return Ok(false);
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        bindings.push(Binding {
            queue_name: binding.queue_name.clone(),
            exchange_name: binding.exchange_name.clone(),
            pattern,
        });
        Ok(true)
    }

    /// Removes a binding. Returns false when no such binding existed.
    pub fn unbind(&mut self, binding: &QueueBinding) -> Result<bool, AmqpError> {
        let pattern = self.pattern_for(binding)?;
        let Some(bindings) = self.bindings.get_mut(&binding.exchange_name) else {
            return Ok(false);
        };

        let before = bindings.len();
        bindings.retain(|b| !(b.queue_name == binding.queue_name && b.pattern == pattern));
        Ok(bindings.len() != before)
    }

    /// Removes a queue definition and every binding targeting it.
    pub fn delete_queue(&mut self, name: &str) -> Result<QueueDefinition, AmqpError> {
        let def = self
            .queues
            .remove(name)
            .ok_or_else(|| AmqpError::UnknownQueue(name.to_owned()))?;

        for bindings in self.bindings.values_mut() {
            bindings.retain(|b| b.queue_name != name);
        }
        debug!("queue: {} was deleted", name);
        Ok(def)
    }

    /// Removes an exchange and its bindings.
    pub fn delete_exchange(&mut self, name: &str) -> Result<ExchangeDefinition, AmqpError> {
        if name == DEFAULT_EXCHANGE {
            return Err(AmqpError::AccessRefused(
                "the default exchange cannot be deleted".to_owned(),
            ));
        }

        let def = self
            .exchanges
            .remove(name)
            .ok_or_else(|| AmqpError::UnknownExchange(name.to_owned()))?;
        self.bindings.remove(name);
        debug!("exchange: {} was deleted", name);
        Ok(def)
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.get(name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn bindings(&self, exchange: &str) -> &[Binding] {
        self.bindings
            .get(exchange)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn pattern_for(&self, binding: &QueueBinding) -> Result<BindingPattern, AmqpError> {
        if binding.exchange_name == DEFAULT_EXCHANGE {
            return Err(AmqpError::AccessRefused(
                "queues cannot be bound to the default exchange".to_owned(),
            ));
        }

        let exchange = self
            .exchanges
            .get(&binding.exchange_name)
            .ok_or_else(|| AmqpError::UnknownExchange(binding.exchange_name.clone()))?;

        match exchange.kind {
            ExchangeKind::Topic => BindingPattern::parse(&binding.routing_key, self.delimiter),
            _ => Ok(BindingPattern::literal(&binding.routing_key)),
        }
    }
}

impl Default for TopologyTable {
    fn default() -> Self {
        TopologyTable::new(crate::pattern::DEFAULT_DELIMITER)
    }
}
