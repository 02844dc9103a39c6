// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Router
//!
//! Resolves the set of queues a published routing key reaches. Bindings of the
//! exchange are evaluated in declaration order and the result is deduplicated, so a
//! queue bound several times receives a message once.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeKind, DEFAULT_EXCHANGE},
    table::TopologyTable,
};
use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

/// Read side of the topology table.
#[derive(Debug, Clone)]
pub struct Router {
    table: Arc<RwLock<TopologyTable>>,
}

impl Router {
    pub fn new(table: Arc<RwLock<TopologyTable>>) -> Router {
        Router { table }
    }

    /// Returns the queues matching `routing_key` on `exchange`.
    ///
    /// An unknown exchange yields an empty set: publishes are fire and forget. The
    /// default exchange routes to the queue named by the key, if it exists.
    pub fn route(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);

        if exchange == DEFAULT_EXCHANGE {
            return table
                .has_queue(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect();
        }

        let Some(def) = table.exchange(exchange) else {
            debug!(exchange, "publish to unknown exchange");
            return BTreeSet::new();
        };

        table
            .bindings(exchange)
            .iter()
            .filter(|b| def.kind == ExchangeKind::Fanout || b.pattern.matches(routing_key))
            .map(|b| b.queue_name.clone())
            .collect()
    }

    /// Like `route`, but an empty result is a `MandatoryError`.
    pub fn route_mandatory(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<BTreeSet<String>, AmqpError> {
        let queues = self.route(exchange, routing_key);
        if queues.is_empty() {
            return Err(AmqpError::MandatoryError(
                exchange.to_owned(),
                routing_key.to_owned(),
            ));
        }
        Ok(queues)
    }
}
