// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! The `Broker` owns the topology table, the runtime queues and the dispatcher. It
//! is the composite behind the in-process `Connection`/`Channel` implementation and
//! can also be used directly.
//!
//! Locking: the topology table sits behind a read-mostly lock, the queue map behind
//! another, and each queue serializes its own operations. There is no lock spanning
//! several queues.

use crate::{
    channel::LocalConnection,
    config::DispatchConfigs,
    consumer::{ConsumerDefinition, ConsumerHandler, DeliveryStream},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryId, Message, Publishing},
    queue::{Queue, QueueBinding, QueueDefinition},
    router::Router,
    store::{MessageStore, NoopStore},
    table::TopologyTable,
};
use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of server-generated queue names
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// Status of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Topology, queues and dispatcher of one in-process broker.
pub struct Broker {
    table: Arc<RwLock<TopologyTable>>,
    router: Router,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    dispatcher: Dispatcher,
    store: Arc<dyn MessageStore>,
    sequence: Arc<AtomicU64>,
    configs: DispatchConfigs,
}

impl Broker {
    /// Creates a broker with the given dispatch settings and no message store.
    pub fn new(configs: DispatchConfigs) -> Arc<Broker> {
        Broker::with_store(configs, Arc::new(NoopStore))
    }

    /// Creates a broker whose durable queues persist into `store`.
    pub fn with_store(configs: DispatchConfigs, store: Arc<dyn MessageStore>) -> Arc<Broker> {
        let table = Arc::new(RwLock::new(TopologyTable::new(configs.delimiter)));
        Arc::new(Broker {
            router: Router::new(table.clone()),
            table,
            queues: RwLock::default(),
            dispatcher: Dispatcher::new(),
            store,
            sequence: Arc::new(AtomicU64::new(0)),
            configs,
        })
    }

    /// Opens an in-process connection to this broker.
    pub fn connect(self: &Arc<Self>) -> LocalConnection {
        LocalConnection::new(self.clone())
    }

    pub fn configs(&self) -> &DispatchConfigs {
        &self.configs
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn table(&self) -> RwLockWriteGuard<'_, TopologyTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn queues(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Queue>>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn queues_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Queue>>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);
        self.table().declare_exchange(def)?;
        Ok(())
    }

    pub fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.table().delete_exchange(name)?;
        Ok(())
    }

    /// Declares a queue and returns its status. An empty name gets a generated one.
    pub fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut def = def.clone();
        if def.name.is_empty() {
            def.name = format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple());
        }
        debug!("creating queue: {}", def.name);

        let mut table = self.table();
        let created = table.declare_queue(&def)?;

        let mut queues = self.queues_mut();
        if created {
            let queue = Queue::new(def.clone(), self.sequence.clone(), self.store.clone());
            queues.insert(def.name.clone(), queue);
        }

        let queue = queues
            .get(&def.name)
            .ok_or_else(|| AmqpError::UnknownQueue(def.name.clone()))?;
        Ok(QueueInfo {
            name: def.name.clone(),
            message_count: queue.message_count() as u32,
            consumer_count: queue.consumer_count() as u32,
        })
    }

    /// Deletes a queue with its bindings. Pending and unacked messages are dropped
    /// and the queue's consumers are stopped. Returns the number of dropped messages.
    pub fn delete_queue(&self, name: &str) -> Result<usize, AmqpError> {
        let mut table = self.table();
        table.delete_queue(name)?;
        let queue = self.queues_mut().remove(name);
        drop(table);

        let dropped = queue.map(|q| q.delete()).unwrap_or_default();
        if dropped > 0 {
            warn!(queue = name, dropped, "queue deleted with messages");
        }
        Ok(dropped)
    }

    /// Drops every pending message of a queue.
    pub fn purge_queue(&self, name: &str) -> Result<usize, AmqpError> {
        self.queue(name)?.purge()
    }

    pub fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.table().bind(binding)?;
        Ok(())
    }

    pub fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.table().unbind(binding)?;
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Result<Arc<Queue>, AmqpError> {
        self.queues()
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownQueue(name.to_owned()))
    }

    /// Routes a publishing and enqueues it on every matching queue, once per queue.
    ///
    /// Unroutable messages are dropped unless `mandatory` is set, in which case the
    /// publish fails with `MandatoryError`. Returns the number of queues reached.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
        mandatory: bool,
    ) -> Result<usize, AmqpError> {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if table.exchange(exchange).is_some_and(|def| def.internal) {
                return Err(AmqpError::AccessRefused(format!(
                    "cannot publish to internal exchange `{}`",
                    exchange
                )));
            }
        }

        let targets = if mandatory {
            self.router.route_mandatory(exchange, routing_key)?
        } else {
            self.router.route(exchange, routing_key)
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message is unroutable, dropping");
            return Ok(0);
        }

        let message = Arc::new(Message::from_publishing(exchange, routing_key, publishing));
        let queues: Vec<Arc<Queue>> = {
            let queues = self.queues();
            targets
                .iter()
                .filter_map(|name| queues.get(name).cloned())
                .collect()
        };

        let mut first_err = None;
        let mut reached = 0;
        for queue in queues {
            match queue.enqueue(message.clone()) {
                Ok(()) => reached += 1,
                Err(err) => {
                    warn!(error = err.to_string(), queue = queue.name(), "failure to enqueue");
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(reached),
        }
    }

    /// Completes a definition with the broker defaults for prefetch and timeout.
    pub fn consumer_definition(&self, tag: &str, auto_ack: bool) -> ConsumerDefinition {
        let mut def = ConsumerDefinition::new(tag).prefetch(self.configs.default_prefetch);
        if auto_ack {
            def = def.auto_ack();
        }
        if let Some(ms) = self.configs.delivery_timeout_ms {
            def = def.delivery_timeout(Duration::from_millis(ms));
        }
        def
    }

    /// Subscribes a consumer and returns its delivery stream.
    pub fn consume(
        &self,
        queue: &str,
        def: ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        self.dispatcher.subscribe(self.queue(queue)?, def)
    }

    /// Subscribes a handler-driven consumer and returns its tag.
    pub fn consume_with_handler(
        &self,
        queue: &str,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, AmqpError> {
        self.dispatcher
            .subscribe_with_handler(self.queue(queue)?, def, handler)
    }

    /// Starts a pool of auto-ack workers on `queue`. With `workers == 0` the
    /// configured pool size is used.
    pub fn work_pool(
        &self,
        queue: &str,
        tag_prefix: &str,
        workers: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Vec<String>, AmqpError> {
        let workers = match workers {
            0 => self.configs.work_pool_size,
            n => n,
        };
        self.dispatcher
            .work_pool(self.queue(queue)?, tag_prefix, workers, handler)
    }

    pub async fn cancel(&self, consumer_tag: &str, immediate: bool) -> Result<(), AmqpError> {
        self.dispatcher.cancel(consumer_tag, immediate).await
    }

    /// Acknowledges a delivery on whichever queue holds it.
    pub fn ack(&self, id: DeliveryId) -> Result<(), AmqpError> {
        self.owner(id)?.ack_delivery(id)
    }

    pub fn nack(&self, id: DeliveryId, requeue: bool) -> Result<(), AmqpError> {
        self.owner(id)?.nack_delivery(id, requeue)
    }

    fn owner(&self, id: DeliveryId) -> Result<Arc<Queue>, AmqpError> {
        self.queues()
            .values()
            .find(|q| q.owns(id))
            .cloned()
            .ok_or(AmqpError::UnknownDeliveryError(id.0))
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queues().keys().collect::<Vec<_>>())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
