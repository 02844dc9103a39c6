// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Replays the `logs` topic scenario on the in-process broker: alerts page someone,
//! infos send an email, and a work pool drains the firehose of every log.

use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use topicmq::{
    broker::Broker,
    channel::{Channel, Connection},
    config::load_configs,
    consumer::{ConsumerHandler, HandlerError},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Publishing},
    queue::{QueueBinding, QueueDefinition},
    topology::{ChannelTopology, Topology},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOGS: [(&str, &str); 6] = [
    ("alert", "disk full on db1"),
    ("info", "nightly backup finished"),
    ("debug.cache", "cache warmed"),
    ("alert", "replica lag above threshold"),
    ("info", "user signup"),
    ("audit.login.failed", "bad password for admin"),
];

struct Firehose;

#[async_trait]
impl ConsumerHandler for Firehose {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        info!(
            consumer = delivery.consumer_tag.as_str(),
            key = delivery.routing_key(),
            "firehose: {}",
            String::from_utf8_lossy(delivery.body())
        );
        Ok(())
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}

fn ack_all(channel: Arc<dyn Channel>, mut stream: topicmq::consumer::DeliveryStream) {
    tokio::spawn(async move {
        while let Some(delivery) = stream.recv().await {
            info!(
                consumer = stream.consumer_tag(),
                "{}: {}",
                delivery.routing_key(),
                String::from_utf8_lossy(delivery.body())
            );
            if let Err(err) = channel.ack(delivery.delivery_id).await {
                error!(error = err.to_string(), "failure to ack");
            }
        }
        info!(consumer = stream.consumer_tag(), "consumer finished");
    });
}

async fn run() -> Result<(), AmqpError> {
    let configs = load_configs()?;
    let broker = Broker::new(configs.dispatch.clone());
    let conn = broker.connect();
    let channel = conn.open_channel().await?;

    let logs = ExchangeDefinition::new("logs").topic().durable();
    let queues: Vec<QueueDefinition> = ["page", "email", "firehose"]
        .into_iter()
        .map(|name| QueueDefinition::new(name).durable())
        .collect();
    let bindings = [
        QueueBinding::new("page").exchange("logs").routing_key("alert"),
        QueueBinding::new("email").exchange("logs").routing_key("info"),
        QueueBinding::new("firehose").exchange("logs").routing_key("#"),
    ];

    let mut topology = ChannelTopology::new(channel.clone()).exchange(&logs);
    for queue in &queues {
        topology = topology.queue(queue);
    }
    for binding in &bindings {
        topology = topology.queue_binding(binding);
    }
    topology.install().await?;

    // three consumers share this channel
    channel.set_qos(3).await?;

    let pages = channel.consume("page", "pager", false).await?;
    ack_all(channel.clone(), pages);

    let emails = channel.consume("email", "", false).await?;
    ack_all(channel.clone(), emails);

    let workers = broker.work_pool("firehose", "firehose", 0, Arc::new(Firehose))?;
    info!(workers = workers.len(), "firehose work pool started");

    for (key, body) in LOGS {
        channel
            .publish("logs", key, Publishing::new(body).persistent(), false)
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    channel.cancel("pager", false).await?;
    info!("pager cancelled");

    for tag in workers {
        broker.cancel(&tag, false).await?;
    }
    conn.close().await
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(err) = run().await {
        error!(error = err.to_string(), "logs topic demo failed");
        std::process::exit(1);
    }
}
