// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides a typed publishing facade over a `Channel`. Every message gets
//! a fresh message id and the JSON content type, and the caller's OpenTelemetry
//! context is propagated in the message headers for distributed tracing.

use crate::{
    channel::Channel,
    errors::AmqpError,
    message::{Publishing, JSON_CONTENT_TYPE},
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::error;
use uuid::Uuid;

/// Message handed to a `Publisher`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    /// Target exchange
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<BTreeMap<String, String>>,
}

impl PublishMessage {
    /// Serializes `payload` as JSON for `exchange`.
    pub fn json<T: Serialize>(exchange: &str, payload: &T) -> Result<PublishMessage, AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error parsing payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(PublishMessage {
            to: exchange.to_owned(),
            data,
            ..Default::default()
        })
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.to_owned());
        self
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

/// Publisher writing to any `Channel`, in-process or remote.
pub struct ChannelPublisher {
    channel: Arc<dyn Channel>,
    mandatory: bool,
}

impl ChannelPublisher {
    pub fn new(channel: Arc<dyn Channel>) -> Arc<ChannelPublisher> {
        Arc::new(ChannelPublisher {
            channel,
            mandatory: false,
        })
    }

    /// Publisher whose unroutable messages fail with `MandatoryError`.
    pub fn mandatory(channel: Arc<dyn Channel>) -> Arc<ChannelPublisher> {
        Arc::new(ChannelPublisher {
            channel,
            mandatory: true,
        })
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);

        if let Some(extra) = &infos.headers {
            headers.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut publishing = Publishing::new(infos.data.clone())
            .content_type(JSON_CONTENT_TYPE)
            .message_id(Uuid::new_v4());
        publishing.headers = headers;
        if let Some(msg_type) = &infos.msg_type {
            publishing = publishing.msg_type(msg_type);
        }

        let key = infos.key.clone().unwrap_or_default();
        self.channel
            .publish(&infos.to, &key, publishing, self.mandatory)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                err
            })
    }
}
