// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives the decoded message and a `ServiceContext`. Returning
//! `Ok` acknowledges the message; returning an error rejects it without
//! requeue.

use crate::{errors::AmqpError, publisher::RabbitMQPublisher};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{future::Future, sync::Arc};

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub msg_type: String,
    /// The whole JSON body, including the `type` field and any extra fields
    pub payload: Value,
    pub redelivered: bool,
}

impl ConsumerMessage {
    pub fn new(queue: &str, msg_type: &str, payload: Value) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            msg_type: msg_type.to_owned(),
            payload,
            redelivered: false,
        }
    }

    /// Deserializes the payload into a typed message.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        T::deserialize(&self.payload).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// What a handler can use besides the message itself.
#[derive(Clone)]
pub struct ServiceContext {
    /// Trace context extracted from the message headers
    pub otel: Context,
    pub publisher: RabbitMQPublisher,
}

impl ServiceContext {
    pub fn new(otel: Context, publisher: RabbitMQPublisher) -> ServiceContext {
        ServiceContext { otel, publisher }
    }

    /// Publishes `payload` as JSON, continuing the trace of the message being
    /// handled.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key for the message
    /// * `payload` - Any serializable value
    ///
    /// # Returns
    /// `ChannelUnavailableError` while the connection is down
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish(&self.otel, exchange, routing_key, payload)
            .await
    }

    /// Same as `publish` on the default exchange with `queue` as routing key.
    pub async fn send_to_queue<T>(&self, queue: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.send_to_queue(&self.otel, queue, payload).await
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &ServiceContext, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage, ServiceContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn exec(&self, ctx: &ServiceContext, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        (self.0)(msg.clone(), ctx.clone()).await
    }
}

/// Wraps an async closure into a handler.
///
/// ```ignore
/// let handler = handler_fn(|msg, _ctx| async move {
///     println!("order {}", msg.payload["id"]);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage, ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
