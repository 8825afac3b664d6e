// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages through whatever transport is live at the time of
//! the call. While the connection is down, publishing fails immediately with
//! `ChannelUnavailableError` instead of queueing.

use crate::{
    connection::RabbitMQConnection,
    errors::AmqpError,
    otel,
    transport::{Headers, OutboundMessage},
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Sends messages over the resilient connection.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    connection: RabbitMQConnection,
}

impl RabbitMQPublisher {
    /// Creates a publisher.
    ///
    /// # Parameters
    /// * `connection` - Shared connection; publishes use whichever transport is
    ///   live at call time
    pub fn new(connection: RabbitMQConnection) -> RabbitMQPublisher {
        RabbitMQPublisher { connection }
    }

    /// Publishes `payload` as JSON to `exchange` with `routing_key`.
    ///
    /// When the payload is an object with a string `type` field, that value is
    /// also set as the AMQP `type` property. The trace context of `ctx` is
    /// propagated in the headers.
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::PublishingError
        })?;
        let msg_type = value.get("type").and_then(Value::as_str).map(str::to_owned);
        let data = serde_json::to_vec(&value).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::PublishingError
        })?;

        self.publish_bytes(ctx, exchange, routing_key, msg_type, data)
            .await
    }

    /// Publishes `payload` directly to `queue` through the default exchange.
    pub async fn send_to_queue<T>(
        &self,
        ctx: &Context,
        queue: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(ctx, "", queue, payload).await
    }

    /// Publishes an already encoded body.
    ///
    /// # Returns
    /// `ChannelUnavailableError` while the connection is down, the transport
    /// error otherwise. Nothing is buffered.
    pub async fn publish_bytes(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        msg_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<(), AmqpError> {
        let transport = self.connection.current_transport()?;

        let mut headers = Headers::new();
        otel::inject_context(ctx, &mut headers);

        transport
            .publish(&OutboundMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                msg_type,
                headers,
                data,
            })
            .await?;

        debug!(exchange, routing_key, "message published");
        Ok(())
    }
}
