// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstractions
//!
//! The transport is one physical connection plus one channel. These traits are
//! the seam between the resilience layer and the AMQP client: `channel.rs`
//! implements them over lapin, tests implement them in memory.
//!
//! The main components are:
//! - `Connector`: opens a transport and wires broker failure events
//! - `Transport`: topology, publishing, subscription and close
//! - `Acknowledger`: the message scoped ack/nack handle of one delivery

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

/// AMQP message headers.
pub type Headers = BTreeMap<ShortString, AMQPValue>;

/// Push based stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker initiated failure reported by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    Closed,
}

pub type ConnectionEventSender = UnboundedSender<ConnectionEvent>;

/// Terminal settlement of a single delivery.
///
/// Exactly one of `ack` or `nack` must be called for every delivered message,
/// otherwise the broker keeps the message reserved for this channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered by the broker, together with its acknowledger.
pub struct InboundDelivery {
    /// The AMQP `type` property, when the publisher set one
    pub msg_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub data: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("msg_type", &self.msg_type)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A message ready to be sent to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub headers: Headers,
    pub data: Vec<u8>,
}

/// One connection and one channel to the broker.
///
/// Declarations are idempotent: re-declaring an identical queue, exchange or
/// binding succeeds without side effects.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a queue with the arguments of `def`.
    ///
    /// # Returns
    /// `DeclareQueueError` when the broker refuses the declaration, for
    /// instance because the queue exists with other arguments
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Declares an exchange.
    ///
    /// # Returns
    /// `DeclareExchangeError` when the broker refuses the declaration
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    ///
    /// # Returns
    /// `BindingExchangeToQueueError` when the broker refuses the binding
    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Bounds the number of unacknowledged deliveries in flight on the channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Sends a message without waiting for a publisher confirm.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Starts consuming `queue` with manual acknowledgement.
    ///
    /// # Parameters
    /// * `queue` - Name of an already declared queue
    /// * `consumer_tag` - Unique tag identifying the consumer on the channel
    ///
    /// # Returns
    /// A stream of deliveries that ends when the channel goes away
    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    /// Closes the channel and then the connection. Failures are logged only.
    async fn close(&self);
}

/// Opens transports.
///
/// Failures detected after `open` returns are pushed to `events`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and a channel on it.
    ///
    /// # Parameters
    /// * `address` - AMQP URI of the broker
    /// * `connection_name` - Name shown in the broker's management UI
    /// * `events` - Receives errors and closes of the opened connection
    ///
    /// # Returns
    /// The live transport, or `ConnectionError`/`ChannelError`
    async fn open(
        &self,
        address: &str,
        connection_name: &str,
        events: ConnectionEventSender,
    ) -> Result<Arc<dyn Transport>, AmqpError>;
}
