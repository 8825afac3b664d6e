// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error taxonomy shared by every layer of the crate.
//! Connection level errors are recovered by the reconnect loop, topology errors
//! are fatal only on the very first start, and message level errors are
//! contained to the delivery that caused them.

use thiserror::Error;

/// Every failure surfaced by the crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("internal error")]
    InternalError,

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("failure to connect: {0}")]
    ConnectionError(String),

    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// An operation needed a live channel while the connection was down
    #[error("channel unavailable")]
    ChannelUnavailableError,

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    #[error("failure to publish message")]
    PublishingError,

    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// A handler reported a failure while processing a message
    #[error("handler failure: {0}")]
    HandlerError(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),
}

impl AmqpError {
    /// Returns true when the broker rejected part of the topology.
    ///
    /// These errors do not heal on their own: retrying the same declaration
    /// against the same broker fails the same way.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::QoSDeclarationError(_)
        )
    }

    /// Creates a handler error from anything printable.
    pub fn handler<T: ToString>(msg: T) -> Self {
        AmqpError::HandlerError(msg.to_string())
    }
}
