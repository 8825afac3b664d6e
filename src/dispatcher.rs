// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Routes decoded messages to the handler registered for their type. The
//! handler table is built once with `DispatcherBuilder` and never changes
//! afterwards, so it can be shared by every concurrent delivery without
//! locking.

use crate::{
    configs::{RabbitMQConfigs, UnroutablePolicy},
    consumer::consume,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, ServiceContext},
    publisher::RabbitMQPublisher,
    transport::DeliveryStream,
};
use futures_util::{FutureExt, StreamExt};
use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

pub use crate::consumer::Settlement;

/// Result of routing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The handler returned `Ok`
    Processed,
    /// The handler returned an error or panicked
    Failed(AmqpError),
    /// No handler is registered for the message type
    Unroutable,
}

impl DispatchOutcome {
    /// How the delivery that produced this outcome is settled.
    pub fn settlement(&self, policy: UnroutablePolicy) -> Settlement {
        match (self, policy) {
            (DispatchOutcome::Processed, _) => Settlement::Ack,
            (DispatchOutcome::Failed(_), _) => Settlement::Reject,
            (DispatchOutcome::Unroutable, UnroutablePolicy::Ack) => Settlement::Ack,
            (DispatchOutcome::Unroutable, UnroutablePolicy::DeadLetter) => Settlement::Reject,
        }
    }
}

/// Collects handlers before the dispatcher is frozen by `build`.
pub struct DispatcherBuilder {
    queue: String,
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
    unroutable: UnroutablePolicy,
    concurrency: usize,
}

impl DispatcherBuilder {
    /// Registers `handler` for messages whose type is exactly `msg_type`.
    ///
    /// Registering the same type twice keeps the last handler.
    pub fn register(mut self, msg_type: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        if self.handlers.insert(msg_type.to_owned(), handler).is_some() {
            warn!(msg_type, "handler replaced");
        }
        self
    }

    pub fn unroutable_policy(mut self, policy: UnroutablePolicy) -> Self {
        self.unroutable = policy;
        self
    }

    /// Maximum number of deliveries processed at the same time, at least 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Freezes the handler table.
    ///
    /// # Returns
    /// A RabbitMQDispatcher whose handlers can no longer change
    pub fn build(self) -> RabbitMQDispatcher {
        RabbitMQDispatcher {
            queue: self.queue,
            handlers: self.handlers,
            unroutable: self.unroutable,
            concurrency: self.concurrency,
        }
    }
}

/// Routes messages of one queue to handlers by message type.
pub struct RabbitMQDispatcher {
    queue: String,
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
    unroutable: UnroutablePolicy,
    concurrency: usize,
}

impl RabbitMQDispatcher {
    /// Starts an empty handler table.
    ///
    /// # Parameters
    /// * `queue` - The consumed queue, used in logs and handed to handlers
    ///
    /// # Returns
    /// A builder with the `Ack` unroutable policy and concurrency 1
    pub fn builder(queue: &str) -> DispatcherBuilder {
        DispatcherBuilder {
            queue: queue.to_owned(),
            handlers: HashMap::default(),
            unroutable: UnroutablePolicy::default(),
            concurrency: 1,
        }
    }

    /// A builder for the consumed queue, unroutable policy and prefetch of
    /// `configs`.
    pub fn from_configs(configs: &RabbitMQConfigs) -> DispatcherBuilder {
        RabbitMQDispatcher::builder(&configs.queue)
            .unroutable_policy(configs.unroutable_policy)
            .concurrency(configs.concurrency())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn unroutable_policy(&self) -> UnroutablePolicy {
        self.unroutable
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn handles(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    /// Looks up the handler for `msg.msg_type` and runs it.
    ///
    /// A panicking handler is contained and reported as `Failed`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context and publisher handed to the handler
    /// * `msg` - The parsed message
    ///
    /// # Returns
    /// `Unroutable` when no handler is registered for the type, otherwise
    /// `Processed` or `Failed` depending on the handler result
    pub async fn process_message(
        &self,
        ctx: &ServiceContext,
        msg: &ConsumerMessage,
    ) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&msg.msg_type) else {
            warn!(
                queue = %self.queue,
                msg_type = %msg.msg_type,
                "no handler registered for message type"
            );
            return DispatchOutcome::Unroutable;
        };

        let result = AssertUnwindSafe(handler.exec(ctx, msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(AmqpError::HandlerError(panic_message(panic))));

        match result {
            Ok(()) => {
                debug!(msg_type = %msg.msg_type, "message successfully processed");
                DispatchOutcome::Processed
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    msg_type = %msg.msg_type,
                    "error whiling handling msg"
                );
                DispatchOutcome::Failed(err)
            }
        }
    }

    /// Processes every delivery of `deliveries` until the stream ends.
    ///
    /// At most `concurrency()` deliveries are handled at once. Each one is
    /// settled before its slot is released, and the deliveries still in flight
    /// when the stream ends are awaited.
    ///
    /// # Parameters
    /// * `deliveries` - Stream of one subscription
    /// * `publisher` - Handed to handlers through their `ServiceContext`
    pub async fn run(&self, deliveries: DeliveryStream, publisher: &RabbitMQPublisher) {
        deliveries
            .for_each_concurrent(self.concurrency, |result| async move {
                match result {
                    Ok(delivery) => {
                        consume(self, publisher, delivery).await;
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            })
            .await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown".to_owned());
    format!("handler panicked: {detail}")
}
