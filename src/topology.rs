// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module holds the set of exchanges, queues, and bindings the consumer
//! depends on. The broker is not assumed to keep any of it across a lost
//! connection, so the whole set is installed again after every (re)connect.
//! Every declaration is idempotent, which makes re-installing safe.

use crate::{
    configs::{RabbitMQConfigs, UnroutablePolicy},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// The declarations to (re-)assert on every connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.retain(|e| e.name != def.name);
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology. A later definition with the
    /// same name replaces the earlier one.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    /// Installs the topology through the given transport.
    ///
    /// Exchanges are created first, then queues (with their DLQs), then
    /// bindings. The first rejected declaration aborts the install.
    pub async fn install(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        self.install_exchanges(transport).await?;
        self.install_queues(transport).await?;
        self.binding_queues(transport).await
    }

    async fn install_exchanges(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            transport.declare_exchange(exch).await.inspect_err(|err| {
                error!(error = err.to_string(), name = %exch.name, "error to declare the exchange")
            })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(dlq_name) = &def.dlq_name {
                let mut dlq = QueueDefinition::new(dlq_name);
                dlq.durable = def.durable;

                transport.declare_queue(&dlq).await.inspect_err(|err| {
                    error!(error = err.to_string(), name = %dlq_name, "failure to declare dlq")
                })?;
            }

            debug!("creating queue: {}", def.name);

            transport.declare_queue(def).await.inspect_err(|err| {
                error!(error = err.to_string(), name = %def.name, "failure to declare queue")
            })?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            transport.bind(binding).await.inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange")
            })?;
        }

        Ok(())
    }
}

impl From<&RabbitMQConfigs> for AmqpTopology {
    /// Builds the topology named by the configuration. The consumed queue is
    /// always declared; with the dead-letter policy it also gets a DLQ.
    fn from(cfg: &RabbitMQConfigs) -> Self {
        let mut topology = AmqpTopology::new();

        for exch in &cfg.exchange_declarations {
            let definition = ExchangeDefinition::new(&exch.name).kind(exch.kind).durable();
            topology = topology.exchange(definition);
        }

        let mut names: Vec<&str> = cfg.queues_to_declare.iter().map(String::as_str).collect();
        if !cfg.queue.is_empty() && !names.contains(&cfg.queue.as_str()) {
            names.push(&cfg.queue);
        }

        for name in names {
            let mut def = QueueDefinition::new(name);
            if cfg.queues_durable {
                def = def.durable();
            }
            if name == cfg.queue && cfg.unroutable_policy == UnroutablePolicy::DeadLetter {
                def = def.with_dlq();
            }
            topology = topology.queue(def);
        }

        for binding in &cfg.bindings {
            topology = topology.queue_binding(
                QueueBinding::new(&binding.queue)
                    .exchange(&binding.exchange)
                    .routing_key(&binding.pattern),
            );
        }

        topology
    }
}

/// Builds the `x-` arguments of a queue declaration.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(dlq_name) = &def.dlq_name {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dlq_name.as_str())),
        );
    }

    let limits = [
        (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
        (AMQP_HEADERS_MAX_LENGTH, def.max_length),
        (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
    ];
    for (key, value) in limits {
        if let Some(value) = value {
            args.insert(ShortString::from(key), AMQPValue::LongInt(LongInt::from(value)));
        }
    }

    FieldTable::from(args)
}
