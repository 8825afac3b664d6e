// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It routes through the default exchange and through exact-match bindings,
//! and writes every operation to a journal so tests can assert ordering.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, ConnectionEvent, ConnectionEventSender, Connector, DeliveryStream,
        InboundDelivery, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>;

#[derive(Default)]
struct BrokerState {
    open_attempts: usize,
    fail_next_opens: usize,
    rejected_queue: Option<String>,
    declare_delay: Option<Duration>,
    events: Option<ConnectionEventSender>,
    bindings: Vec<QueueBinding>,
    pending: HashMap<String, VecDeque<OutboundMessage>>,
    consumers: HashMap<String, DeliverySender>,
    journal: Vec<String>,
    next_tag: u64,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.clone()))
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.state().fail_next_opens = count;
    }

    pub(crate) fn reject_queue(&self, name: &str) {
        self.state().rejected_queue = Some(name.to_owned());
    }

    /// Makes every queue declaration take `delay`.
    pub(crate) fn delay_declares(&self, delay: Duration) {
        self.state().declare_delay = Some(delay);
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.state().open_attempts
    }

    pub(crate) fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Pushes an event to the latest opened connection.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.state().events {
            let _ = events.send(event);
        }
    }

    /// Simulates a dropped TCP connection: consumers lose their streams and
    /// the connection reports an error followed by a close.
    pub(crate) fn drop_connection(&self) {
        let mut state = self.state();
        state.consumers.clear();
        state.journal.push("connection_lost".to_owned());
        if let Some(events) = state.events.take() {
            let _ = events.send(ConnectionEvent::Error("connection reset by peer".into()));
            let _ = events.send(ConnectionEvent::Closed);
        }
    }

    /// Publishes as an external producer would.
    pub(crate) fn inject(self: &Arc<Self>, queue: &str, body: &[u8]) {
        self.route(OutboundMessage {
            routing_key: queue.to_owned(),
            data: body.to_vec(),
            ..OutboundMessage::default()
        });
    }

    fn route(self: &Arc<Self>, msg: OutboundMessage) {
        let targets: Vec<String> = {
            let state = self.state();
            if msg.exchange.is_empty() {
                vec![msg.routing_key.clone()]
            } else {
                state
                    .bindings
                    .iter()
                    .filter(|b| b.exchange_name == msg.exchange)
                    .filter(|b| b.routing_key.is_empty() || b.routing_key == msg.routing_key)
                    .map(|b| b.queue_name.clone())
                    .collect()
            }
        };

        for queue in targets {
            self.enqueue(&queue, msg.clone());
        }
    }

    fn enqueue(self: &Arc<Self>, queue: &str, msg: OutboundMessage) {
        let mut state = self.state();
        let Some(consumer) = state.consumers.get(queue).cloned() else {
            state.pending.entry(queue.to_owned()).or_default().push_back(msg);
            return;
        };

        state.next_tag += 1;
        let delivery = InboundDelivery {
            msg_type: msg.msg_type,
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            redelivered: false,
            headers: msg.headers,
            data: msg.data,
            acker: Box::new(FakeAcker {
                tag: state.next_tag,
                broker: self.clone(),
            }),
        };
        let _ = consumer.send(Ok(delivery));
    }

    fn record(&self, op: String) {
        self.state().journal.push(op);
    }
}

struct FakeAcker {
    tag: u64,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.record(format!("ack:{}", self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.record(format!("nack:{}:{requeue}", self.tag));
        Ok(())
    }
}

struct FakeConnector(Arc<FakeBroker>);

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _address: &str,
        _connection_name: &str,
        events: ConnectionEventSender,
    ) -> Result<Arc<dyn Transport>, AmqpError> {
        let mut state = self.0.state();
        state.open_attempts += 1;
        state.journal.push("open".to_owned());

        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Err(AmqpError::ConnectionError("connection refused".into()));
        }

        state.events = Some(events);
        Ok(Arc::new(FakeTransport(self.0.clone())))
    }
}

struct FakeTransport(Arc<FakeBroker>);

#[async_trait]
impl Transport for FakeTransport {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let delay = self.0.state().declare_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.0.state();
        if state.rejected_queue.as_deref() == Some(def.name()) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }
        state.journal.push(format!("declare_queue:{}", def.name()));
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.0.record(format!("declare_exchange:{}", def.name()));
        Ok(())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.0.state();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        state.journal.push(format!(
            "bind:{}:{}",
            binding.queue_name(),
            binding.exchange_name()
        ));
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.0.record(format!("qos:{prefetch}"));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.0.record(format!("publish:{}:{}", msg.exchange, msg.routing_key));
        self.0.route(msg.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = {
            let mut state = self.0.state();
            state.journal.push(format!("subscribe:{queue}"));
            state.consumers.insert(queue.to_owned(), tx);
            state.pending.remove(queue).unwrap_or_default()
        };

        for msg in backlog {
            self.0.enqueue(queue, msg);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn close(&self) {
        self.0.record("close".to_owned());
    }
}
