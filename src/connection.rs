// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Connection
//!
//! `RabbitMQConnection` owns the single transport of the process and keeps it
//! alive. Broker error events, broker close events and failed connection
//! attempts all end up in one place, `schedule_reconnect`, which starts at
//! most one reconnect task. That task sleeps for the backoff delay, opens a
//! new transport, re-installs the topology and applies the prefetch limit,
//! and repeats until it succeeds or the connection is closed.
//!
//! Every successful connect bumps a generation counter. Events carry the
//! generation of the transport that produced them so a late event from a dead
//! transport cannot tear down its replacement.
//!
//! Closing only interrupts the backoff sleep. A connection attempt already in
//! progress runs to completion and closes the transport it opened.

use crate::{
    backoff::BackoffState,
    channel::LapinConnector,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    topology::AmqpTopology,
    transport::{ConnectionEvent, Connector, Transport},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Lifecycle of the connection as seen by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// A transport is live and its topology installed
    Connected,
    /// The transport was lost and a reconnect is scheduled
    Reconnecting,
}

struct Shared {
    state: ConnectionState,
    backoff: BackoffState,
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    reconnect_pending: bool,
    closed: bool,
    last_error: Option<AmqpError>,
    reconnect_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

struct Inner {
    configs: RabbitMQConfigs,
    topology: AmqpTopology,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    // held for the whole duration of one connection attempt
    connect_lock: AsyncMutex<()>,
    generation_tx: watch::Sender<u64>,
    closed_tx: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the resilient connection.
///
/// Every clone shares the same transport, state and reconnect task.
#[derive(Clone)]
pub struct RabbitMQConnection {
    inner: Arc<Inner>,
}

impl RabbitMQConnection {
    /// Creates a disconnected connection.
    ///
    /// Nothing is opened until `connect` is called.
    ///
    /// # Parameters
    /// * `configs` - Broker address, connection name, backoff delays and prefetch
    /// * `topology` - Declarations installed after every successful connect
    /// * `connector` - Opens the underlying transports
    ///
    /// # Returns
    /// A new RabbitMQConnection in the `Disconnected` state
    pub fn new(
        configs: RabbitMQConfigs,
        topology: AmqpTopology,
        connector: Arc<dyn Connector>,
    ) -> RabbitMQConnection {
        let backoff = BackoffState::new(
            configs.reconnect_base_delay(),
            configs.reconnect_max_delay(),
        );
        let (generation_tx, _) = watch::channel(0);
        let (closed_tx, _) = watch::channel(false);

        RabbitMQConnection {
            inner: Arc::new(Inner {
                configs,
                topology,
                connector,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    backoff,
                    transport: None,
                    generation: 0,
                    reconnect_pending: false,
                    closed: false,
                    last_error: None,
                    reconnect_task: None,
                    event_task: None,
                }),
                connect_lock: AsyncMutex::new(()),
                generation_tx,
                closed_tx,
            }),
        }
    }

    /// A connection backed by lapin, declaring the topology named in `configs`.
    pub fn with_lapin(configs: RabbitMQConfigs) -> RabbitMQConnection {
        let topology = AmqpTopology::from(&configs);
        RabbitMQConnection::new(configs, topology, Arc::new(LapinConnector))
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.inner.configs
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    /// True only while connected with a live transport.
    ///
    /// Never blocks on I/O; safe to call from health endpoints.
    pub fn is_healthy(&self) -> bool {
        let shared = self.shared();
        shared.state == ConnectionState::Connected && shared.transport.is_some()
    }

    /// Reconnect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.shared().backoff.attempt()
    }

    /// The error of the last failed attempt, cleared on success.
    pub fn last_error(&self) -> Option<AmqpError> {
        self.shared().last_error.clone()
    }

    pub fn generation(&self) -> u64 {
        self.shared().generation
    }

    /// Notified with the new generation after every successful (re)connect.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.inner.generation_tx.subscribe()
    }

    /// The live transport.
    ///
    /// # Returns
    /// The transport of the current generation, or `ChannelUnavailableError`
    /// while disconnected or reconnecting
    pub fn current_transport(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        self.current()
            .map(|(_, transport)| transport)
            .ok_or(AmqpError::ChannelUnavailableError)
    }

    pub(crate) fn current(&self) -> Option<(u64, Arc<dyn Transport>)> {
        let shared = self.shared();
        match (&shared.state, &shared.transport) {
            (ConnectionState::Connected, Some(transport)) => {
                Some((shared.generation, transport.clone()))
            }
            _ => None,
        }
    }

    /// Connects, installs the topology and applies the prefetch limit.
    ///
    /// On failure a reconnect is scheduled before the error is returned, so
    /// callers may treat the error as informational.
    ///
    /// # Returns
    /// Ok(()) once connected, or the error of this attempt
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.establish().await.inspect_err(|err| {
            self.schedule_reconnect(&err.to_string());
        })
    }

    /// Starts the reconnect task unless one is already pending.
    ///
    /// # Parameters
    /// * `reason` - Logged with the reconnect
    ///
    /// # Returns
    /// false when the request was coalesced into a pending reconnect or the
    /// connection is closed
    pub fn schedule_reconnect(&self, reason: &str) -> bool {
        self.trigger_reconnect(None, reason)
    }

    /// Reports a failure noticed by a user of the transport of `generation`.
    pub(crate) fn report_event(&self, generation: u64, event: ConnectionEvent) -> bool {
        let reason = match &event {
            ConnectionEvent::Error(reason) => reason.as_str(),
            ConnectionEvent::Closed => "connection closed",
        };
        self.trigger_reconnect(Some(generation), reason)
    }

    fn trigger_reconnect(&self, generation: Option<u64>, reason: &str) -> bool {
        let mut shared = self.shared();

        if shared.closed {
            debug!(reason, "connection closed, not reconnecting");
            return false;
        }
        if generation.is_some_and(|g| g != shared.generation) {
            debug!(reason, "ignoring event from a replaced connection");
            return false;
        }
        if shared.reconnect_pending {
            debug!(reason, "reconnect already scheduled");
            return false;
        }

        warn!(reason, "rabbitmq connection lost, scheduling reconnect");

        shared.reconnect_pending = true;
        shared.state = ConnectionState::Reconnecting;
        let dead = shared.transport.take();
        shared.reconnect_task = Some(tokio::spawn(self.clone().reconnect_loop(dead)));

        true
    }

    async fn reconnect_loop(self, dead: Option<Arc<dyn Transport>>) {
        if let Some(transport) = dead {
            transport.close().await;
        }

        let mut closed = self.inner.closed_tx.subscribe();

        loop {
            let (attempt, delay) = {
                let mut shared = self.shared();
                let delay = shared.backoff.next_delay();
                (shared.backoff.attempt(), delay)
            };

            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to rabbitmq"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_closed(&mut closed) => {
                    debug!("connection closed during backoff");
                    return;
                }
            }

            match self.establish().await {
                Ok(()) => return,
                Err(AmqpError::ChannelUnavailableError) => return,
                Err(err) if err.is_topology() => error!(
                    error = err.to_string(),
                    attempt, "broker rejected the topology, it will not heal by retrying"
                ),
                Err(err) => warn!(error = err.to_string(), attempt, "reconnect attempt failed"),
            }
        }
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        let _attempt = self.inner.connect_lock.lock().await;

        {
            let mut shared = self.shared();
            if shared.closed {
                return Err(AmqpError::ChannelUnavailableError);
            }
            if shared.state == ConnectionState::Connected && shared.transport.is_some() {
                return Ok(());
            }
            shared.state = ConnectionState::Connecting;
        }

        let cfg = &self.inner.configs;
        info!(name = cfg.app_name.as_str(), "connecting to rabbitmq...");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self
            .inner
            .connector
            .open(&cfg.address, &cfg.app_name, events_tx)
            .await
        {
            Ok(transport) => transport,
            Err(err) => return Err(self.record_failure(err)),
        };

        if let Err(err) = self.prepare(transport.as_ref()).await {
            transport.close().await;
            return Err(self.record_failure(err));
        }

        let accepted = {
            let mut shared = self.shared();
            if shared.closed {
                None
            } else {
                shared.generation += 1;
                shared.state = ConnectionState::Connected;
                shared.transport = Some(transport.clone());
                shared.backoff.reset();
                shared.reconnect_pending = false;
                shared.last_error = None;

                let listener = self.spawn_event_listener(shared.generation, events_rx);
                if let Some(previous) = shared.event_task.replace(listener) {
                    previous.abort();
                }
                Some(shared.generation)
            }
        };

        let Some(generation) = accepted else {
            debug!("connection closed while connecting, discarding transport");
            transport.close().await;
            return Err(AmqpError::ChannelUnavailableError);
        };

        self.inner.generation_tx.send_replace(generation);
        info!(generation, "rabbitmq connected and channel created");

        Ok(())
    }

    async fn prepare(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        self.inner.topology.install(transport).await?;
        transport.qos(self.inner.configs.prefetch()).await
    }

    fn record_failure(&self, err: AmqpError) -> AmqpError {
        let mut shared = self.shared();
        shared.state = if shared.reconnect_pending && !shared.closed {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        shared.last_error = Some(err.clone());

        error!(error = err.to_string(), "failure to connect to rabbitmq");
        err
    }

    fn spawn_event_listener(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                connection.report_event(generation, event);
            }
        })
    }

    /// Cancels any pending reconnect and closes the transport.
    ///
    /// A reconnect waiting for its backoff delay stops right away. A
    /// connection attempt already in progress is awaited; it sees the closed
    /// flag and closes the transport it opened. The connection cannot be
    /// reopened afterwards. Safe to call when it was never opened.
    pub async fn close(&self) {
        let event_task = {
            let mut shared = self.shared();
            shared.closed = true;
            shared.reconnect_pending = false;
            shared.state = ConnectionState::Disconnected;
            shared.reconnect_task.take();
            shared.event_task.take()
        };
        self.inner.closed_tx.send_replace(true);

        if let Some(task) = event_task {
            task.abort();
        }

        // waits for an attempt in flight to discard its transport
        let _attempt = self.inner.connect_lock.lock().await;

        let transport = self.shared().transport.take();
        if let Some(transport) = transport {
            transport.close().await;
            info!("rabbitmq connection closed");
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
