// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Service
//!
//! `RabbitMQService` ties the resilient connection to the dispatcher. After
//! `start`, a consumer task subscribes to the configured queue every time the
//! connection reaches a new generation, and feeds the deliveries to the
//! dispatcher. When the delivery stream ends or the subscription fails, the
//! task reports it to the connection, which reconnects.
//!
//! ```ignore
//! let configs = RabbitMQConfigs::from_env()?;
//! let dispatcher = RabbitMQDispatcher::from_configs(&configs)
//!     .register("order_created", handler_fn(|msg, _ctx| async move {
//!         info!(id = %msg.payload["id"], "order created");
//!         Ok(())
//!     }))
//!     .build();
//!
//! RabbitMQService::from_configs(configs, dispatcher)?
//!     .run_until_shutdown(Duration::from_secs(10))
//!     .await?;
//! ```

use crate::{
    configs::RabbitMQConfigs,
    connection::RabbitMQConnection,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    publisher::RabbitMQPublisher,
    transport::ConnectionEvent,
};
use futures_util::StreamExt;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Resilient consumer of one queue.
pub struct RabbitMQService {
    connection: RabbitMQConnection,
    dispatcher: Arc<RabbitMQDispatcher>,
    publisher: RabbitMQPublisher,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
    stopping: watch::Sender<bool>,
}

impl RabbitMQService {
    /// Creates a service that is not consuming yet.
    ///
    /// # Parameters
    /// * `connection` - The resilient connection; its topology should declare
    ///   the dispatcher's queue
    /// * `dispatcher` - Handler table for the consumed queue
    ///
    /// # Returns
    /// A new RabbitMQService; call `start` to begin consuming
    pub fn new(connection: RabbitMQConnection, dispatcher: RabbitMQDispatcher) -> RabbitMQService {
        let (stopping, _) = watch::channel(false);

        RabbitMQService {
            publisher: RabbitMQPublisher::new(connection.clone()),
            connection,
            dispatcher: Arc::new(dispatcher),
            consumer_task: Mutex::new(None),
            stopping,
        }
    }

    /// A service over a lapin connection built from `configs`.
    ///
    /// # Parameters
    /// * `configs` - Validated here; `queue` must be set
    /// * `dispatcher` - Usually built with `RabbitMQDispatcher::from_configs`
    ///
    /// # Returns
    /// The service, or `ConfigError` for an invalid configuration
    pub fn from_configs(
        configs: RabbitMQConfigs,
        dispatcher: RabbitMQDispatcher,
    ) -> Result<RabbitMQService, AmqpError> {
        configs.validate()?;
        if configs.queue.trim().is_empty() {
            return Err(AmqpError::ConfigError("queue is required".into()));
        }

        Ok(RabbitMQService::new(
            RabbitMQConnection::with_lapin(configs),
            dispatcher,
        ))
    }

    pub fn connection(&self) -> &RabbitMQConnection {
        &self.connection
    }

    /// A publisher sharing the service's connection.
    pub fn publisher(&self) -> RabbitMQPublisher {
        self.publisher.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.connection.is_healthy()
    }

    /// Connects and starts consuming.
    ///
    /// A topology rejected on the first connect is returned as an error and
    /// the service is stopped. Other connection failures are logged and left
    /// to the reconnect loop. Calling `start` on a running service does
    /// nothing.
    ///
    /// # Returns
    /// Ok(()) once the consumer task runs, the topology error of the first
    /// connect, or `ChannelUnavailableError` after `stop`
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.consumer_running() {
            warn!("consumer already started");
            return Ok(());
        }

        match self.connection.connect().await {
            Ok(()) => {}
            Err(err) if err.is_topology() => {
                error!(error = err.to_string(), "broker rejected the topology");
                self.stop().await;
                return Err(err);
            }
            Err(AmqpError::ChannelUnavailableError) => {
                error!("connection was closed, the service cannot be restarted");
                return Err(AmqpError::ChannelUnavailableError);
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    "first connection failed, retrying in background"
                )
            }
        }

        let task = tokio::spawn(consume_loop(
            self.connection.clone(),
            self.dispatcher.clone(),
            self.publisher.clone(),
            self.stopping.subscribe(),
        ));
        if let Some(previous) = self.consumer_task().replace(task) {
            previous.abort();
        }

        info!(queue = self.dispatcher.queue(), "consumer started");
        Ok(())
    }

    /// Aborts the consumer task and closes the connection.
    ///
    /// Deliveries being processed are dropped unsettled and redelivered by the
    /// broker. Safe to call when the service was never started.
    pub async fn stop(&self) {
        self.stopping.send_replace(true);

        if let Some(task) = self.consumer_task().take() {
            task.abort();
            info!(queue = self.dispatcher.queue(), "consumer stopped");
        }

        self.connection.close().await;
    }

    /// Stops taking new deliveries, lets the ones in flight settle, then
    /// closes the connection.
    ///
    /// # Parameters
    /// * `grace` - How long in-flight handlers may run, and separately how
    ///   long closing the connection may take. Handlers still running after
    ///   it are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.stopping.send_replace(true);

        let task = self.consumer_task().take();
        if let Some(mut task) = task {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(_) => info!(queue = self.dispatcher.queue(), "consumer drained"),
                Err(_) => {
                    warn!(
                        grace_ms = grace.as_millis() as u64,
                        "in-flight messages did not settle in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        if tokio::time::timeout(grace, self.connection.close()).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "closing the connection timed out"
            );
        }
    }

    /// Starts the service, waits for SIGINT or SIGTERM, then shuts it down
    /// within `grace`.
    ///
    /// # Returns
    /// Ok(()) after shutdown, or the error of `start`
    pub async fn run_until_shutdown(&self, grace: Duration) -> Result<(), AmqpError> {
        self.start().await?;

        shutdown_signal().await;

        self.shutdown(grace).await;
        Ok(())
    }

    fn consumer_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.consumer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn consumer_running(&self) -> bool {
        self.consumer_task()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

async fn stopped(mut stopping: watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stopping| *stopping).await;
}

/// Subscribes once per connection generation and drains the deliveries.
async fn consume_loop(
    connection: RabbitMQConnection,
    dispatcher: Arc<RabbitMQDispatcher>,
    publisher: RabbitMQPublisher,
    stopping: watch::Receiver<bool>,
) {
    let mut generations = connection.watch_generation();
    let mut seen = 0;

    loop {
        let next = tokio::select! {
            next = generations.wait_for(|g| *g > seen) => next.map(|g| *g),
            _ = stopped(stopping.clone()) => return,
        };
        match next {
            Ok(generation) => seen = generation,
            Err(_) => return,
        }

        let Some((generation, transport)) = connection.current() else {
            continue;
        };
        seen = seen.max(generation);

        let queue = dispatcher.queue();
        let consumer_tag = format!("{queue}-{}", Uuid::new_v4());

        match transport.subscribe(queue, &consumer_tag).await {
            Ok(deliveries) => {
                info!(queue, consumer_tag = %consumer_tag, generation, "consuming");
                let deliveries = deliveries.take_until(stopped(stopping.clone())).boxed();
                dispatcher.run(deliveries, &publisher).await;

                if *stopping.borrow() {
                    info!(queue, "stopped taking deliveries");
                    return;
                }

                warn!(queue, generation, "delivery stream ended");
                connection.report_event(generation, ConnectionEvent::Closed);
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to subscribe");
                connection.report_event(generation, ConnectionEvent::Error(err.to_string()));
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
