// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

#[cfg(test)]
mod fakes;

pub mod backoff;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod service;
pub mod topology;
pub mod transport;
