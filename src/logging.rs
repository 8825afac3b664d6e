// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs a `tracing-subscriber` fmt layer on stdout. The crate itself only
//! emits `tracing` events, so any other subscriber works as well.
//!
//! - `LOG_LEVEL`: error, warn, info, debug, trace (default info)
//! - `LOG_FORMAT`: json, pretty, compact (default json)
//! - `RUST_LOG`: overrides the filter entirely

use crate::errors::AmqpError;
use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// lapin and its protocol crates are chatty at debug level
const QUIET_DEPENDENCIES: [&str; 3] = ["lapin=warn", "amq_protocol=warn", "pinky_swear=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn filter(level: Level) -> Result<EnvFilter, AmqpError> {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|err| AmqpError::ConfigError(format!("invalid RUST_LOG: {err}")));
    }

    QUIET_DEPENDENCIES
        .iter()
        .try_fold(EnvFilter::new(level.to_string()), |filter, directive| {
            directive
                .parse()
                .map(|directive| filter.add_directive(directive))
                .map_err(|err| AmqpError::ConfigError(format!("invalid log directive: {err}")))
        })
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(level: Level, format: LogFormat) -> Result<(), AmqpError> {
    let subscriber = tracing_subscriber::registry().with(filter(level)?);

    let result = match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(fmt::layer().compact().with_ansi(true).with_target(false))
            .try_init(),
    };

    result.map_err(|err| AmqpError::ConfigError(format!("logging already initialized: {err}")))
}

/// Reads `LOG_LEVEL` and `LOG_FORMAT` and installs the subscriber.
pub fn init_from_env() -> Result<(), AmqpError> {
    let level = env::var("LOG_LEVEL").map(|l| parse_level(&l)).unwrap_or(Level::INFO);
    let format = env::var("LOG_FORMAT")
        .map(|f| LogFormat::parse(&f))
        .unwrap_or_default();

    init_logging(level, format)
}
