// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for statemachine-connector.

use thiserror::Error;

/// Connector errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Engine or store operation failed.
    #[error("Engine error: {0}")]
    Engine(#[from] statemachine_core::EngineError),

    /// A required runtime component was not provided.
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
}

/// Result type using connector Error.
pub type Result<T> = std::result::Result<T, Error>;
