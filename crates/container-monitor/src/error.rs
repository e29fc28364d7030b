// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned by the container runtime client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The subject container no longer exists. Terminal for the operation.
    #[error("No such container: {0}")]
    NotFound(String),

    /// The runtime call failed and the container state is indeterminate.
    #[error("Runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Errors returned by log and stream sinks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to open sink: {0}")]
    Open(String),

    #[error("Failed to write to sink: {0}")]
    Write(String),

    #[error("Failed to close sink: {0}")]
    Close(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sink is closed")]
    Closed,

    /// The sink has no backing service on this host.
    #[error("Sink is disabled: {0}")]
    Disabled(String),
}

/// Top level error for the monitor
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
