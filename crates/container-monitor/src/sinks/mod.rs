// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream collaborators: the per-container structured log sink, the
//! batched stream-ingestion sink, error reporting and health escalation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::SinkError;

pub mod autoscaling;
pub mod cloudwatch;
pub mod kinesis;
pub mod reporting;

/// One line bound for a per-container sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMessage {
    pub container_id: String,
    pub line: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Container details handed to a sink when it is opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub image_id: String,
    pub image_name: String,
    pub created: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// An open per-container structured log sink.
///
/// `write` must not block on network I/O; implementations buffer and ship
/// asynchronously. `close` flushes whatever is buffered.
#[async_trait]
pub trait LogSink: Send + Sync {
    fn write(&self, message: SinkMessage) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

#[async_trait]
pub trait LogSinkFactory: Send + Sync {
    async fn open(
        &self,
        container: &ContainerMetadata,
        group: &str,
    ) -> Result<Arc<dyn LogSink>, SinkError>;
}

/// One record of a stream batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub data: Vec<u8>,
    pub partition_key: String,
}

/// Per-record outcome of a batch submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordResult {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl RecordResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(code: &str, message: &str) -> Self {
        Self {
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Batched stream-ingestion sink
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Submits a batch. `Err` means the whole batch was rejected at the
    /// transport level; `Ok` carries one result per submitted record.
    async fn put_batch(
        &self,
        stream: &str,
        records: Vec<StreamRecord>,
    ) -> Result<Vec<RecordResult>, SinkError>;
}

pub type ErrorContext = BTreeMap<&'static str, String>;

/// Fire-and-forget error reporting
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &str, context: &ErrorContext);
}

/// Instance health escalation
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn mark_unhealthy(&self, instance_id: &str) -> Result<(), SinkError>;
}
