// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::SinkError;
use crate::sinks::{ErrorContext, ErrorReporter, HealthSink};

/// Reports errors as structured `error` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, error: &str, context: &ErrorContext) {
        let context = context
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<String>>()
            .join(" ");
        error!("REPORT | err={error:?} {context}");
    }
}

/// Health sink for hosts without a fleet manager. The escalation is logged
/// and reported as failed, since nothing acts on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHealthSink;

#[async_trait]
impl HealthSink for LoggingHealthSink {
    async fn mark_unhealthy(&self, instance_id: &str) -> Result<(), SinkError> {
        warn!("HEALTH | instance {instance_id} needs replacement but no fleet manager is configured");
        Err(SinkError::Disabled(format!(
            "no fleet manager to mark {instance_id} unhealthy"
        )))
    }
}
