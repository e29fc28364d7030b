// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use aws_sdk_autoscaling::error::DisplayErrorContext;
use aws_sdk_autoscaling::Client;
use tracing::debug;

use crate::error::SinkError;
use crate::sinks::HealthSink;

pub const UNHEALTHY: &str = "Unhealthy";

/// Marks the host instance unhealthy in its Auto Scaling group so the group
/// replaces it after the grace period.
#[derive(Debug, Clone)]
pub struct AutoScalingHealthSink {
    client: Client,
}

impl AutoScalingHealthSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the default AWS credential and region chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl HealthSink for AutoScalingHealthSink {
    async fn mark_unhealthy(&self, instance_id: &str) -> Result<(), SinkError> {
        debug!("AUTOSCALING | set_instance_health instance={instance_id} status={UNHEALTHY}");
        self.client
            .set_instance_health()
            .instance_id(instance_id)
            .health_status(UNHEALTHY)
            .should_respect_grace_period(true)
            .send()
            .await
            .map_err(|e| SinkError::Transport(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}
