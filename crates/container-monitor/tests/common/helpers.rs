// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use container_monitor::{
    config::AgentConfig,
    dispatcher::EventDispatcher,
    monitor::{Collaborators, Monitor},
    runtime::ContainerDetail,
    state::MonitorState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::mocks::{MockHealth, MockLogSinkFactory, MockReporter, MockRuntime};

pub struct Harness {
    pub runtime: Arc<MockRuntime>,
    pub sinks: Arc<MockLogSinkFactory>,
    pub reporter: Arc<MockReporter>,
    pub health: Arc<MockHealth>,
    pub monitor: Arc<Monitor>,
    pub dispatcher: EventDispatcher,
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        instance_id: "i-test".to_string(),
        cgroup_setup_delay: Duration::ZERO,
        logs_retry_backoff_min: Duration::from_millis(1),
        logs_retry_backoff_max: Duration::from_millis(5),
        ..Default::default()
    }
}

pub fn harness(config: AgentConfig) -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    let sinks = Arc::new(MockLogSinkFactory::default());
    let reporter = Arc::new(MockReporter::default());
    let health = Arc::new(MockHealth::default());

    let monitor = Monitor::new(
        Arc::new(config),
        Arc::new(MonitorState::new()),
        Collaborators {
            runtime: runtime.clone(),
            log_sinks: sinks.clone(),
            reporter: reporter.clone(),
            health: health.clone(),
        },
    );
    let dispatcher = EventDispatcher::new(Arc::clone(&monitor));

    Harness {
        runtime,
        sinks,
        reporter,
        health,
        monitor,
        dispatcher,
    }
}

/// A running container with the given `KEY=VALUE` env entries
pub fn container(id: &str, image: &str, env: &[&str]) -> ContainerDetail {
    ContainerDetail {
        id: id.to_string(),
        name: format!("/{}", &id[..id.len().min(8)]),
        path: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "run".to_string()],
        image: format!("sha256:{id}"),
        config_image: image.to_string(),
        created: "2024-01-02T03:04:05Z".to_string(),
        env: env.iter().map(|e| e.to_string()).collect(),
        labels: Default::default(),
        running: true,
    }
}

pub fn stopped(detail: &ContainerDetail) -> ContainerDetail {
    ContainerDetail {
        running: false,
        ..detail.clone()
    }
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until every subscription of `id` has run to completion, including
/// the sink close that follows the release of its slot.
pub async fn wait_for_subscription_end(harness: &Harness, id: &str, started: usize) {
    let supervisor = harness.monitor.supervisor();
    wait_for("subscription to end", || {
        supervisor.subscriptions_started(id) >= started
            && !supervisor.has_subscription(id)
            && supervisor.active_handlers(id) == 0
    })
    .await;
}
