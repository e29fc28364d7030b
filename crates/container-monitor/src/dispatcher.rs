// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inventory of existing containers and dispatch of live lifecycle events.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RuntimeError;
use crate::monitor::{ucfirst, Monitor};
use crate::runtime::{EventKind, ListFilter, RuntimeEvent};
use crate::state::AgentIdentity;

type QueuedEvent = Result<RuntimeEvent, RuntimeError>;

pub struct EventDispatcher {
    monitor: Arc<Monitor>,
}

impl EventDispatcher {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }

    /// Takes inventory of existing containers, then dispatches live events
    /// until the runtime closes the event feed.
    ///
    /// A failed inventory or a closed feed marks the runtime unhealthy.
    pub async fn run(&self) {
        if let Err(e) = self.inventory().await {
            self.monitor.set_unhealthy("docker", &e).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let feed = self.monitor.runtime.subscribe_events();
        tokio::spawn(pump_events(feed, tx));

        self.consume(rx).await;
        self.monitor
            .set_unhealthy("docker", "event feed closed")
            .await;
    }

    /// Registers every running container, identifying the agent's own
    /// container first, then reports containers that already exited.
    pub async fn inventory(&self) -> Result<(), RuntimeError> {
        let monitor = &self.monitor;

        monitor.log_system("container handle_running at=start");
        let running = monitor
            .runtime
            .list_containers(ListFilter::Running)
            .await?;

        for container in &running {
            if monitor.config.is_agent_image(&container.image) {
                let identity = AgentIdentity::from_image(&container.id, &container.image);
                monitor.log_system(&format!(
                    "container handle_running agent=true id={} version={}",
                    identity.id, identity.version
                ));
                monitor.state.set_identity(identity);
            }
        }

        for container in &running {
            monitor.log_system(&format!("container handle_running id={}", container.id));
            monitor.handle_create(&container.id).await;
            if !monitor.state.is_agent(&container.id) {
                self.spawn_handler(&container.id, EventKind::Start);
            }
        }
        monitor.log_system("container handle_running at=end");

        monitor.log_system("container handle_exited at=start");
        let exited = monitor
            .runtime
            .list_containers(ListFilter::Exited)
            .await?;
        for container in &exited {
            monitor.log_system(&format!("container handle_exited id={}", container.id));
            monitor.handle_die(&container.id);
        }
        monitor.log_system("container handle_exited at=end");

        Ok(())
    }

    async fn consume(&self, mut rx: mpsc::UnboundedReceiver<QueuedEvent>) {
        while let Some(queued) = rx.recv().await {
            match queued {
                Ok(event) => self.dispatch(event).await,
                Err(e) => {
                    self.monitor.log_system(&format!(
                        "container handle_events count#DockerEventsError=1 err={:?}",
                        e.to_string()
                    ));
                    self.monitor.report_error(&e);
                }
            }
        }
    }

    /// Dispatches one lifecycle event.
    ///
    /// `create` is handled before returning so the environment of a
    /// container is registered before any later event of the same container
    /// is looked at. Every other kind runs as a supervised task.
    pub async fn dispatch(&self, event: RuntimeEvent) {
        let RuntimeEvent { id, kind, time } = event;

        match &kind {
            EventKind::Create => {
                self.monitor.handle_create(&id).await;
            }
            EventKind::Other(_) => {}
            lifecycle => self.spawn_handler(&id, lifecycle.clone()),
        }

        let metric = format!("DockerEvent{}", ucfirst(kind.as_str()));
        let process = self
            .monitor
            .state
            .env(&id)
            .and_then(|env| env.process().map(str::to_string));
        let line = match process {
            Some(process) => format!(
                "container handle_events id={id} process={process} time={time} count#{metric}=1"
            ),
            None => format!("container handle_events id={id} time={time} count#{metric}=1"),
        };
        self.monitor.log_system(&line);
    }

    fn spawn_handler(&self, id: &str, kind: EventKind) {
        let monitor = Arc::clone(&self.monitor);
        let container_id = id.to_string();
        self.monitor.supervisor.spawn_handler(id, async move {
            let id = container_id.as_str();
            match kind {
                EventKind::Start => monitor.handle_start(id).await,
                EventKind::Stop => monitor.handle_stop(id),
                EventKind::Die => monitor.handle_die(id),
                EventKind::Kill => monitor.handle_kill(id),
                EventKind::Oom => monitor.handle_oom(id),
                EventKind::Create => {
                    monitor.handle_create(id).await;
                }
                EventKind::Other(_) => {}
            }
        });
    }
}

async fn pump_events(
    mut feed: futures::stream::BoxStream<'static, QueuedEvent>,
    tx: mpsc::UnboundedSender<QueuedEvent>,
) {
    while let Some(event) = feed.next().await {
        if tx.send(event).is_err() {
            break;
        }
    }
}
