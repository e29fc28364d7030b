// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogsOptions};
use bollard::errors::Error as BollardError;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerDetail, ContainerRuntime, ContainerSummary, EventKind, ListFilter, RuntimeEvent,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

// Log follows and the event feed are expected to stay open for the lifetime
// of the container or agent.
const STREAM_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    streaming: Docker,
}

impl DockerRuntime {
    /// Connects to `host` (a `unix://` socket path), or to the endpoint named
    /// by `DOCKER_HOST`/the local socket when `host` is not a unix socket.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_unix(h, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            _ => Docker::connect_with_defaults(),
        }
        .map_err(map_error)?;

        let streaming = docker.clone().with_timeout(STREAM_TIMEOUT);
        Ok(Self { docker, streaming })
    }

    pub fn from_client(docker: Docker) -> Self {
        let streaming = docker.clone().with_timeout(STREAM_TIMEOUT);
        Self { docker, streaming }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        let all = match filter {
            ListFilter::Running => false,
            ListFilter::Exited => {
                filters.insert("status".to_string(), vec!["exited".to_string()]);
                true
            }
        };

        let options = ListContainersOptions::<String> {
            all,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
            })
            .filter(|c| !c.id.is_empty())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let container = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let config = container.config.unwrap_or_default();

        Ok(ContainerDetail {
            id: container.id.unwrap_or_else(|| id.to_string()),
            name: container.name.unwrap_or_default(),
            path: container.path.unwrap_or_default(),
            args: container.args.unwrap_or_default(),
            image: container.image.unwrap_or_default(),
            config_image: config.image.unwrap_or_default(),
            created: container.created.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            running: container
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
        })
    }

    fn follow_logs(
        &self,
        id: &str,
        since: i64,
    ) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            timestamps: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.streaming
            .logs(id, Some(options))
            .map(|chunk| {
                chunk
                    .map(|output| output.into_bytes().to_vec())
                    .map_err(map_error)
            })
            .boxed()
    }

    fn subscribe_events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.streaming
            .events(Some(options))
            .filter_map(|message| async move {
                match message {
                    Ok(message) => runtime_event(message).map(Ok),
                    Err(e) => Some(Err(map_error(e))),
                }
            })
            .boxed()
    }
}

fn runtime_event(message: EventMessage) -> Option<RuntimeEvent> {
    if let Some(typ) = message.typ {
        if typ != EventMessageTypeEnum::CONTAINER {
            return None;
        }
    }

    let id = message.actor.and_then(|actor| actor.id)?;
    let Some(action) = message.action else {
        debug!("DOCKER | dropping event without action id={id}");
        return None;
    };

    Some(RuntimeEvent {
        id,
        kind: EventKind::parse(&action),
        time: message.time.unwrap_or_default(),
    })
}

fn map_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}
