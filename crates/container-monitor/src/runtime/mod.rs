// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container runtime client abstraction.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

use crate::error::RuntimeError;
use crate::sinks::ContainerMetadata;

pub mod docker;

/// Which containers a listing should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Running,
    Exited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    /// Image id the container was created from
    pub image: String,
    /// Image name as given in the container config
    pub config_image: String,
    pub created: String,
    /// Raw `KEY=VALUE` environment entries
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

impl ContainerDetail {
    pub fn metadata(&self) -> ContainerMetadata {
        ContainerMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            entrypoint: self.path.clone(),
            args: self.args.clone(),
            image_id: self.image.clone(),
            image_name: self.config_image.clone(),
            created: self.created.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Lifecycle event kinds the monitor reacts to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Start,
    Stop,
    Die,
    Kill,
    Oom,
    Other(String),
}

impl EventKind {
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => EventKind::Create,
            "start" => EventKind::Start,
            "stop" => EventKind::Stop,
            "die" => EventKind::Die,
            "kill" => EventKind::Kill,
            "oom" => EventKind::Oom,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Create => "create",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Die => "die",
            EventKind::Kill => "kill",
            EventKind::Oom => "oom",
            EventKind::Other(other) => other,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub id: String,
    pub kind: EventKind,
    /// Unix seconds
    pub time: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// Follows timestamped stdout and stderr of a container from `since`
    /// (unix seconds) until the runtime closes the stream.
    fn follow_logs(&self, id: &str, since: i64) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

    /// Live container lifecycle events, in arrival order.
    fn subscribe_events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("create"), EventKind::Create);
        assert_eq!(EventKind::parse("oom"), EventKind::Oom);
        assert_eq!(
            EventKind::parse("exec_start: sh"),
            EventKind::Other("exec_start: sh".to_string())
        );
        assert_eq!(EventKind::Kill.to_string(), "kill");
    }

    #[test]
    fn test_metadata_from_detail() {
        let detail = ContainerDetail {
            id: "abcdef0123456789".to_string(),
            name: "/web.1".to_string(),
            config_image: "httpd:2.4".to_string(),
            env: vec!["PROCESS=web".to_string()],
            ..Default::default()
        };
        let metadata = detail.metadata();
        assert_eq!(metadata.id, detail.id);
        assert_eq!(metadata.image_name, "httpd:2.4");
        assert_eq!(metadata.env, vec!["PROCESS=web".to_string()]);
    }
}
