// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory container registry and stream buffer.
//!
//! Both live behind one coarse lock. Every critical section is a plain map
//! operation; callers clone what they need (env snapshots, sink handles) and
//! release the lock before doing any I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sinks::LogSink;

/// Maximum number of lines returned by a single stream buffer drain.
pub const MAX_DRAIN_LINES: usize = 500;

pub const ENV_APP: &str = "APP";
pub const ENV_PROCESS: &str = "PROCESS";
pub const ENV_RELEASE: &str = "RELEASE";
pub const ENV_LOG_GROUP: &str = "LOG_GROUP";
pub const ENV_STREAM: &str = "KINESIS";
pub const ENV_SWAP: &str = "SWAP";

/// Launch-time environment of a container.
///
/// Captured once when the container is created and never refreshed. Empty
/// values are treated as absent by every accessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnv {
    vars: HashMap<String, String>,
}

impl ContainerEnv {
    /// Builds an env from `KEY=VALUE` entries as reported by the runtime.
    /// Entries without `=` are skipped; later duplicates win.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let vars = entries
            .into_iter()
            .filter_map(|entry| {
                entry
                    .as_ref()
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn process(&self) -> Option<&str> {
        self.get(ENV_PROCESS)
    }

    pub fn release(&self) -> Option<&str> {
        self.get(ENV_RELEASE)
    }

    pub fn log_group(&self) -> Option<&str> {
        self.get(ENV_LOG_GROUP)
    }

    /// Stream buffer destination for this container's lines
    pub fn stream(&self) -> Option<&str> {
        self.get(ENV_STREAM)
    }

    pub fn swap_enabled(&self) -> bool {
        self.get(ENV_SWAP) == Some("1")
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ContainerEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Registry entry for one container
struct ContainerRecord {
    env: Arc<ContainerEnv>,
    sink: Option<Arc<dyn LogSink>>,
}

/// Self-identification of the agent's own container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub image: String,
    pub version: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            id: "unknown".to_string(),
            image: "convox/agent:dev".to_string(),
            version: "dev".to_string(),
        }
    }
}

impl AgentIdentity {
    /// Identity for a container running the given agent image. The version is
    /// the image tag, or `dev` when the image is untagged.
    pub fn from_image(id: &str, image: &str) -> Self {
        let version = image
            .split_once(':')
            .map(|(_, tag)| tag.to_string())
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| "dev".to_string());
        Self {
            id: id.to_string(),
            image: image.to_string(),
            version,
        }
    }
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, ContainerRecord>,
    streams: HashMap<String, VecDeque<Vec<u8>>>,
    identity: AgentIdentity,
}

/// Shared monitor state: container registry, stream buffer and agent identity.
#[derive(Default)]
pub struct MonitorState {
    inner: Mutex<Inner>,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    // Critical sections never panic midway, so a poisoned lock still guards
    // consistent maps.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a container with its captured env. A re-registration keeps
    /// the existing sink handle.
    pub fn register(&self, id: &str, env: ContainerEnv) -> Arc<ContainerEnv> {
        let env = Arc::new(env);
        let mut inner = self.lock();
        let record = inner
            .containers
            .entry(id.to_string())
            .or_insert_with(|| ContainerRecord {
                env: Arc::clone(&env),
                sink: None,
            });
        record.env = Arc::clone(&env);
        env
    }

    pub fn env(&self, id: &str) -> Option<Arc<ContainerEnv>> {
        self.lock().containers.get(id).map(|r| Arc::clone(&r.env))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    /// Attaches a sink handle to a registered container. Returns the handle
    /// it replaced, which the caller is responsible for closing, or gives
    /// the new handle back when the container is unknown.
    pub fn attach_sink(
        &self,
        id: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<Option<Arc<dyn LogSink>>, Arc<dyn LogSink>> {
        match self.lock().containers.get_mut(id) {
            Some(record) => Ok(record.sink.replace(sink)),
            None => Err(sink),
        }
    }

    pub fn sink(&self, id: &str) -> Option<Arc<dyn LogSink>> {
        self.lock()
            .containers
            .get(id)
            .and_then(|r| r.sink.as_ref().map(Arc::clone))
    }

    /// Detaches the sink handle so it can be closed outside the lock.
    pub fn take_sink(&self, id: &str) -> Option<Arc<dyn LogSink>> {
        self.lock()
            .containers
            .get_mut(id)
            .and_then(|r| r.sink.take())
    }

    pub fn identity(&self) -> AgentIdentity {
        self.lock().identity.clone()
    }

    pub fn set_identity(&self, identity: AgentIdentity) {
        self.lock().identity = identity;
    }

    pub fn is_agent(&self, id: &str) -> bool {
        self.lock().identity.id == id
    }

    /// Appends a line at the tail of a stream's queue.
    pub fn push_line(&self, stream: &str, line: Vec<u8>) {
        self.lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .push_back(line);
    }

    /// Removes up to `MAX_DRAIN_LINES` lines from the head of a stream's
    /// queue, oldest first. Returns `None` when nothing is pending.
    pub fn drain(&self, stream: &str) -> Option<Vec<Vec<u8>>> {
        self.drain_up_to(stream, MAX_DRAIN_LINES)
    }

    pub fn drain_up_to(&self, stream: &str, max: usize) -> Option<Vec<Vec<u8>>> {
        let mut inner = self.lock();
        let queue = inner.streams.get_mut(stream)?;
        if queue.is_empty() || max == 0 {
            return None;
        }
        let n = queue.len().min(max);
        Some(queue.drain(..n).collect())
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.lock().streams.keys().cloned().collect()
    }

    pub fn pending(&self, stream: &str) -> usize {
        self.lock().streams.get(stream).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_env_from_entries() {
        let env = ContainerEnv::from_entries([
            "PROCESS=web",
            "RELEASE=RXZMCQEPDKO",
            "DATABASE_URL=postgres://u:p@host/db?sslmode=require",
            "MALFORMED",
            "EMPTY=",
        ]);
        assert_eq!(env.process(), Some("web"));
        assert_eq!(env.release(), Some("RXZMCQEPDKO"));
        assert_eq!(
            env.get("DATABASE_URL"),
            Some("postgres://u:p@host/db?sslmode=require")
        );
        assert_eq!(env.get("MALFORMED"), None);
        assert_eq!(env.get("EMPTY"), None);
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_swap_flag() {
        let env: ContainerEnv = [("SWAP", "1")].into_iter().collect();
        assert!(env.swap_enabled());
        let env: ContainerEnv = [("SWAP", "true")].into_iter().collect();
        assert!(!env.swap_enabled());
    }

    #[test]
    fn test_register_and_lookup() {
        let state = MonitorState::new();
        assert!(state.env("abc").is_none());

        state.register("abc", [("PROCESS", "web")].into_iter().collect());
        let env = state.env("abc").expect("env should be registered");
        assert_eq!(env.process(), Some("web"));
        assert!(state.is_registered("abc"));
        assert!(!state.is_registered("abd"));
    }

    #[test]
    fn test_identity_from_image() {
        let identity = AgentIdentity::from_image("f00", "goodeggs/convox-agent:0.71");
        assert_eq!(identity.version, "0.71");
        let identity = AgentIdentity::from_image("f00", "agent/agent");
        assert_eq!(identity.version, "dev");
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let state = MonitorState::new();
        for i in 0..1200 {
            state.push_line("stream", format!("line {i}").into_bytes());
        }

        let first = state.drain("stream").expect("lines pending");
        assert_eq!(first.len(), MAX_DRAIN_LINES);
        assert_eq!(first[0], b"line 0".to_vec());
        assert_eq!(first[499], b"line 499".to_vec());

        let second = state.drain("stream").expect("lines pending");
        assert_eq!(second.len(), MAX_DRAIN_LINES);
        assert_eq!(second[0], b"line 500".to_vec());

        let third = state.drain("stream").expect("lines pending");
        assert_eq!(third.len(), 200);
        assert_eq!(third[199], b"line 1199".to_vec());

        assert!(state.drain("stream").is_none());
        assert!(state.drain("unknown").is_none());
        assert_eq!(state.stream_names(), vec!["stream".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_drains_are_bounded_and_exhaust(count in 0usize..2000) {
            let state = MonitorState::new();
            for i in 0..count {
                state.push_line("s", i.to_string().into_bytes());
            }

            let mut seen = Vec::new();
            while let Some(batch) = state.drain("s") {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= MAX_DRAIN_LINES);
                seen.extend(batch);
            }

            prop_assert_eq!(seen.len(), count);
            for (i, line) in seen.iter().enumerate() {
                prop_assert_eq!(line, &i.to_string().into_bytes());
            }
            prop_assert_eq!(state.pending("s"), 0);
        }
    }
}
