// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared context of the container monitor.
//!
//! [`Monitor`] owns the registry/stream buffer state, the collaborators and
//! the task supervisor. Lifecycle handlers, log subscriptions and the event
//! dispatcher all run against an `Arc<Monitor>`.

use chrono::Utc;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, trace, warn};

use crate::config::AgentConfig;
use crate::parser::{self, RoutedLine};
use crate::runtime::ContainerRuntime;
use crate::sinks::{ErrorContext, ErrorReporter, HealthSink, LogSinkFactory, SinkMessage};
use crate::state::MonitorState;
use crate::supervisor::Supervisor;

/// External collaborators the monitor talks to
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub log_sinks: Arc<dyn LogSinkFactory>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub health: Arc<dyn HealthSink>,
}

#[derive(Debug, Default)]
pub struct MonitorCounters {
    pub inspect_errors: AtomicU64,
    pub logs_retries: AtomicU64,
    pub logs_errors: AtomicU64,
    pub sink_write_errors: AtomicU64,
    pub lines_forwarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub inspect_errors: u64,
    pub logs_retries: u64,
    pub logs_errors: u64,
    pub sink_write_errors: u64,
    pub lines_forwarded: u64,
}

impl MonitorCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            inspect_errors: self.inspect_errors.load(Ordering::Relaxed),
            logs_retries: self.logs_retries.load(Ordering::Relaxed),
            logs_errors: self.logs_errors.load(Ordering::Relaxed),
            sink_write_errors: self.sink_write_errors.load(Ordering::Relaxed),
            lines_forwarded: self.lines_forwarded.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Monitor {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) state: Arc<MonitorState>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) log_sinks: Arc<dyn LogSinkFactory>,
    reporter: Arc<dyn ErrorReporter>,
    health: Arc<dyn HealthSink>,
    pub(crate) supervisor: Supervisor,
    pub(crate) counters: MonitorCounters,
}

impl Monitor {
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        state: Arc<MonitorState>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state,
            runtime: collaborators.runtime,
            log_sinks: collaborators.log_sinks,
            reporter: collaborators.reporter,
            health: collaborators.health,
            supervisor: Supervisor::new(),
            counters: MonitorCounters::default(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<MonitorState> {
        &self.state
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Emits an agent-level system line and mirrors it to the agent's own
    /// container sink when one is open.
    pub fn log_system(&self, message: &str) {
        info!("{message}");

        let identity = self.state.identity();
        if let Some(sink) = self.state.sink(&identity.id) {
            let line = parser::agent_line(&identity.version, &self.config.instance_id, message);
            let written = sink.write(SinkMessage {
                container_id: identity.id,
                line: line.into_bytes(),
                timestamp: Utc::now(),
            });
            if let Err(e) = written {
                warn!("monitor log_system agent sink err={:?}", e.to_string());
            }
        }
    }

    /// Writes a synthetic application event for a container to its sink and
    /// stream, prefixed with the agent identity.
    pub fn log_app_event(&self, id: &str, message: &str) {
        let identity = self.state.identity();
        let line = parser::agent_line(&identity.version, &self.config.instance_id, message);
        let env = self.state.env(id).unwrap_or_default();
        self.deliver(id, parser::routed(&env, line, Utc::now()));
    }

    /// Parses one raw container log line and forwards it.
    pub fn forward_line(&self, id: &str, raw: &str) {
        let env = self.state.env(id).unwrap_or_default();
        let routed = parser::route(id, &env, raw, Utc::now());
        trace!(
            "container forward_line id={id} app={}",
            routed.app.as_deref().unwrap_or_default()
        );
        incr(&self.counters.lines_forwarded);
        self.deliver(id, routed);
    }

    fn deliver(&self, id: &str, routed: RoutedLine) {
        let RoutedLine {
            line,
            timestamp,
            stream,
            ..
        } = routed;

        if let Some(sink) = self.state.sink(id) {
            let written = sink.write(SinkMessage {
                container_id: id.to_string(),
                line: line.into_bytes(),
                timestamp,
            });
            if let Err(e) = written {
                incr(&self.counters.sink_write_errors);
                self.log_system(&format!(
                    "container forward_line id={id} sink.write count#SinkWriteError=1 err={:?}",
                    e.to_string()
                ));
            }
        }

        if let Some((stream, bytes)) = stream {
            self.state.push_line(&stream, bytes);
        }
    }

    /// Logs an error and hands it to the error reporter with host context.
    pub fn report_error(&self, error: impl Display) {
        let error = error.to_string();
        self.log_system(&format!("monitor report_error err={error:?}"));
        self.reporter.report(&error, &self.error_context());
    }

    fn error_context(&self) -> ErrorContext {
        let identity = self.state.identity();
        let mut context = ErrorContext::new();
        context.insert("agentId", identity.id);
        context.insert("agentImage", identity.image);
        context.insert("agentVersion", identity.version);
        context.insert("instanceId", self.config.instance_id.clone());
        if let Some(client_id) = &self.config.client_id {
            context.insert("clientId", client_id.clone());
        }
        if let Some(docker_host) = &self.config.docker_host {
            context.insert("dockerHost", docker_host.clone());
        }
        context.insert("development", self.config.development.to_string());
        context
    }

    /// Declares a subsystem unhealthy: reports the reason, escalates the
    /// instance health and forwards a kernel log dump for diagnosis.
    pub async fn set_unhealthy(&self, system: &str, reason: impl Display) {
        let reason = reason.to_string();
        let metric = format!("{}Error", ucfirst(system));
        self.log_system(&format!(
            "{system} ok=false count#{metric}=1 err={reason:?}"
        ));
        self.report_error(&reason);

        let instance_id = &self.config.instance_id;
        match self.health.mark_unhealthy(instance_id).await {
            Ok(()) => self.log_system(&format!(
                "who=\"agent\" what=\"marked instance {instance_id} unhealthy\" why=\"{system} {reason}\""
            )),
            Err(e) => self.log_system(&format!(
                "monitor mark_unhealthy count#AutoScalingSetInstanceHealthError=1 err={:?}",
                e.to_string()
            )),
        }

        match Command::new("dmesg").output().await {
            Ok(output) => {
                let mut dump = String::from_utf8_lossy(&output.stdout).into_owned();
                dump.push_str(&String::from_utf8_lossy(&output.stderr));
                self.report_error(dump);
            }
            Err(e) => self.report_error(e),
        }
    }
}

/// Uppercases the first character and lowercases the rest.
pub(crate) fn ucfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}
