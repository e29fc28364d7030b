// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container lifecycle handlers.

use std::path::Path;
use std::sync::Arc;

use crate::cgroups;
use crate::monitor::{incr, Monitor};
use crate::parser::short_id;
use crate::runtime::ContainerDetail;
use crate::state::ContainerEnv;
use crate::subscriber::LogSubscriber;

fn lifecycle_message(action: &str, env: Option<&ContainerEnv>, id: &str, suffix: &str) -> String {
    match env.and_then(ContainerEnv::process) {
        Some(process) => format!("{action} {process} process {}{suffix}", short_id(id)),
        None => format!("{action} process {}{suffix}", short_id(id)),
    }
}

impl Monitor {
    /// Captures the launch environment of a created (or already running)
    /// container and opens its structured log sink.
    ///
    /// Returns `false` when the container could not be inspected; it is then
    /// left unregistered.
    pub async fn handle_create(&self, id: &str) -> bool {
        self.log_system(&format!("container handle_create at=start id={id}"));

        let container = match self.runtime.inspect_container(id).await {
            Ok(container) => container,
            Err(e) => {
                incr(&self.counters.inspect_errors);
                self.log_system(&format!(
                    "container handle_create id={id} inspect_container count#DockerInspectError=1 err={:?}",
                    e.to_string()
                ));
                self.report_error(&e);
                return false;
            }
        };

        let env = self
            .state
            .register(id, ContainerEnv::from_entries(&container.env));

        self.open_sink("handle_create", id, &container, &env).await;

        self.log_app_event(id, &lifecycle_message("Starting", Some(&env), id, ""));
        true
    }

    /// Lifts memory limits when requested and starts log subscription.
    pub async fn handle_start(self: &Arc<Self>, id: &str) {
        self.log_system(&format!("container handle_start at=start id={id}"));

        if self.state.is_agent(id) {
            self.log_system(&format!("container handle_start id={id} agent=true"));
            return;
        }

        if let Some(env) = self.state.env(id) {
            if env.swap_enabled() {
                self.update_cgroups(id).await;
            }
            if env.log_group().is_some() {
                self.start_subscription(id);
            }
        }

        self.log_system(&format!("container handle_start at=end id={id}"));
    }

    pub fn handle_stop(&self, id: &str) {
        self.log_system(&format!("container handle_stop at=start id={id}"));
        let env = self.state.env(id);
        self.log_app_event(id, &lifecycle_message("Stopped", env.as_deref(), id, " via SIGTERM"));
    }

    pub fn handle_die(&self, id: &str) {
        self.log_system(&format!("container handle_die at=start id={id}"));
        let env = self.state.env(id);
        self.log_app_event(id, &lifecycle_message("Dead", env.as_deref(), id, ""));
    }

    pub fn handle_kill(&self, id: &str) {
        self.log_system(&format!("container handle_kill at=start id={id}"));
        let env = self.state.env(id);
        self.log_app_event(id, &lifecycle_message("Stopped", env.as_deref(), id, " via SIGKILL"));
    }

    pub fn handle_oom(&self, id: &str) {
        self.log_system(&format!("container handle_oom at=start id={id}"));
        let env = self.state.env(id);
        self.log_app_event(id, &lifecycle_message("Stopped", env.as_deref(), id, " due to OOM"));
    }

    /// Reopens the log sink of a registered container whose previous
    /// subscription already closed it.
    pub(crate) async fn ensure_sink(&self, id: &str) {
        if self.state.sink(id).is_some() {
            return;
        }
        let Some(env) = self.state.env(id) else {
            return;
        };
        if env.log_group().is_none() {
            return;
        }
        match self.runtime.inspect_container(id).await {
            Ok(container) => self.open_sink("subscribe_logs", id, &container, &env).await,
            Err(e) => {
                incr(&self.counters.inspect_errors);
                self.log_system(&format!(
                    "container subscribe_logs id={id} inspect_container count#DockerInspectError=1 err={:?}",
                    e.to_string()
                ));
                self.report_error(&e);
            }
        }
    }

    async fn open_sink(
        &self,
        step: &str,
        id: &str,
        container: &ContainerDetail,
        env: &ContainerEnv,
    ) {
        let Some(group) = env.log_group() else {
            return;
        };
        let process = env.process().unwrap_or_default();
        let sink = match self.log_sinks.open(&container.metadata(), group).await {
            Ok(sink) => sink,
            Err(e) => {
                self.log_system(&format!(
                    "container {step} open_sink log_group={group} process={process} err={:?}",
                    e.to_string()
                ));
                self.report_error(&e);
                return;
            }
        };
        self.log_system(&format!(
            "container {step} open_sink log_group={group} process={process}"
        ));
        let replaced = match self.state.attach_sink(id, sink) {
            Ok(previous) => previous,
            Err(orphan) => Some(orphan),
        };
        if let Some(replaced) = replaced {
            if let Err(e) = replaced.close().await {
                self.report_error(&e);
            }
        }
    }

    /// Starts the log subscription of a container unless one is live.
    pub fn start_subscription(self: &Arc<Self>, id: &str) -> bool {
        let subscriber = LogSubscriber::new(Arc::clone(self), id);
        let started = self.supervisor.spawn_subscription(id, subscriber.run());
        if !started {
            self.log_system(&format!(
                "container subscribe_logs id={id} already_subscribed=true"
            ));
        }
        started
    }

    async fn update_cgroups(&self, id: &str) {
        self.log_system(&format!("container update_cgroups at=start id={id}"));

        let failures = cgroups::disable_memory_limits(
            Path::new(&self.config.cgroup_memory_root),
            id,
            self.config.cgroup_setup_delay,
        )
        .await;

        for failure in failures {
            self.log_system(&format!(
                "container update_cgroups id={id} cgroup={} value={} err={:?}",
                failure.file,
                cgroups::UNLIMITED_BYTES,
                failure.error.to_string()
            ));
            self.report_error(format!("{}: {}", failure.path.display(), failure.error));
        }
    }
}
