// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracks the tasks spawned on behalf of each container.
//!
//! Handlers are fire-and-forget from the dispatcher's point of view but are
//! still recorded here so leaks can be observed. Subscriptions are unique per
//! container id: a second subscription for an id whose first one is still
//! alive is refused, and the live one is asked to keep following instead.
//! A subscription that has decided to stop releases its slot with
//! [`Supervisor::finish_subscription`] before its final cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

#[derive(Default)]
struct ContainerTasks {
    subscription: Option<JoinHandle<()>>,
    subscriptions_started: usize,
    restart_requested: bool,
    handlers: Vec<JoinHandle<()>>,
}

impl ContainerTasks {
    fn prune(&mut self) {
        self.handlers.retain(|h| !h.is_finished());
        if self.subscription.as_ref().is_some_and(JoinHandle::is_finished) {
            self.subscription = None;
        }
    }
}

#[derive(Default)]
pub struct Supervisor {
    tasks: Mutex<HashMap<String, ContainerTasks>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContainerTasks>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a lifecycle handler task for a container.
    pub fn spawn_handler<F>(&self, id: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.lock();
        let entry = tasks.entry(id.to_string()).or_default();
        entry.prune();
        entry.handlers.push(handle);
    }

    /// Spawns the log subscription of a container unless one is already
    /// running. Returns whether a task was spawned.
    pub fn spawn_subscription<F>(&self, id: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        let entry = tasks.entry(id.to_string()).or_default();
        entry.prune();
        if entry.subscription.is_some() {
            entry.restart_requested = true;
            return false;
        }
        entry.subscription = Some(tokio::spawn(task));
        entry.subscriptions_started += 1;
        entry.restart_requested = false;
        true
    }

    /// Drops restart requests that a new follow session already satisfies.
    pub fn clear_restart(&self, id: &str) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.restart_requested = false;
        }
    }

    /// Called by a subscription that is about to stop following a container.
    ///
    /// Returns `false` when a subscription was refused for the container in
    /// the meantime: the caller must keep following. Otherwise the slot is
    /// released, so the next start spawns a fresh subscription while this one
    /// finishes its cleanup as a plain handler task.
    pub fn finish_subscription(&self, id: &str) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(id) else {
            return true;
        };
        if std::mem::take(&mut entry.restart_requested) {
            return false;
        }
        if let Some(handle) = entry.subscription.take() {
            entry.handlers.push(handle);
        }
        true
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        let mut tasks = self.lock();
        match tasks.get_mut(id) {
            Some(entry) => {
                entry.prune();
                entry.subscription.is_some()
            }
            None => false,
        }
    }

    /// Number of subscriptions ever started for a container
    pub fn subscriptions_started(&self, id: &str) -> usize {
        self.lock().get(id).map_or(0, |e| e.subscriptions_started)
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut tasks = self.lock();
        tasks
            .values_mut()
            .map(|entry| {
                entry.prune();
                usize::from(entry.subscription.is_some())
            })
            .sum()
    }

    pub fn active_handlers(&self, id: &str) -> usize {
        let mut tasks = self.lock();
        tasks.get_mut(id).map_or(0, |entry| {
            entry.prune();
            entry.handlers.len()
        })
    }
}
