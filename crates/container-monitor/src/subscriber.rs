// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-container log subscription.
//!
//! A subscription cycles through connecting, streaming and reconciling until
//! the container is known to be gone:
//!
//! - the follower pipes the runtime's log stream into an in-memory duplex
//!   pipe and, once the stream ends, closes the pipe and signals completion;
//! - the reader splits the pipe into lines and forwards each of them;
//! - when both halves are done the container is inspected again to decide
//!   between reconnecting and closing the subscription.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::monitor::{incr, Monitor};
use crate::runtime::ContainerDetail;
use crate::sinks::LogSink;

const PIPE_CAPACITY: usize = 64 * 1024;

/// What a subscription does after its log stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// The container still runs: follow its logs again.
    Reconnect,
    /// The container exited: close the subscription.
    Close,
    /// The container no longer exists: report and close the subscription.
    Gone(RuntimeError),
    /// The container state is unknown: report and follow its logs again.
    Retry(RuntimeError),
}

pub fn reconcile(inspected: Result<ContainerDetail, RuntimeError>) -> Reconcile {
    match inspected {
        Ok(container) if container.running => Reconcile::Reconnect,
        Ok(_) => Reconcile::Close,
        Err(e) if e.is_not_found() => Reconcile::Gone(e),
        Err(e) => Reconcile::Retry(e),
    }
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.min,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

pub struct LogSubscriber {
    monitor: Arc<Monitor>,
    id: String,
    backoff: Backoff,
}

impl LogSubscriber {
    pub fn new(monitor: Arc<Monitor>, id: &str) -> Self {
        let backoff = Backoff::new(
            monitor.config.logs_retry_backoff_min,
            monitor.config.logs_retry_backoff_max,
        );
        Self {
            monitor,
            id: id.to_string(),
            backoff,
        }
    }

    /// Runs the subscription until the container exits or disappears, then
    /// closes the container's log sink.
    ///
    /// A start refused while the sink is being handed off resumes the loop
    /// with the same sink instead of closing it.
    pub async fn run(mut self) {
        let id = self.id.clone();
        self.monitor
            .log_system(&format!("container subscribe_logs at=start id={id}"));
        self.monitor.ensure_sink(&id).await;

        loop {
            self.monitor.supervisor.clear_restart(&id);
            let forwarded = self.stream_once().await;

            let inspected = self.monitor.runtime.inspect_container(&id).await;
            let finished = match reconcile(inspected) {
                Reconcile::Reconnect => {
                    incr(&self.monitor.counters.logs_retries);
                    self.monitor.log_system(&format!(
                        "container subscribe_logs id={id} running=true count#DockerLogsRetry=1"
                    ));
                    if forwarded > 0 {
                        self.backoff.reset();
                    } else {
                        tokio::time::sleep(self.backoff.next_delay()).await;
                    }
                    false
                }
                Reconcile::Close => {
                    self.monitor.log_system(&format!(
                        "container subscribe_logs id={id} running=false"
                    ));
                    true
                }
                Reconcile::Gone(e) => {
                    self.monitor.report_error(&e);
                    true
                }
                Reconcile::Retry(e) => {
                    incr(&self.monitor.counters.inspect_errors);
                    incr(&self.monitor.counters.logs_retries);
                    self.monitor.log_system(&format!(
                        "container subscribe_logs id={id} inspect_container count#DockerInspectError=1 count#DockerLogsRetry=1 err={:?}",
                        e.to_string()
                    ));
                    self.monitor.report_error(&e);
                    tokio::time::sleep(self.backoff.next_delay()).await;
                    false
                }
            };
            if !finished {
                continue;
            }

            let sink = self.monitor.state.take_sink(&id);
            if self.monitor.supervisor.finish_subscription(&id) {
                self.close_sink(sink).await;
                break;
            }

            if let Some(sink) = sink {
                let replaced = match self.monitor.state.attach_sink(&id, sink) {
                    Ok(previous) => previous,
                    Err(orphan) => Some(orphan),
                };
                self.close_sink(replaced).await;
            }
            self.monitor
                .log_system(&format!("container subscribe_logs id={id} restarted=true"));
            self.backoff.reset();
        }

        self.monitor
            .log_system(&format!("container subscribe_logs at=end id={id}"));
    }

    /// Follows the log stream once. Returns the number of lines forwarded.
    async fn stream_once(&self) -> usize {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let done = CancellationToken::new();
        let since = chrono::Utc::now().timestamp();

        let ((), forwarded) = tokio::join!(
            self.follow(writer, since, done.clone()),
            self.read_lines(reader, done),
        );
        forwarded
    }

    async fn follow(&self, mut writer: DuplexStream, since: i64, done: CancellationToken) {
        let id = &self.id;
        self.monitor
            .log_system(&format!("container follow_logs at=start id={id} since={since}"));

        let mut logs = self.monitor.runtime.follow_logs(id, since);
        while let Some(chunk) = logs.next().await {
            let written = match chunk {
                Ok(bytes) => writer.write_all(&bytes).await,
                Err(e) => {
                    incr(&self.monitor.counters.logs_errors);
                    self.monitor.log_system(&format!(
                        "container follow_logs id={id} count#DockerLogsError=1 err={:?}",
                        e.to_string()
                    ));
                    break;
                }
            };
            if let Err(e) = written {
                self.monitor.log_system(&format!(
                    "container follow_logs id={id} pipe.write err={:?}",
                    e.to_string()
                ));
                break;
            }
        }

        if let Err(e) = writer.shutdown().await {
            self.monitor.log_system(&format!(
                "container follow_logs id={id} pipe.close err={:?}",
                e.to_string()
            ));
        }
        drop(writer);
        done.cancel();

        self.monitor
            .log_system(&format!("container follow_logs at=end id={id}"));
    }

    async fn read_lines(&self, reader: DuplexStream, done: CancellationToken) -> usize {
        let id = &self.id;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut forwarded = 0;

        loop {
            buf.clear();
            tokio::select! {
                biased;
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(strip_newline(&buf));
                        self.monitor.forward_line(id, &line);
                        forwarded += 1;
                    }
                    Err(e) => {
                        self.monitor.log_system(&format!(
                            "container read_lines id={id} err={:?}",
                            e.to_string()
                        ));
                        break;
                    }
                },
                () = done.cancelled() => break,
            }
        }

        self.monitor.log_system(&format!(
            "container read_lines at=end id={id} lines={forwarded}"
        ));
        forwarded
    }

    async fn close_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        let id = &self.id;
        let Some(sink) = sink else {
            return;
        };
        match sink.close().await {
            Ok(()) => self
                .monitor
                .log_system(&format!("container subscribe_logs id={id} sink.close")),
            Err(e) => {
                self.monitor.log_system(&format!(
                    "container subscribe_logs id={id} sink.close err={:?}",
                    e.to_string()
                ));
                self.monitor.report_error(&e);
            }
        }
    }
}

fn strip_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
