// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic batched forwarding of buffered stream lines.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::sinks::{StreamRecord, StreamSink};
use crate::state::MonitorState;

#[derive(Debug, Default)]
pub struct ForwarderStats {
    batches: AtomicU64,
    records_submitted: AtomicU64,
    records_failed: AtomicU64,
    records_dropped: AtomicU64,
    transport_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStatsSnapshot {
    pub batches: u64,
    /// Records accepted for submission by the stream service
    pub records_submitted: u64,
    /// Records the stream service reported as failed
    pub records_failed: u64,
    /// Records lost with a batch rejected at the transport level
    pub records_dropped: u64,
    pub transport_errors: u64,
}

impl ForwarderStats {
    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            records_submitted: self.records_submitted.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of forwarding one stream's batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub stream: String,
    pub records: usize,
    pub failed: usize,
    pub transport_error: bool,
}

/// `<unix-nanos>-<sequence>` keys, unique within the process even for
/// records created in the same nanosecond.
#[derive(Debug, Default)]
struct PartitionKeys {
    seq: AtomicU64,
}

impl PartitionKeys {
    fn next(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos}-{seq}")
    }
}

/// Destination of the forwarder's failure lines, usually
/// [`Monitor::log_system`](crate::monitor::Monitor::log_system).
pub type SystemLog = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Forwarder {
    state: Arc<MonitorState>,
    sink: Arc<dyn StreamSink>,
    interval: Duration,
    keys: PartitionKeys,
    stats: Arc<ForwarderStats>,
    system_log: Option<SystemLog>,
}

impl Forwarder {
    pub fn new(state: Arc<MonitorState>, sink: Arc<dyn StreamSink>, interval: Duration) -> Self {
        Self {
            state,
            sink,
            interval,
            keys: PartitionKeys::default(),
            stats: Arc::new(ForwarderStats::default()),
            system_log: None,
        }
    }

    /// Sends partial-failure and transport-error lines to `system_log`
    /// instead of the local log only.
    #[must_use]
    pub fn with_system_log(mut self, system_log: SystemLog) -> Self {
        self.system_log = Some(system_log);
        self
    }

    fn log_failure(&self, line: &str, transport: bool) {
        match &self.system_log {
            Some(system_log) => system_log(line),
            None if transport => error!("{line}"),
            None => warn!("{line}"),
        }
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Flushes every `interval` forever.
    pub async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }

    /// Submits at most one batch per stream with pending lines.
    pub async fn flush(&self) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();
        for stream in self.state.stream_names() {
            if let Some(lines) = self.state.drain(&stream) {
                outcomes.push(self.submit(stream, lines).await);
            }
        }
        outcomes
    }

    async fn submit(&self, stream: String, lines: Vec<Vec<u8>>) -> BatchOutcome {
        let records: Vec<StreamRecord> = lines
            .into_iter()
            .map(|data| StreamRecord {
                data,
                partition_key: self.keys.next(),
            })
            .collect();
        let count = records.len();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        match self.sink.put_batch(&stream, records).await {
            Ok(results) => {
                let failed: Vec<_> = results.iter().filter(|r| r.is_failure()).collect();
                self.stats
                    .records_submitted
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.stats
                    .records_failed
                    .fetch_add(failed.len() as u64, Ordering::Relaxed);

                if let Some(last) = failed.last() {
                    self.log_failure(
                        &format!(
                            "container stream_logs stream={stream} count#KinesisRecords={count} count#KinesisRecordsErrors={} err={:?}",
                            failed.len(),
                            last.error_message.as_deref().unwrap_or_default()
                        ),
                        false,
                    );
                } else {
                    debug!("container stream_logs stream={stream} count#KinesisRecords={count}");
                }

                BatchOutcome {
                    stream,
                    records: count,
                    failed: failed.len(),
                    transport_error: false,
                }
            }
            Err(e) => {
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_dropped
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.log_failure(
                    &format!(
                        "container stream_logs stream={stream} count#KinesisPutRecordsError=1 records={count} err={:?}",
                        e.to_string()
                    ),
                    true,
                );
                BatchOutcome {
                    stream,
                    records: count,
                    failed: 0,
                    transport_error: true,
                }
            }
        }
    }
}
