// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of monitor collaborators for testing

use async_trait::async_trait;
use container_monitor::{
    error::{RuntimeError, SinkError},
    runtime::{
        ContainerDetail, ContainerRuntime, ContainerSummary, ListFilter, RuntimeEvent,
    },
    sinks::{
        ContainerMetadata, ErrorContext, ErrorReporter, HealthSink, LogSink, LogSinkFactory,
        RecordResult, SinkMessage, StreamRecord, StreamSink,
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type LogChunk = Result<Vec<u8>, RuntimeError>;
type EventItem = Result<RuntimeEvent, RuntimeError>;

fn receiver_stream<T: Send + 'static>(rx: UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Scripted container runtime.
///
/// Inspect answers are served from a per-container script first and fall
/// back to the registered detail (or `NotFound`). Every follow call consumes
/// one queued log session; with none queued the stream ends immediately.
#[derive(Default)]
pub struct MockRuntime {
    running: Mutex<Vec<ContainerSummary>>,
    exited: Mutex<Vec<ContainerSummary>>,
    list_error: Mutex<Option<RuntimeError>>,
    details: Mutex<HashMap<String, ContainerDetail>>,
    inspect_script: Mutex<HashMap<String, VecDeque<Result<ContainerDetail, RuntimeError>>>>,
    sessions: Mutex<HashMap<String, VecDeque<UnboundedReceiver<LogChunk>>>>,
    inspect_calls: Mutex<HashMap<String, usize>>,
    follow_calls: Mutex<HashMap<String, usize>>,
    events: Mutex<Option<UnboundedReceiver<EventItem>>>,
}

#[allow(dead_code)]
impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_running(&self, detail: ContainerDetail) {
        self.running.lock().unwrap().push(ContainerSummary {
            id: detail.id.clone(),
            image: detail.config_image.clone(),
        });
        self.set_detail(detail);
    }

    pub fn add_exited(&self, detail: ContainerDetail) {
        self.exited.lock().unwrap().push(ContainerSummary {
            id: detail.id.clone(),
            image: detail.config_image.clone(),
        });
        self.set_detail(detail);
    }

    pub fn fail_listing(&self, error: RuntimeError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    pub fn set_detail(&self, detail: ContainerDetail) {
        self.details
            .lock()
            .unwrap()
            .insert(detail.id.clone(), detail);
    }

    /// Queues the answer of the next unanswered inspect call for `id`.
    pub fn script_inspect(&self, id: &str, answer: Result<ContainerDetail, RuntimeError>) {
        self.inspect_script
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(answer);
    }

    /// Queues a log session that yields `chunks` and then ends.
    pub fn script_logs(&self, id: &str, chunks: Vec<LogChunk>) {
        let tx = self.script_log_channel(id);
        for chunk in chunks {
            let _ = tx.send(chunk);
        }
    }

    /// Queues a log session fed by the returned sender. The session ends when
    /// the sender is dropped.
    pub fn script_log_channel(&self, id: &str) -> UnboundedSender<LogChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    /// Returns the sender feeding `subscribe_events`. Dropping it ends the
    /// event feed.
    pub fn event_feed(&self) -> UnboundedSender<EventItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn inspect_calls(&self, id: &str) -> usize {
        self.inspect_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn follow_calls(&self, id: &str) -> usize {
        self.follow_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if let Some(error) = self.list_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(match filter {
            ListFilter::Running => self.running.lock().unwrap().clone(),
            ListFilter::Exited => self.exited.lock().unwrap().clone(),
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        *self
            .inspect_calls
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;

        let scripted = self
            .inspect_script
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);
        if let Some(answer) = scripted {
            return answer;
        }

        self.details
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn follow_logs(&self, id: &str, _since: i64) -> BoxStream<'static, LogChunk> {
        *self
            .follow_calls
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;

        let session = self
            .sessions
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);
        match session {
            Some(rx) => receiver_stream(rx),
            None => stream::empty().boxed(),
        }
    }

    fn subscribe_events(&self) -> BoxStream<'static, EventItem> {
        match self.events.lock().unwrap().take() {
            Some(rx) => receiver_stream(rx),
            None => stream::empty().boxed(),
        }
    }
}

/// Log sink recording every written line
#[derive(Default)]
pub struct MockLogSink {
    lines: Mutex<Vec<String>>,
    closes: AtomicUsize,
    close_delay: Duration,
}

#[allow(dead_code)]
impl MockLogSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for MockLogSink {
    fn write(&self, message: SinkMessage) -> Result<(), SinkError> {
        let line = String::from_utf8(message.line).map_err(|e| SinkError::Write(e.to_string()))?;
        self.lines.lock().unwrap().push(line);
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLogSinkFactory {
    opened: Mutex<Vec<(String, String)>>,
    sinks: Mutex<HashMap<String, Vec<Arc<MockLogSink>>>>,
    failing: Mutex<HashSet<String>>,
    close_delay: Mutex<Duration>,
}

#[allow(dead_code)]
impl MockLogSinkFactory {
    /// `(container id, log group)` of every successful open, in order
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }

    /// Most recently opened sink of a container
    pub fn sink(&self, id: &str) -> Option<Arc<MockLogSink>> {
        self.sinks_of(id).pop()
    }

    /// Every sink opened for a container, oldest first
    pub fn sinks_of(&self, id: &str) -> Vec<Arc<MockLogSink>> {
        self.sinks.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    /// Makes every sink opened from now on take `delay` to close.
    pub fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub fn fail_open(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl LogSinkFactory for MockLogSinkFactory {
    async fn open(
        &self,
        container: &ContainerMetadata,
        group: &str,
    ) -> Result<Arc<dyn LogSink>, SinkError> {
        if self.failing.lock().unwrap().contains(&container.id) {
            return Err(SinkError::Open(format!("{group} unavailable")));
        }
        let sink = Arc::new(MockLogSink {
            close_delay: *self.close_delay.lock().unwrap(),
            ..Default::default()
        });
        self.opened
            .lock()
            .unwrap()
            .push((container.id.clone(), group.to_string()));
        self.sinks
            .lock()
            .unwrap()
            .entry(container.id.clone())
            .or_default()
            .push(Arc::clone(&sink));
        Ok(sink)
    }
}

/// Stream sink failing the records at the given batch positions
#[derive(Default)]
pub struct MockStreamSink {
    failing_positions: HashSet<usize>,
    batches: Mutex<Vec<(String, Vec<StreamRecord>)>>,
}

#[allow(dead_code)]
impl MockStreamSink {
    pub fn failing_at(positions: &[usize]) -> Self {
        Self {
            failing_positions: positions.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<(String, Vec<StreamRecord>)> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamSink for MockStreamSink {
    async fn put_batch(
        &self,
        stream: &str,
        records: Vec<StreamRecord>,
    ) -> Result<Vec<RecordResult>, SinkError> {
        let results = (0..records.len())
            .map(|i| {
                if self.failing_positions.contains(&i) {
                    RecordResult::failed(
                        "ProvisionedThroughputExceededException",
                        "Rate exceeded for shard",
                    )
                } else {
                    RecordResult::ok()
                }
            })
            .collect();
        self.batches
            .lock()
            .unwrap()
            .push((stream.to_string(), records));
        Ok(results)
    }
}

#[derive(Default)]
pub struct MockReporter {
    reports: Mutex<Vec<(String, ErrorContext)>>,
}

#[allow(dead_code)]
impl MockReporter {
    pub fn errors(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(error, _)| error.clone())
            .collect()
    }

    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(_, context)| context.clone())
            .collect()
    }
}

impl ErrorReporter for MockReporter {
    fn report(&self, error: &str, context: &ErrorContext) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), context.clone()));
    }
}

#[derive(Default)]
pub struct MockHealth {
    marked: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockHealth {
    pub fn marked(&self) -> Vec<String> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthSink for MockHealth {
    async fn mark_unhealthy(&self, instance_id: &str) -> Result<(), SinkError> {
        self.marked.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}
