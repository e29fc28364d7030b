// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CloudWatch Logs per-container sink.
//!
//! Each opened sink owns a log stream named after the container id and a
//! background shipper task. Writes are queued on an unbounded channel and
//! shipped with `PutLogEvents` every few seconds, or as soon as a full batch
//! accumulates. Batches respect both the event count and the request size
//! limit, and oversized messages are split into several events. Closing the
//! sink ships what is left and stops the shipper.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::operation::create_log_stream::CreateLogStreamError;
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use aws_sdk_cloudwatchlogs::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::sinks::{ContainerMetadata, LogSink, LogSinkFactory, SinkMessage};

const SHIP_INTERVAL: Duration = Duration::from_secs(5);

/// PutLogEvents accepts at most this many events per call.
pub const MAX_BATCH_EVENTS: usize = 10_000;

/// PutLogEvents request size limit, counting each message plus
/// [`EVENT_OVERHEAD_BYTES`].
pub const MAX_BATCH_BYTES: usize = 1_048_576;

pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// Largest message of a single event. Longer messages are split.
pub const MAX_EVENT_BYTES: usize = 262_144 - EVENT_OVERHEAD_BYTES;

type Event = (i64, String);

fn event_size(message: &str) -> usize {
    message.len() + EVENT_OVERHEAD_BYTES
}

/// Splits a message into parts of at most [`MAX_EVENT_BYTES`], cutting on
/// char boundaries.
pub fn split_message(message: String) -> Vec<String> {
    if message.len() <= MAX_EVENT_BYTES {
        return vec![message];
    }

    let mut parts = Vec::with_capacity(message.len() / MAX_EVENT_BYTES + 1);
    let mut rest = message.as_str();
    while !rest.is_empty() {
        let mut end = MAX_EVENT_BYTES.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (part, tail) = rest.split_at(end);
        parts.push(part.to_string());
        rest = tail;
    }
    parts
}

/// Groups events, in order, into batches within both the event count and
/// the byte limit of one PutLogEvents call.
pub fn batch_events(events: Vec<Event>) -> Vec<Vec<Event>> {
    let mut batches = Vec::new();
    let mut batch: Vec<Event> = Vec::new();
    let mut bytes = 0;

    for event in events {
        let size = event_size(&event.1);
        let full = batch.len() >= MAX_BATCH_EVENTS || bytes + size > MAX_BATCH_BYTES;
        if full && !batch.is_empty() {
            batches.push(std::mem::take(&mut batch));
            bytes = 0;
        }
        bytes += size;
        batch.push(event);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[derive(Debug, Clone)]
pub struct CloudWatchLogSinkFactory {
    client: Client,
}

impl CloudWatchLogSinkFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the default AWS credential and region chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl LogSinkFactory for CloudWatchLogSinkFactory {
    async fn open(
        &self,
        container: &ContainerMetadata,
        group: &str,
    ) -> Result<Arc<dyn LogSink>, SinkError> {
        let stream = container.id.clone();

        let created = self
            .client
            .create_log_stream()
            .log_group_name(group)
            .log_stream_name(&stream)
            .send()
            .await;

        if let Err(e) = created {
            let exists = matches!(
                e.as_service_error(),
                Some(CreateLogStreamError::ResourceAlreadyExistsException(_))
            );
            if !exists {
                return Err(SinkError::Open(DisplayErrorContext(&e).to_string()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shipper = Shipper {
            client: self.client.clone(),
            group: group.to_string(),
            stream,
            rx,
        };
        tokio::spawn(shipper.run());

        Ok(Arc::new(CloudWatchLogSink { tx }))
    }
}

#[derive(Debug)]
enum ShipperCommand {
    Event { timestamp_ms: i64, message: String },
    Close(oneshot::Sender<Result<(), SinkError>>),
}

/// Handle to an open log stream
#[derive(Debug, Clone)]
pub struct CloudWatchLogSink {
    tx: mpsc::UnboundedSender<ShipperCommand>,
}

#[async_trait]
impl LogSink for CloudWatchLogSink {
    fn write(&self, message: SinkMessage) -> Result<(), SinkError> {
        self.tx
            .send(ShipperCommand::Event {
                timestamp_ms: message.timestamp.timestamp_millis(),
                message: String::from_utf8_lossy(&message.line).into_owned(),
            })
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&self) -> Result<(), SinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ShipperCommand::Close(done_tx))
            .map_err(|_| SinkError::Closed)?;
        done_rx
            .await
            .map_err(|e| SinkError::Close(format!("shipper stopped before closing: {e}")))?
    }
}

struct Shipper {
    client: Client,
    group: String,
    stream: String,
    rx: mpsc::UnboundedReceiver<ShipperCommand>,
}

impl Shipper {
    async fn run(mut self) {
        let mut pending = Pending::default();
        let mut ticker = interval(SHIP_INTERVAL);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ShipperCommand::Event { timestamp_ms, message }) => {
                        pending.push(timestamp_ms, message);
                        if pending.is_full() {
                            if let Err(e) = self.ship(&mut pending).await {
                                warn!("CLOUDWATCH | group={} stream={} {e}", self.group, self.stream);
                            }
                        }
                    }
                    Some(ShipperCommand::Close(done)) => {
                        let result = self.ship(&mut pending).await;
                        if done.send(result).is_err() {
                            debug!("CLOUDWATCH | close requester went away stream={}", self.stream);
                        }
                        return;
                    }
                    None => {
                        if let Err(e) = self.ship(&mut pending).await {
                            warn!("CLOUDWATCH | group={} stream={} {e}", self.group, self.stream);
                        }
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.ship(&mut pending).await {
                        warn!("CLOUDWATCH | group={} stream={} {e}", self.group, self.stream);
                    }
                }
            }
        }
    }

    /// Ships and clears every pending event. Failed batches are dropped.
    async fn ship(&self, pending: &mut Pending) -> Result<(), SinkError> {
        let events = pending.take();
        if events.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        for chunk in batch_events(events) {
            let batch = chunk
                .into_iter()
                .map(|(ts, message)| {
                    InputLogEvent::builder()
                        .timestamp(ts)
                        .message(message)
                        .build()
                        .map_err(|e| SinkError::Write(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let sent = self
                .client
                .put_log_events()
                .log_group_name(&self.group)
                .log_stream_name(&self.stream)
                .set_log_events(Some(batch))
                .send()
                .await;

            if let Err(e) = sent {
                result = Err(SinkError::Write(DisplayErrorContext(&e).to_string()));
            }
        }
        result
    }
}

/// Events waiting for the next ship, with their PutLogEvents size
#[derive(Debug, Default)]
struct Pending {
    events: Vec<Event>,
    bytes: usize,
}

impl Pending {
    fn push(&mut self, timestamp_ms: i64, message: String) {
        for part in split_message(message) {
            self.bytes += event_size(&part);
            self.events.push((timestamp_ms, part));
        }
    }

    fn is_full(&self) -> bool {
        self.events.len() >= MAX_BATCH_EVENTS || self.bytes >= MAX_BATCH_BYTES
    }

    /// Takes every event in chronological order, as PutLogEvents requires.
    fn take(&mut self) -> Vec<Event> {
        self.bytes = 0;
        let mut events = std::mem::take(&mut self.events);
        events.sort_by_key(|(ts, _)| *ts);
        events
    }
}
