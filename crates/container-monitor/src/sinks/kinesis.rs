// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use aws_sdk_kinesis::Client;
use tracing::debug;

use crate::error::SinkError;
use crate::sinks::{RecordResult, StreamRecord, StreamSink};

/// Kinesis `PutRecords` backed stream sink
#[derive(Debug, Clone)]
pub struct KinesisStreamSink {
    client: Client,
}

impl KinesisStreamSink {
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
impl StreamSink for KinesisStreamSink {
    async fn put_batch(
        &self,
        stream: &str,
        records: Vec<StreamRecord>,
    ) -> Result<Vec<RecordResult>, SinkError> {
        let entries = records
            .into_iter()
            .map(|record| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(record.data))
                    .partition_key(record.partition_key)
                    .build()
                    .map_err(|e| SinkError::Transport(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("KINESIS | put_records stream={stream} records={}", entries.len());

        let output = self
            .client
            .put_records()
            .stream_name(stream)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| SinkError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .records()
            .iter()
            .map(|r| RecordResult {
                error_code: r.error_code().map(String::from),
                error_message: r.error_message().map(String::from),
            })
            .collect())
    }
}
