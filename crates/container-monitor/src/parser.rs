// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw container log lines into sink-ready lines.
//!
//! A raw line as produced by a timestamped log follow looks like
//!
//! ```text
//! 2024-01-02T03:04:05.123456789Z Hello from Docker.
//! ```
//!
//! and becomes, for a container with `PROCESS=web` and `RELEASE=RXZMCQEPDKO`,
//!
//! ```text
//! web:RXZMCQEPDKO/1d11a78279e0 Hello from Docker.
//! ```
//!
//! When the container names a stream, the same line is also queued for the
//! stream with a legacy `YYYY-MM-DD HH:MM:SS` prefix.

use chrono::{DateTime, Utc};

use crate::state::{ContainerEnv, ENV_APP};

const SHORT_ID_LEN: usize = 12;
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A raw line split into its runtime timestamp and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub timestamp: DateTime<Utc>,
    pub message: &'a str,
    /// Whether `timestamp` came from the line rather than receipt time
    pub timestamped: bool,
}

/// Output of routing one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedLine {
    /// Line for the per-container structured sink
    pub line: String,
    pub timestamp: DateTime<Utc>,
    pub app: Option<String>,
    /// Stream name and legacy formatted bytes for the stream buffer
    pub stream: Option<(String, Vec<u8>)>,
}

/// First 12 characters of a container id
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// Splits a leading RFC3339 timestamp off `raw`. Lines without a parseable
/// timestamp are kept whole and stamped with `received`.
pub fn parse_line(raw: &str, received: DateTime<Utc>) -> ParsedLine<'_> {
    if let Some((head, rest)) = raw.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
            return ParsedLine {
                timestamp: ts.with_timezone(&Utc),
                message: rest,
                timestamped: true,
            };
        }
    }

    ParsedLine {
        timestamp: received,
        message: raw,
        timestamped: false,
    }
}

/// Resolves the application name of a container.
///
/// `APP` wins. Otherwise the name is inferred from the log group (or the
/// stream) resource name by dropping its last two dash separated segments:
/// `convox-httpd-LogGroup-1KIJO8SS9F3Q9` gives `convox-httpd`.
pub fn resolve_app(env: &ContainerEnv) -> Option<String> {
    if let Some(app) = env.get(ENV_APP) {
        return Some(app.to_string());
    }

    let resource = env.log_group().or_else(|| env.stream())?;
    let parts: Vec<&str> = resource.split('-').collect();
    if parts.len() > 2 {
        Some(parts[..parts.len() - 2].join("-"))
    } else {
        None
    }
}

/// `<process>:<release>/<short-id> <message>`
pub fn format_line(id: &str, env: &ContainerEnv, message: &str) -> String {
    format!(
        "{}:{}/{} {}",
        env.process().unwrap_or_default(),
        env.release().unwrap_or_default(),
        short_id(id),
        message
    )
}

/// `<YYYY-MM-DD HH:MM:SS> <line>`
pub fn legacy_line(timestamp: DateTime<Utc>, line: &str) -> Vec<u8> {
    format!("{} {}", timestamp.format(LEGACY_TIMESTAMP_FORMAT), line).into_bytes()
}

/// `agent:<version>/<instance> <message>`
pub fn agent_line(version: &str, instance_id: &str, message: &str) -> String {
    format!("agent:{version}/{instance_id} {message}")
}

/// Parses a raw container line and resolves where it goes.
pub fn route(id: &str, env: &ContainerEnv, raw: &str, received: DateTime<Utc>) -> RoutedLine {
    let parsed = parse_line(raw, received);
    let line = format_line(id, env, parsed.message);
    routed(env, line, parsed.timestamp)
}

/// Routes an already formatted line, as used for synthetic app events.
pub fn routed(env: &ContainerEnv, line: String, timestamp: DateTime<Utc>) -> RoutedLine {
    let stream = env
        .stream()
        .map(|stream| (stream.to_string(), legacy_line(timestamp, &line)));

    RoutedLine {
        app: resolve_app(env),
        line,
        timestamp,
        stream,
    }
}
