// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Effectively unlimited memory (u64::MAX)
pub const UNLIMITED_BYTES: &str = "18446744073709551615";

/// Memory limit files raised when a container opts into swap. The
/// memory+swap limit goes first so the plain limit never exceeds it.
pub const MEMORY_LIMIT_FILES: [&str; 3] = [
    "memory.memsw.limit_in_bytes",
    "memory.soft_limit_in_bytes",
    "memory.limit_in_bytes",
];

#[derive(Debug)]
pub struct CgroupWriteFailure {
    pub file: &'static str,
    pub path: PathBuf,
    pub error: io::Error,
}

/// Lifts the memory ceilings of a container's cgroup.
///
/// Waits `setup_delay` first: the cgroup directory of a container that just
/// started is not always materialized yet. Every file is attempted; the
/// failures are returned.
pub async fn disable_memory_limits(
    root: &Path,
    id: &str,
    setup_delay: Duration,
) -> Vec<CgroupWriteFailure> {
    if !setup_delay.is_zero() {
        tokio::time::sleep(setup_delay).await;
    }

    let dir = root.join(id);
    let mut failures = Vec::new();
    for file in MEMORY_LIMIT_FILES {
        let path = dir.join(file);
        if let Err(error) = tokio::fs::write(&path, UNLIMITED_BYTES).await {
            failures.push(CgroupWriteFailure { file, path, error });
        }
    }
    failures
}
