/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    io::Write,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

/// Mirrors backend-side traffic to a pair of timestamped files. A mirror
/// that fails to write is dropped; the proxied session itself is never
/// affected.
pub struct Rawlog {
    input: Option<std::fs::File>,
    output: Option<std::fs::File>,
}

impl Rawlog {
    pub fn create(dir: &Path) -> Option<Rawlog> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        let base = dir.join(format!("{}.{}", stamp, std::process::id()));
        let input = std::fs::File::create(base.with_extension("in"));
        let output = std::fs::File::create(base.with_extension("out"));
        match (input, output) {
            (Ok(input), Ok(output)) => Some(Rawlog {
                input: Some(input),
                output: Some(output),
            }),
            (input, output) => {
                let err = input.err().or_else(|| output.err());
                tracing::warn!(
                    context = "proxy",
                    event = "rawlog-create-failed",
                    dir = %dir.display(),
                    reason = %err.map(|e| e.to_string()).unwrap_or_default(),
                );
                None
            }
        }
    }

    pub(crate) fn record_read(&mut self, data: &[u8]) {
        if let Some(file) = self.input.as_mut() {
            if file.write_all(data).is_err() {
                self.input = None;
            }
        }
    }

    pub(crate) fn record_write(&mut self, data: &[u8]) {
        if let Some(file) = self.output.as_mut() {
            if file.write_all(data).is_err() {
                self.output = None;
            }
        }
    }
}
