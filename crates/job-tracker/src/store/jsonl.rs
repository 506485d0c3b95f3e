use super::ApplicationStore;
use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use job_types::JobApplicationRecord;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Local JSON-lines file, one record per line.
///
/// Used when Google Sheets is disabled. A missing file is an empty store.
pub struct JsonLinesStore {
    path: PathBuf,
}

/// Only the key is needed to rebuild the known-id set
#[derive(Deserialize)]
struct KeyOnly {
    source_email_id: String,
}

/// A complete `"source_email_id": "..."` pair inside a damaged line
static RE_EMBEDDED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""source_email_id"\s*:\s*("(?:[^"\\]|\\.)*")"#).unwrap()
});

/// Ids still readable in a line that is not valid JSON, e.g. a write that was
/// cut short, or such a fragment with a later record glued onto it.
fn salvage_ids(line: &str) -> Vec<String> {
    RE_EMBEDDED_ID
        .captures_iter(line)
        .filter_map(|c| serde_json::from_str::<String>(&c[1]).ok())
        .collect()
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, action: &str, err: impl std::fmt::Display) -> TrackerError {
        TrackerError::store_unavailable(format!(
            "failed to {} {}: {}",
            action,
            self.path.display(),
            err
        ))
    }
}

#[async_trait]
impl ApplicationStore for JsonLinesStore {
    async fn list_known_ids(&self) -> Result<HashSet<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(self.unavailable("read", e)),
        };

        let mut ids = HashSet::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KeyOnly>(line) {
                Ok(row) => {
                    ids.insert(row.source_email_id);
                }
                Err(e) => {
                    let salvaged = salvage_ids(line);
                    tracing::warn!(
                        "Malformed line {} in {} ({}), recovered {} id(s)",
                        line_no + 1,
                        self.path.display(),
                        e,
                        salvaged.len()
                    );
                    ids.extend(salvaged);
                }
            }
        }

        Ok(ids)
    }

    async fn append_row(&self, record: &JobApplicationRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| self.unavailable("encode", e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.unavailable("open", e))?;

        // Start on a fresh line if an earlier write was cut short
        let len = file
            .metadata()
            .await
            .map_err(|e| self.unavailable("inspect", e))?
            .len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))
                .await
                .map_err(|e| self.unavailable("seek", e))?;
            file.read_exact(&mut last)
                .await
                .map_err(|e| self.unavailable("read", e))?;
            if last[0] != b'\n' {
                tracing::warn!("{} ends with a partial line", self.path.display());
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.unavailable("write", e))?;
        file.flush().await.map_err(|e| self.unavailable("flush", e))?;

        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.unavailable("create directory for", e))?;
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("JSON lines file {}", self.path.display())
    }
}
