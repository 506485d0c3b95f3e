//! Per-account sync progress persisted between runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Success,
    /// Ran, but some mail was left unprocessed
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    #[serde(default)]
    pub backfill_complete: bool,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            backfill_complete: false,
            last_synced: None,
            status: SyncStatus::Pending,
            last_error: None,
        }
    }
}

/// Sync state keyed by account name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    accounts: BTreeMap<String, AccountState>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl SyncState {
    /// Load from disk; a missing file is a fresh state.
    pub fn load(path: &Path) -> Result<Self> {
        let mut state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read sync state {}", path.display()))?;
            serde_json::from_str::<SyncState>(&content)
                .with_context(|| format!("Failed to parse sync state {}", path.display()))?
        } else {
            tracing::debug!("No sync state at {}, starting fresh", path.display());
            SyncState::default()
        };

        state.path = Some(path.to_path_buf());
        Ok(state)
    }

    /// Write to a temp file next to the target, then rename over it.
    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Ok(())
    }

    pub fn get(&self, account_name: &str) -> Option<&AccountState> {
        self.accounts.get(account_name)
    }

    pub fn is_backfill_complete(&self, account_name: &str) -> bool {
        self.get(account_name)
            .map(|s| s.backfill_complete)
            .unwrap_or(false)
    }

    /// Start of the fetch window: the backfill window until an account has
    /// completed one successful sync. Afterwards the regular window, stretched
    /// back to the last successful sync when that is older, but never further
    /// than the backfill window.
    pub fn window_start(
        &self,
        account_name: &str,
        now: DateTime<Utc>,
        backfill_days: u32,
        fetch_hours: u32,
    ) -> DateTime<Utc> {
        let backfill_start = now - Duration::days(i64::from(backfill_days));
        let state = match self.get(account_name) {
            Some(s) if s.backfill_complete => s,
            _ => return backfill_start,
        };

        let regular_start = now - Duration::hours(i64::from(fetch_hours));
        match state.last_synced {
            Some(last) if last < regular_start => last.max(backfill_start),
            _ => regular_start,
        }
    }

    pub fn mark_success(&mut self, account_name: &str, at: DateTime<Utc>) {
        let entry = self.accounts.entry(account_name.to_string()).or_default();
        entry.backfill_complete = true;
        entry.last_synced = Some(at);
        entry.status = SyncStatus::Success;
        entry.last_error = None;
    }

    /// Record a run that left mail behind. Like a failure, neither the
    /// backfill flag nor `last_synced` moves, so the next run covers the same
    /// window again.
    pub fn mark_incomplete(&mut self, account_name: &str, reason: &str) {
        let entry = self.accounts.entry(account_name.to_string()).or_default();
        entry.status = SyncStatus::Partial;
        entry.last_error = Some(reason.to_string());
    }

    /// Record a failure; the backfill flag is left as it was so a failed
    /// first sync is retried with the full backfill window.
    pub fn mark_failure(&mut self, account_name: &str, error: &str) {
        let entry = self.accounts.entry(account_name.to_string()).or_default();
        entry.status = SyncStatus::Failed;
        entry.last_error = Some(error.to_string());
    }
}
