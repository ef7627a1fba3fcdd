//! Bounded per-version time series of reproducibility stats.
//!
//! One `history.json` per logical version (`SNAPSHOT`, `24.10.0`, ...).
//! Snapshot builds carry a version code (`r28532-abc123`) that identifies a
//! specific build; re-publishing the same code replaces its point instead of
//! adding a new one.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::is_snapshot_version;
use crate::error::{Error, Result};
use crate::model::Stats;

pub const MAX_HISTORY_ENTRIES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub version_code: Option<String>,
    pub run_id: String,
    pub commit: String,
    pub stats: Stats,
    #[serde(default)]
    pub targets: BTreeMap<String, Stats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    pub version: String,
    #[serde(default)]
    pub entries: Vec<HistoryEntry>,
}

impl VersionHistory {
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            entries: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.first()
    }
}

/// Metadata of the CI run publishing a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub time: String,
    pub commit: String,
    pub branch: String,
    pub run_id: String,
}

impl BuildInfo {
    pub fn from_environment() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let or_unknown = |k: &str| {
            get(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "unknown".into())
        };
        let commit = or_unknown("GITHUB_SHA").chars().take(8).collect();
        Self {
            time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            commit,
            branch: or_unknown("GITHUB_REF_NAME"),
            run_id: or_unknown("GITHUB_RUN_ID"),
        }
    }
}

/// One new data point for [`update_history`].
#[derive(Debug, Clone)]
pub struct HistoryUpdate {
    pub stats: Stats,
    pub targets: BTreeMap<String, Stats>,
    pub version_code: Option<String>,
    pub run_id: String,
    pub commit: String,
    pub timestamp: String,
}

pub fn version_slug(version: &str) -> String {
    version.replace(['.', '/'], "_")
}

/// `SNAPSHOT/r28532-abc123` -> (`SNAPSHOT`, Some(`r28532-abc123`)).
/// Release keys never carry a code.
pub fn split_version_key(key: &str) -> (String, Option<String>) {
    if is_snapshot_version(key) {
        if let Some((base, code)) = key.split_once('/') {
            let code = code.trim();
            return (
                base.to_string(),
                (!code.is_empty()).then(|| code.to_string()),
            );
        }
    }
    (key.to_string(), None)
}

pub fn update_history(mut history: VersionHistory, update: HistoryUpdate) -> VersionHistory {
    let entry = HistoryEntry {
        timestamp: update.timestamp,
        version_code: update.version_code,
        run_id: update.run_id,
        commit: update.commit,
        stats: update.stats,
        targets: update.targets,
    };

    let existing = entry.version_code.as_deref().and_then(|code| {
        history
            .entries
            .iter()
            .position(|e| e.version_code.as_deref() == Some(code))
    });
    match existing {
        Some(pos) => history.entries[pos] = entry,
        None => history.entries.insert(0, entry),
    }
    history.entries.truncate(MAX_HISTORY_ENTRIES);
    history
}

/// Filesystem home of every version's history: `<root>/<slug>/history.json`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, version: &str) -> PathBuf {
        self.root.join(version_slug(version)).join("history.json")
    }

    /// Missing or unreadable history is not fatal: start over empty.
    pub fn load(&self, version: &str) -> VersionHistory {
        let p = self.path_for(version);
        if !p.is_file() {
            return VersionHistory::empty(version);
        }
        let parsed = fs::read_to_string(&p)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
            .and_then(|raw| {
                serde_json::from_str::<VersionHistory>(&raw)
                    .map_err(|e| Error::msg(format!("failed to parse {}: {e}", p.display())))
            });
        match parsed {
            Ok(mut h) => {
                h.version = version.to_string();
                h
            }
            Err(e) => {
                warn!("discarding history for {version}: {e}");
                VersionHistory::empty(version)
            }
        }
    }

    pub fn save(&self, history: &VersionHistory) -> Result<PathBuf> {
        let p = self.path_for(&history.version);
        let body = serde_json::to_string_pretty(history)
            .map_err(|e| Error::msg(format!("failed to encode history: {e}")))?;
        crate::report::atomic_write_text(&p, &body)?;
        debug!(path = %p.display(), entries = history.entries.len(), "saved history");
        Ok(p)
    }

    /// Load, apply `updates` in order (the newest last), and write back once.
    pub fn record(
        &self,
        version: &str,
        updates: impl IntoIterator<Item = HistoryUpdate>,
    ) -> Result<VersionHistory> {
        let history = updates
            .into_iter()
            .fold(self.load(version), update_history);
        self.save(&history)?;
        Ok(history)
    }
}
