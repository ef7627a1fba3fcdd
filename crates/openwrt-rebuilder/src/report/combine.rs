//! Merge run directories from many CI jobs with what was published before,
//! then advance the per-version history.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::DateTime;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::is_snapshot_version;
use crate::error::{Error, Result};
use crate::history::{BuildInfo, HistoryStore, HistoryUpdate, VersionHistory, split_version_key};
use crate::model::Stats;
use crate::report::output::{RBVF_FILE, RbvfDoc, RunOutput, STATS_FILE, load_output, write_output};
use crate::report::{ensure_dir, write_json_pretty};
use crate::workspace::cleanup_old_artifacts;

/// version key -> target -> run.
pub type CombinedData = BTreeMap<String, BTreeMap<String, RunOutput>>;

fn rel_segments(root: &Path, dir: &Path) -> Vec<String> {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str().map(str::to_string),
            _ => None,
        })
        .collect()
}

// Snapshot runs live at `.../<version>/<code>/<arch>/<subtarget>/stats.json`.
// Older stats.json files do not record the code, so recover it from the
// directory right above the target.
fn version_code_from_path(segments: &[String], version: &str, target: &str) -> Option<String> {
    if !is_snapshot_version(version) {
        return None;
    }
    let target_len = target.split('/').filter(|s| !s.is_empty()).count();
    if segments.len() < target_len + 2 {
        return None;
    }
    let (head, tail) = segments.split_at(segments.len() - target_len);
    let tail_matches = tail
        .iter()
        .map(String::as_str)
        .eq(target.split('/').filter(|s| !s.is_empty()));
    if !tail_matches {
        return None;
    }
    let code = head.last()?;
    let above = head.get(head.len().checked_sub(2)?)?;
    (above == version && code != version).then(|| code.clone())
}

/// Find every `stats.json` under `root` and load the run beside it.
/// `diffoscope/` subtrees are ignored; runs that fail to load are logged and
/// skipped.
pub fn collect_results(root: &Path) -> Result<CombinedData> {
    let mut out = CombinedData::new();
    if !root.is_dir() {
        return Ok(out);
    }

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || (e.file_name() != "diffoscope" && e.file_name() != "artifacts")
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walk error in {}: {e}", root.display())))?;
        if !entry.file_type().is_file() || entry.file_name() != STATS_FILE {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        debug!(path = %entry.path().display(), "found run");

        let mut run = match load_output(dir) {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping {}: {e}", entry.path().display());
                continue;
            }
        };
        if run.meta.version.is_empty() {
            run.meta.version = "unknown".into();
        }
        if run.meta.target.is_empty() {
            run.meta.target = "unknown".into();
        }
        if run.meta.version_code.is_none() {
            let segments = rel_segments(root, dir);
            run.meta.version_code =
                version_code_from_path(&segments, &run.meta.version, &run.meta.target);
        }

        let key = run.meta.version_key();
        let target = run.meta.target.clone();
        out.entry(key).or_default().insert(target, run);
    }
    Ok(out)
}

/// Runs in `new` replace runs in `existing` for the same version + target;
/// everything else in `existing` is kept.
pub fn merge_combined(mut new: CombinedData, existing: CombinedData) -> CombinedData {
    for (version, targets) in existing {
        let slot = new.entry(version).or_default();
        for (target, run) in targets {
            slot.entry(target).or_insert(run);
        }
    }
    new
}

pub fn combined_stats(data: &CombinedData) -> Stats {
    let mut s = Stats::default();
    for targets in data.values() {
        for run in targets.values() {
            s.add(&run.suite.stats());
        }
    }
    s
}

pub fn to_rbvf(data: &CombinedData) -> RbvfDoc {
    data.iter()
        .map(|(version, targets)| {
            (
                version.clone(),
                targets
                    .iter()
                    .map(|(t, run)| (t.clone(), run.suite.clone()))
                    .collect(),
            )
        })
        .collect()
}

// Latest generation time across a version key's targets.
fn run_timestamp(targets: &BTreeMap<String, RunOutput>) -> Option<String> {
    targets
        .values()
        .map(|run| run.meta.generated_at.trim())
        .filter(|t| !t.is_empty())
        .max_by_key(|t| (DateTime::parse_from_rfc3339(t).ok(), t.to_string()))
        .map(str::to_string)
}

/// Add one history point per version key in `data`, grouped under the
/// key's base version. Points of one base version are applied oldest
/// first (by run generation time) so the newest ends up at the head.
/// `fallback_timestamp` stamps runs that carry no generation time.
pub fn record_history(
    store: &HistoryStore,
    data: &CombinedData,
    build: &BuildInfo,
    fallback_timestamp: &str,
) -> Result<BTreeMap<String, VersionHistory>> {
    let mut grouped = BTreeMap::<String, Vec<HistoryUpdate>>::new();
    for (key, targets) in data {
        let (base, code) = split_version_key(key);
        let mut stats = Stats::default();
        let mut per_target = BTreeMap::new();
        for (target, run) in targets {
            let s = run.suite.stats();
            stats.add(&s);
            per_target.insert(target.clone(), s);
        }
        grouped.entry(base).or_default().push(HistoryUpdate {
            stats,
            targets: per_target,
            version_code: code,
            run_id: build.run_id.clone(),
            commit: build.commit.clone(),
            timestamp: run_timestamp(targets).unwrap_or_else(|| fallback_timestamp.to_string()),
        });
    }

    let mut out = BTreeMap::<String, VersionHistory>::new();
    for (base, mut updates) in grouped {
        updates.sort_by_cached_key(|u| {
            (
                DateTime::parse_from_rfc3339(&u.timestamp).ok(),
                u.timestamp.clone(),
            )
        });
        let history = store.record(&base, updates)?;
        if let Some(head) = history.latest() {
            debug!(
                version = %base,
                entries = history.entries.len(),
                head = head.version_code.as_deref().unwrap_or("-"),
                "updated history"
            );
        }
        out.insert(base, history);
    }
    Ok(out)
}

fn copy_diffoscope_reports(results_dir: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0usize;
    if !results_dir.is_dir() {
        return Ok(0);
    }
    for entry in WalkDir::new(results_dir).sort_by_file_name() {
        let entry = entry
            .map_err(|e| Error::msg(format!("walk error in {}: {e}", results_dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !name.ends_with(".html") || name == "index.html" {
            continue;
        }
        ensure_dir(dest)?;
        fs::copy(entry.path(), dest.join(name)).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                entry.path().display(),
                dest.display()
            ))
        })?;
        copied += 1;
    }
    Ok(copied)
}

/// Copy stored origin/rebuilt file pairs from
/// `<results>/artifacts/<category>/<artifact>/` to the same layout under
/// `dest`. Returns the number of artifact dirs copied.
pub fn copy_artifact_pairs(results_dir: &Path, dest: &Path) -> Result<usize> {
    let src = results_dir.join("artifacts");
    if !src.is_dir() {
        debug!("no artifacts dir in {}", results_dir.display());
        return Ok(0);
    }
    let mut copied = 0usize;
    for category in read_dirs(&src)? {
        let Some(category_name) = category.file_name() else {
            continue;
        };
        for artifact in read_dirs(&category)? {
            let Some(artifact_name) = artifact.file_name() else {
                continue;
            };
            let target = dest.join(category_name).join(artifact_name);
            ensure_dir(&target)?;
            for entry in WalkDir::new(&artifact).min_depth(1).max_depth(1).sort_by_file_name() {
                let entry = entry
                    .map_err(|e| Error::msg(format!("walk error in {}: {e}", artifact.display())))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let to = target.join(entry.file_name());
                fs::copy(entry.path(), &to).map_err(|e| {
                    Error::msg(format!(
                        "failed to copy {} -> {}: {e}",
                        entry.path().display(),
                        to.display()
                    ))
                })?;
            }
            copied += 1;
        }
    }
    Ok(copied)
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walk error in {}: {e}", dir.display())))?;
        if entry.file_type().is_dir() {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct CombineOptions {
    /// Remove the previous diffoscope reports and artifact pairs first.
    pub clean_previous: bool,
}

/// Collect new runs from `results_dir`, merge them over what is already in
/// `output_dir`, rewrite the merged layout, and record history for the new
/// runs. Returns overall stats across the merged data.
pub fn combine(
    results_dir: &Path,
    output_dir: &Path,
    store: &HistoryStore,
    build: &BuildInfo,
    opts: &CombineOptions,
) -> Result<Stats> {
    ensure_dir(output_dir)?;

    info!("checking for existing results in {}", output_dir.display());
    let existing = collect_results(output_dir)?;
    if !existing.is_empty() {
        info!("found {} existing version(s)", existing.len());
    }

    info!("collecting new results from {}", results_dir.display());
    let new = collect_results(results_dir)?;

    if new.is_empty() && existing.is_empty() {
        error!(
            "no results found in {} or {}",
            results_dir.display(),
            output_dir.display()
        );
        return Ok(Stats::default());
    }

    if opts.clean_previous && !new.is_empty() {
        let removed = cleanup_old_artifacts(output_dir)?;
        info!("removed {removed} previous artifact(s)");
    }
    let copied = copy_diffoscope_reports(results_dir, &output_dir.join("diffoscope"))?;
    let pairs = copy_artifact_pairs(results_dir, &output_dir.join("artifacts"))?;

    let timestamp = chrono::Utc::now().to_rfc3339();
    record_history(store, &new, build, &timestamp)?;

    let merged = merge_combined(new, existing);
    for targets in merged.values() {
        for run in targets.values() {
            let mut dir = output_dir.to_path_buf();
            for seg in run.meta.version_key().split('/').chain(run.meta.target.split('/')) {
                if !seg.is_empty() {
                    dir = dir.join(seg);
                }
            }
            write_output(&run.meta, &run.suite, &dir)?;
        }
    }
    write_json_pretty(&output_dir.join(RBVF_FILE), &to_rbvf(&merged))?;

    let stats = combined_stats(&merged);
    info!(
        "total: {} version(s), {} new diffoscope report(s), {} artifact pair(s)",
        merged.len(),
        copied,
        pairs
    );
    info!(
        "summary: {:.1}% GOOD ({}/{}) GOOD={} BAD={} UNKNOWN={}",
        stats.good_percent(),
        stats.good,
        stats.total(),
        stats.good,
        stats.bad,
        stats.unknown
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(raw: &str) -> Vec<String> {
        raw.split('/').map(str::to_string).collect()
    }

    #[test]
    fn code_recovered_only_for_snapshot_layout() {
        assert_eq!(
            version_code_from_path(&segs("SNAPSHOT/r28532-abc/x86/64"), "SNAPSHOT", "x86/64"),
            Some("r28532-abc".into())
        );
        assert_eq!(
            version_code_from_path(
                &segs("results-x86-64/SNAPSHOT/r1-a/x86/64"),
                "SNAPSHOT",
                "x86/64"
            ),
            Some("r1-a".into())
        );
        assert_eq!(
            version_code_from_path(&segs("SNAPSHOT/x86/64"), "SNAPSHOT", "x86/64"),
            None
        );
        assert_eq!(
            version_code_from_path(&segs("24.10.0/r1-a/x86/64"), "24.10.0", "x86/64"),
            None
        );
        assert_eq!(
            version_code_from_path(&segs("SNAPSHOT/r1-a/ath79/generic"), "SNAPSHOT", "x86/64"),
            None
        );
    }
}
