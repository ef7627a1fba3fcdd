use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    "build/{version}".into()
}

fn default_results_dir() -> String {
    "results".into()
}

fn default_output_dir() -> String {
    "combined_results".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    // `{version}` expands to the version being rebuilt.
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    // Defaults to the output dir so history is published with the reports.
    pub history_dir: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            results_dir: default_results_dir(),
            output_dir: default_output_dir(),
            history_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub results_dir: PathBuf,
    pub output_dir: PathBuf,
    pub history_dir: PathBuf,
}

impl WorkspacePaths {
    /// `bin/` of the OpenWrt tree the external build writes into.
    pub fn bin_dir(&self) -> PathBuf {
        self.build_dir.join("bin")
    }

    /// Per-run output: `results/<version>[/<code>]/<arch>/<subtarget>`.
    pub fn run_results_dir(&self, version_key: &str, target: &str) -> Result<PathBuf> {
        let mut out = self.results_dir.clone();
        for seg in version_key.split('/').chain(target.split('/')) {
            let seg = seg.trim();
            if seg.is_empty() {
                continue;
            }
            validate_segment(seg)?;
            out = out.join(seg);
        }
        Ok(out)
    }
}

fn validate_segment(seg: &str) -> Result<()> {
    if seg == "." || seg == ".." || seg.contains('\\') {
        return Err(Error::msg(format!("invalid path segment '{}'", seg)));
    }
    Ok(())
}

pub fn load_paths(cfg: &WorkspaceConfig, version: &str) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    load_paths_from(&cwd, cfg, version)
}

pub fn load_paths_from(base: &Path, cfg: &WorkspaceConfig, version: &str) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir.replace("{version}", version))?;
    let results_dir = resolve_user_dir(&root, &cfg.results_dir)?;
    let output_dir = resolve_user_dir(&root, &cfg.output_dir)?;
    let history_dir = match cfg.history_dir.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => resolve_user_dir(&root, raw)?,
        _ => output_dir.clone(),
    };
    Ok(WorkspacePaths {
        root,
        build_dir,
        results_dir,
        output_dir,
        history_dir,
    })
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove(root: &Path, target: &Path) -> Result<()> {
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let target_can = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf());
    if !target_can.starts_with(&root_can) || target_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside '{}')",
            target_can.display(),
            root_can.display()
        )));
    }
    let res = if target_can.is_dir() {
        fs::remove_dir_all(&target_can)
    } else {
        fs::remove_file(&target_can)
    };
    res.map_err(|e| Error::msg(format!("failed to remove {}: {e}", target_can.display())))
}

/// Drop diffoscope reports and stored artifact pairs left over from the
/// previous publication of a version. Every file in `diffoscope/` and every
/// top-level directory in `artifacts/` counts as one removed entry. The
/// output dir and both subdirectories are kept.
pub fn cleanup_old_artifacts(output_dir: &Path) -> Result<usize> {
    let mut removed = 0usize;

    let diffoscope = output_dir.join("diffoscope");
    if diffoscope.is_dir() {
        for entry in read_dir_sorted(&diffoscope)? {
            if entry.is_file() {
                safe_remove(output_dir, &entry)?;
                removed += 1;
            }
        }
    }

    let artifacts = output_dir.join("artifacts");
    if artifacts.is_dir() {
        for entry in read_dir_sorted(&artifacts)? {
            if entry.is_dir() {
                safe_remove(output_dir, &entry)?;
                removed += 1;
            }
        }
    }

    debug!(removed, dir = %output_dir.display(), "cleaned previous artifacts");
    Ok(removed)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let rd = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read dir {}: {e}", dir.display())))?;
    let mut out = Vec::new();
    for entry in rd {
        let entry =
            entry.map_err(|e| Error::msg(format!("failed to read dir {}: {e}", dir.display())))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}
