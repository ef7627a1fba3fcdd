//! Per-run report files: `stats.json`, `packages.json`, `images.json`, and
//! the older single-file `output.json` (RBVF) layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::{BuildResult, Results, Stats, Suite};
use crate::report::{ensure_dir, read_json, write_json_pretty};

pub const STATS_FILE: &str = "stats.json";
pub const PACKAGES_FILE: &str = "packages.json";
pub const IMAGES_FILE: &str = "images.json";
pub const RBVF_FILE: &str = "output.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMeta {
    pub target: String,
    pub version: String,
    pub version_code: Option<String>,
    pub generated_at: String,
}

impl OutputMeta {
    pub fn now(target: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            version: version.into(),
            version_code: None,
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_version_code(mut self, code: Option<String>) -> Self {
        self.version_code = code.filter(|c| !c.trim().is_empty());
        self
    }

    /// `SNAPSHOT/r28532-abc123` for coded snapshot builds, otherwise the
    /// plain version.
    pub fn version_key(&self) -> String {
        match &self.version_code {
            Some(code) => format!("{}/{}", self.version, code),
            None => self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_code: Option<String>,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub packages: Stats,
    #[serde(default)]
    pub images: Stats,
    #[serde(default)]
    pub totals: Stats,
}

impl RunStats {
    pub fn from_suite(meta: &OutputMeta, suite: &Suite) -> Self {
        Self {
            target: meta.target.clone(),
            version: meta.version.clone(),
            version_code: meta.version_code.clone(),
            generated_at: meta.generated_at.clone(),
            packages: suite.packages.stats(),
            images: suite.images.stats(),
            totals: suite.stats(),
        }
    }

    pub fn meta(&self) -> OutputMeta {
        OutputMeta {
            target: self.target.clone(),
            version: self.version.clone(),
            version_code: self.version_code.clone(),
            generated_at: self.generated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub meta: OutputMeta,
    pub suite: Suite,
}

/// Write one run into `dir`, creating it if needed. An empty suite still
/// produces three valid documents. Returns the path of `stats.json`.
pub fn write_output(meta: &OutputMeta, suite: &Suite, dir: &Path) -> Result<PathBuf> {
    ensure_dir(dir)?;

    let packages = suite.packages.to_flat();
    let images = suite.images.to_flat();
    write_json_pretty(&dir.join(PACKAGES_FILE), &packages)?;
    write_json_pretty(&dir.join(IMAGES_FILE), &images)?;

    // stats.json last: its presence marks a complete run directory.
    let stats_path = dir.join(STATS_FILE);
    let stats = RunStats::from_suite(meta, suite);
    write_json_pretty(&stats_path, &stats)?;

    info!(
        dir = %dir.display(),
        packages = packages.len(),
        images = images.len(),
        "wrote run output"
    );
    Ok(stats_path)
}

fn load_flat(path: &Path) -> Result<Results> {
    if !path.is_file() {
        return Ok(Results::default());
    }
    let items: Vec<BuildResult> = read_json(path)?;
    Ok(Results::from_flat(items))
}

pub fn load_output(dir: &Path) -> Result<RunOutput> {
    let stats: RunStats = read_json(&dir.join(STATS_FILE))?;
    let suite = Suite {
        packages: load_flat(&dir.join(PACKAGES_FILE))?,
        images: load_flat(&dir.join(IMAGES_FILE))?,
    };
    Ok(RunOutput {
        meta: stats.meta(),
        suite,
    })
}

/// `{version: {target: Suite}}`
pub type RbvfDoc = BTreeMap<String, BTreeMap<String, Suite>>;

pub fn write_rbvf(path: &Path, version: &str, target: &str, suite: &Suite) -> Result<()> {
    let mut doc = RbvfDoc::new();
    doc.entry(version.to_string())
        .or_default()
        .insert(target.to_string(), suite.clone());
    write_json_pretty(path, &doc)
}

pub fn load_rbvf(path: &Path) -> Result<RbvfDoc> {
    read_json(path)
}

/// Later documents win per version + target.
pub fn merge_rbvf(docs: impl IntoIterator<Item = RbvfDoc>) -> RbvfDoc {
    let mut merged = RbvfDoc::new();
    for doc in docs {
        for (version, targets) in doc {
            merged.entry(version).or_default().extend(targets);
        }
    }
    merged
}
