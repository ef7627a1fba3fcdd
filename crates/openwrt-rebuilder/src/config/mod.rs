use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::workspace::WorkspaceConfig;

pub const DEFAULT_ORIGIN_URL: &str = "https://downloads.openwrt.org";
pub const DEFAULT_SOURCE_MIRROR: &str = "https://codeberg.org/openwrt/";
pub const DEFAULT_DIFFOSCOPE_IMAGE: &str = "registry.salsa.debian.org/reproducible-builds/diffoscope";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn string_list(path: &Path, value: Option<&Value>, key: &str) -> Result<Vec<String>> {
    let Some(arr) = value.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid {} entry in {} (expected string)",
                key,
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// `extends = "base.toml"` is loaded first, then each of `imports = [..]`,
// then the file's own keys; later layers win.
fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    for imp in string_list(path, value.get("imports"), "imports")? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
        tbl.remove("imports");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RebuildSection {
    target: Option<String>,
    version: Option<String>,
    origin_url: Option<String>,
    source_mirror: Option<String>,
    distro: Option<String>,
}

fn default_runtime() -> String {
    "podman".into()
}

fn default_image() -> String {
    DEFAULT_DIFFOSCOPE_IMAGE.into()
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiffoscopeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    // 0 = derive from CPU count
    pub jobs: usize,
}

impl Default for DiffoscopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: default_runtime(),
            image: default_image(),
            timeout_secs: default_timeout_secs(),
            jobs: 0,
        }
    }
}

/// Values given on the command line; they beat both the environment and
/// the TOML document.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<String>,
    pub version: Option<String>,
    pub jobs: Option<usize>,
    pub no_diffoscope: bool,
}

/// Immutable settings for one rebuild run. Built once, then handed by
/// reference to every component.
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    pub target: String,
    pub version: String,
    pub origin_url: String,
    pub source_mirror: String,
    pub distro: String,
    pub jobs: usize,
    pub diffoscope: DiffoscopeConfig,
    pub workspace: WorkspaceConfig,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_target(raw: &str) -> String {
    raw.trim().replace('-', "/")
}

/// `SNAPSHOT` and branch snapshots like `24.10-SNAPSHOT`; only these carry
/// version codes.
pub fn is_snapshot_version(version: &str) -> bool {
    version.contains("SNAPSHOT")
}

impl RebuildConfig {
    pub fn from_doc(doc: &ConfigDoc, overrides: &Overrides) -> Result<Self> {
        Self::resolve(doc, overrides, env_nonempty)
    }

    fn resolve(
        doc: &ConfigDoc,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let rebuild: RebuildSection = doc.deserialize_path("rebuild")?.unwrap_or_default();
        let mut diffoscope: DiffoscopeConfig =
            doc.deserialize_path("diffoscope")?.unwrap_or_default();
        let workspace: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();

        let target = overrides
            .target
            .clone()
            .or_else(|| env("TARGET"))
            .or(rebuild.target)
            .unwrap_or_else(|| "x86/64".into());
        let version = overrides
            .version
            .clone()
            .or_else(|| env("VERSION"))
            .or(rebuild.version)
            .unwrap_or_else(|| "SNAPSHOT".into());
        let origin_url = env("ORIGIN_URL")
            .or(rebuild.origin_url)
            .unwrap_or_else(|| DEFAULT_ORIGIN_URL.into());
        let source_mirror = env("SOURCE_MIRROR")
            .or(rebuild.source_mirror)
            .unwrap_or_else(|| DEFAULT_SOURCE_MIRROR.into());

        if let Some(raw) = env("USE_DIFFOSCOPE") {
            diffoscope.enabled = parse_flag(&raw).ok_or_else(|| {
                Error::msg(format!("invalid USE_DIFFOSCOPE value '{}'", raw))
            })?;
        }
        if overrides.no_diffoscope {
            diffoscope.enabled = false;
        }

        let jobs = match overrides.jobs {
            Some(j) => j,
            None => match env("JOBS") {
                Some(raw) => raw
                    .parse::<usize>()
                    .map_err(|e| Error::msg(format!("invalid JOBS value '{}': {e}", raw)))?,
                None => diffoscope.jobs,
            },
        };
        let jobs = if jobs == 0 { num_cpus::get() + 1 } else { jobs };

        Ok(Self {
            target: normalize_target(&target),
            version: version.trim().to_string(),
            origin_url: origin_url.trim_end_matches('/').to_string(),
            source_mirror,
            distro: rebuild
                .distro
                .unwrap_or_else(|| crate::model::DISTRO.into()),
            jobs,
            diffoscope,
            workspace,
        })
    }

    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.target.contains('/') {
            out.push(format!(
                "invalid target format: {} (expected 'arch/subtarget')",
                self.target
            ));
        }
        if self.version.is_empty() {
            out.push("version is empty".into());
        }
        if !(self.origin_url.starts_with("http://") || self.origin_url.starts_with("https://")) {
            out.push(format!("invalid origin URL: {}", self.origin_url));
        }
        if self.jobs < 1 {
            out.push(format!("invalid job count: {}", self.jobs));
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "configuration validation failed: {}",
            problems.join("; ")
        )))
    }

    pub fn is_snapshot(&self) -> bool {
        is_snapshot_version(&self.version)
    }

    /// Release directory on the origin server.
    pub fn release_dir(&self) -> String {
        if self.version == "SNAPSHOT" {
            "snapshots".into()
        } else {
            format!("releases/{}", self.version)
        }
    }

    pub fn target_dir(&self) -> String {
        format!("{}/targets/{}", self.release_dir(), self.target)
    }

    /// Git branch the version is built from, e.g. `23.05.2` -> `openwrt-23.05`.
    pub fn branch(&self) -> String {
        if self.version == "SNAPSHOT" {
            return "master".into();
        }
        let base = self.version.trim_end_matches("-SNAPSHOT");
        match base.rsplit_once('.') {
            Some((major_minor, _)) if base.matches('.').count() >= 2 => {
                format!("openwrt-{major_minor}")
            }
            _ => format!("openwrt-{base}"),
        }
    }

    pub fn openwrt_git(&self) -> String {
        format!("{}openwrt.git", self.source_mirror)
    }

    pub fn target_slug(&self) -> String {
        self.target.replace('/', "_")
    }

    pub fn origin_release_url(&self, rel: &str) -> String {
        format!(
            "{}/{}/{}",
            self.origin_url,
            self.release_dir(),
            rel.trim_start_matches('/')
        )
    }

    pub fn origin_target_url(&self, file: &str) -> String {
        format!(
            "{}/{}/{}",
            self.origin_url,
            self.target_dir(),
            file.trim_start_matches('/')
        )
    }
}
