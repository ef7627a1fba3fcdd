use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// Package index of one feed/target (`packages/index.json`).
///
/// The `name-version -> (name, version)` lookup is derived from the package
/// map and rebuilt on every mutation, so it can never go stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageIndex {
    architecture: String,
    packages: BTreeMap<String, String>,
    by_file_stem: BTreeMap<String, (String, String)>,
}

impl PackageIndex {
    pub fn new(architecture: impl Into<String>, packages: BTreeMap<String, String>) -> Self {
        let mut idx = Self {
            architecture: architecture.into(),
            packages,
            by_file_stem: BTreeMap::new(),
        };
        idx.rebuild_lookup();
        idx
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn packages(&self) -> &BTreeMap<String, String> {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, version: impl Into<String>) {
        self.packages.insert(name.into(), version.into());
        self.rebuild_lookup();
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let out = self.packages.remove(name);
        if out.is_some() {
            self.rebuild_lookup();
        }
        out
    }

    /// Resolve `"<name>-<version>"` (an artifact filename without its
    /// extension) to the package identity.
    pub fn lookup(&self, file_stem: &str) -> Option<(&str, &str)> {
        self.by_file_stem
            .get(file_stem)
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn rebuild_lookup(&mut self) {
        self.by_file_stem = self
            .packages
            .iter()
            .map(|(name, version)| {
                (
                    format!("{name}-{version}"),
                    (name.clone(), version.clone()),
                )
            })
            .collect();
    }
}

pub fn parse_package_index(content: &str) -> Result<PackageIndex> {
    let v: Value = serde_json::from_str(content)
        .map_err(|e| Error::msg(format!("failed to parse package index: {e}")))?;

    let architecture = v
        .get("architecture")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut packages = BTreeMap::new();
    if let Some(map) = v.get("packages").and_then(Value::as_object) {
        for (name, version) in map {
            let Some(version) = version.as_str() else {
                continue;
            };
            packages.insert(name.clone(), version.to_string());
        }
    }

    Ok(PackageIndex::new(architecture, packages))
}

pub fn parse_package_index_file(path: &Path) -> Result<PackageIndex> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::msg(format!(
            "failed to read package index {}: {e}",
            path.display()
        ))
    })?;
    parse_package_index(&raw)
        .map_err(|e| Error::msg(format!("{}: {e}", path.display())))
}
