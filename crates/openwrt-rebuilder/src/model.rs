//! Reproducibility verdicts and the status-bucketed containers that hold them.
//!
//! The wire format follows rebuilderd (`GOOD` / `BAD` / `UNKWN`). Reports
//! written by older rebuilder releases used `reproducible`, `unreproducible`,
//! `notfound` and `pending`; both spellings decode to the same [`Status`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DISTRO: &str = "openwrt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    /// Rebuilt digest equals origin digest.
    Good,
    /// Both sides exist but the digests differ.
    Bad,
    /// Nothing to compare against (missing on either side, or not tested).
    Unknown,
}

// (wire value, status). Current spelling first; the first match per status
// is what gets written.
const STATUS_WIRE: &[(&str, Status)] = &[
    ("GOOD", Status::Good),
    ("BAD", Status::Bad),
    ("UNKWN", Status::Unknown),
    ("reproducible", Status::Good),
    ("unreproducible", Status::Bad),
    ("notfound", Status::Unknown),
    ("pending", Status::Unknown),
];

impl Status {
    pub const ALL: [Status; 3] = [Status::Good, Status::Bad, Status::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Good => "GOOD",
            Status::Bad => "BAD",
            Status::Unknown => "UNKWN",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Status> {
        let raw = raw.trim();
        STATUS_WIRE
            .iter()
            .find(|(w, _)| *w == raw)
            .map(|(_, s)| *s)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::from_wire(s).ok_or_else(|| Error::msg(format!("unknown status '{}'", s)))
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Status::from_wire(&raw).ok_or_else(|| de::Error::custom(format!("unknown status '{raw}'")))
    }
}

fn default_distro() -> String {
    DISTRO.into()
}

/// One verdict for one artifact (package or image).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub name: String,
    pub version: String,
    #[serde(default, alias = "arch")]
    pub architecture: String,
    #[serde(default)]
    pub suite: String,
    #[serde(default = "default_distro", alias = "distribution")]
    pub distro: String,
    pub status: Status,
    #[serde(default)]
    pub artifact_url: String,
    #[serde(default)]
    pub build_id: Option<u64>,
    #[serde(default)]
    pub built_at: Option<String>,
    #[serde(default)]
    pub has_diffoscope: bool,
    #[serde(default)]
    pub has_attestation: bool,
    #[serde(default, alias = "diffoscope")]
    pub diffoscope_url: Option<String>,
    // Paths relative to the release directory on the origin server.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "de_files")]
    pub files: Vec<String>,
}

impl BuildResult {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        architecture: impl Into<String>,
        suite: impl Into<String>,
        status: Status,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            architecture: architecture.into(),
            suite: suite.into(),
            distro: default_distro(),
            status,
            artifact_url: String::new(),
            build_id: None,
            built_at: None,
            has_diffoscope: false,
            has_attestation: false,
            diffoscope_url: None,
            files: Vec::new(),
        }
    }

    pub fn file(&self) -> Option<&str> {
        self.files.first().map(String::as_str)
    }
}

// Legacy reports stored `files` as `{ "<status>": [paths] }`.
fn de_files<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Files {
        List(Vec<String>),
        ByStatus(BTreeMap<String, Vec<String>>),
    }
    Ok(match Option::<Files>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Files::List(v)) => v,
        Some(Files::ByStatus(m)) => m.into_values().flatten().collect(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub good: usize,
    pub bad: usize,
    pub unknown: usize,
}

impl Stats {
    pub fn total(&self) -> usize {
        self.good + self.bad + self.unknown
    }

    pub fn good_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.good as f64 * 100.0 / total as f64
    }

    pub fn add(&mut self, other: &Stats) {
        self.good += other.good;
        self.bad += other.bad;
        self.unknown += other.unknown;
    }

    pub fn count(&mut self, status: Status) {
        match status {
            Status::Good => self.good += 1,
            Status::Bad => self.bad += 1,
            Status::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results {
    pub good: Vec<BuildResult>,
    pub bad: Vec<BuildResult>,
    pub unknown: Vec<BuildResult>,
}

impl Results {
    pub fn add(&mut self, result: BuildResult) {
        self.bucket_mut(result.status).push(result);
    }

    pub fn bucket(&self, status: Status) -> &[BuildResult] {
        match status {
            Status::Good => &self.good,
            Status::Bad => &self.bad,
            Status::Unknown => &self.unknown,
        }
    }

    fn bucket_mut(&mut self, status: Status) -> &mut Vec<BuildResult> {
        match status {
            Status::Good => &mut self.good,
            Status::Bad => &mut self.bad,
            Status::Unknown => &mut self.unknown,
        }
    }

    pub fn total_count(&self) -> usize {
        self.good.len() + self.bad.len() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    pub fn stats(&self) -> Stats {
        Stats {
            good: self.good.len(),
            bad: self.bad.len(),
            unknown: self.unknown.len(),
        }
    }

    /// Good, then bad, then unknown; insertion order within each bucket.
    pub fn iter(&self) -> impl Iterator<Item = &BuildResult> {
        self.good.iter().chain(self.bad.iter()).chain(self.unknown.iter())
    }

    pub fn to_flat(&self) -> Vec<BuildResult> {
        self.iter().cloned().collect()
    }

    pub fn from_flat(items: impl IntoIterator<Item = BuildResult>) -> Self {
        let mut out = Self::default();
        for r in items {
            out.add(r);
        }
        out
    }
}

// Serialized as `{"GOOD": [..], "BAD": [..], "UNKWN": [..]}`.
impl Serialize for Results {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Status::ALL.len()))?;
        for status in Status::ALL {
            map.serialize_entry(status.as_str(), self.bucket(status))?;
        }
        map.end()
    }
}

// Bucket keys are informational; each item is routed by its own status so
// legacy and current keys can be mixed.
impl<'de> Deserialize<'de> for Results {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, Vec<BuildResult>>::deserialize(deserializer)?;
        let mut out = Results::default();
        for status in Status::ALL {
            for (key, items) in &raw {
                if Status::from_wire(key) == Some(status) {
                    for item in items {
                        out.add(item.clone());
                    }
                }
            }
        }
        for (key, items) in raw {
            if Status::from_wire(&key).is_none() {
                for item in items {
                    out.add(item);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Packages,
    Images,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Packages, Category::Images];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Packages => "packages",
            Category::Images => "images",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "packages" => Ok(Category::Packages),
            "images" => Ok(Category::Images),
            other => Err(Error::msg(format!(
                "invalid category '{}' (expected 'packages' or 'images')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub packages: Results,
    #[serde(default)]
    pub images: Results,
}

impl Suite {
    pub fn results(&self, category: Category) -> &Results {
        match category {
            Category::Packages => &self.packages,
            Category::Images => &self.images,
        }
    }

    pub fn results_mut(&mut self, category: Category) -> &mut Results {
        match category {
            Category::Packages => &mut self.packages,
            Category::Images => &mut self.images,
        }
    }

    pub fn add_result(&mut self, category: Category, result: BuildResult) {
        self.results_mut(category).add(result);
    }

    pub fn add_named(&mut self, category: &str, result: BuildResult) -> Result<()> {
        let category = category.parse::<Category>()?;
        self.add_result(category, result);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let mut s = self.packages.stats();
        s.add(&self.images.stats());
        s
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.images.is_empty()
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Suite> {
        serde_json::from_value(value)
            .map_err(|e| Error::msg(format!("failed to decode suite: {e}")))
    }

    /// Bad results across both categories, images first.
    pub fn unreproducible(&self) -> impl Iterator<Item = (Category, &BuildResult)> {
        self.images
            .bad
            .iter()
            .map(|r| (Category::Images, r))
            .chain(self.packages.bad.iter().map(|r| (Category::Packages, r)))
    }
}
