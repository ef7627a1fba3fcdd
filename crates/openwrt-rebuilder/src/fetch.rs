use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

pub fn client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))
}

fn get_ok(client: &reqwest::blocking::Client, url: &str) -> Result<reqwest::blocking::Response> {
    debug!(url, "GET");
    let res = client
        .get(url)
        .send()
        .map_err(|e| Error::msg(format!("GET {url} failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::msg(format!(
            "GET {url} failed with status {}",
            res.status()
        )));
    }
    Ok(res)
}

pub fn fetch_text(client: &reqwest::blocking::Client, url: &str) -> Result<String> {
    get_ok(client, url)?
        .text()
        .map_err(|e| Error::msg(format!("failed to read body of {url}: {e}")))
}

pub fn fetch_to_file(client: &reqwest::blocking::Client, url: &str, dest: &Path) -> Result<()> {
    let body = get_ok(client, url)?
        .bytes()
        .map_err(|e| Error::msg(format!("failed to read body of {url}: {e}")))?;
    if let Some(parent) = dest.parent() {
        crate::report::ensure_dir(parent)?;
    }
    fs::write(dest, &body)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", dest.display())))
}

/// Where the published build lives. Paths are relative to the release dir
/// (`targets/x86/64/sha256sums`, `packages/x86_64/sha256sums`, ...).
pub trait OriginSource {
    fn read(&self, rel: &str) -> Result<String>;
}

pub struct HttpOrigin {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpOrigin {
    /// `base_url` is the release dir URL, e.g.
    /// `https://downloads.openwrt.org/snapshots`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: client(Duration::from_secs(60))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl OriginSource for HttpOrigin {
    fn read(&self, rel: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, rel.trim_start_matches('/'));
        fetch_text(&self.client, &url)
    }
}

/// A local mirror of the release dir.
pub struct DirOrigin {
    root: PathBuf,
}

impl DirOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl OriginSource for DirOrigin {
    fn read(&self, rel: &str) -> Result<String> {
        let p = self.root.join(rel.trim_start_matches('/'));
        fs::read_to_string(&p).map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
    }
}
