//! Join origin and rebuilt checksum sets into per-artifact verdicts.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::RebuildConfig;
use crate::error::Result;
use crate::fetch::OriginSource;
use crate::model::{BuildResult, Category, Status, Suite};
use crate::parsers::{
    Manifest, PackageIndex, parse_checksums, parse_checksums_file, parse_image_profiles,
    parse_image_profiles_file, parse_package_index_file,
};

pub const PACKAGE_EXTENSIONS: &[&str] = &[".ipk", ".apk"];

/// Everything the comparator needs to label results. Derived once from
/// [`RebuildConfig`] and never mutated.
#[derive(Debug, Clone)]
pub struct CompareContext {
    pub version: String,
    pub target: String,
    pub distro: String,
    pub origin_url: String,
    pub release_dir: String,
    pub built_at: Option<String>,
}

impl CompareContext {
    pub fn from_config(cfg: &RebuildConfig) -> Self {
        Self {
            version: cfg.version.clone(),
            target: cfg.target.clone(),
            distro: cfg.distro.clone(),
            origin_url: cfg.origin_url.clone(),
            release_dir: cfg.release_dir(),
            built_at: None,
        }
    }

    pub fn with_built_at(mut self, built_at: impl Into<String>) -> Self {
        self.built_at = Some(built_at.into());
        self
    }

    fn artifact_url(&self, rel: &str) -> String {
        format!("{}/{}/{}", self.origin_url, self.release_dir, rel)
    }
}

pub fn diff_report_name(filename: &str) -> String {
    format!("{filename}.html")
}

pub fn classify(filename: &str, origin: &Manifest, rebuilt: &Manifest) -> Status {
    let Some(rebuilt_digest) = rebuilt.get(filename) else {
        return Status::Unknown;
    };
    let Some(origin_digest) = origin.get(filename) else {
        return Status::Unknown;
    };
    if origin_digest != rebuilt_digest {
        return Status::Bad;
    }
    Status::Good
}

fn strip_package_ext(filename: &str) -> Option<&str> {
    PACKAGE_EXTENSIONS
        .iter()
        .find_map(|ext| filename.strip_suffix(ext))
        .filter(|stem| !stem.is_empty())
}

fn union_keys<'a>(origin: &'a Manifest, rebuilt: &'a Manifest) -> BTreeSet<&'a str> {
    origin
        .keys()
        .chain(rebuilt.keys())
        .map(String::as_str)
        .collect()
}

pub struct Comparator<'a> {
    ctx: &'a CompareContext,
}

impl<'a> Comparator<'a> {
    pub fn new(ctx: &'a CompareContext) -> Self {
        Self { ctx }
    }

    fn result_for(
        &self,
        filename: &str,
        name: &str,
        version: &str,
        architecture: &str,
        rel_path: String,
        status: Status,
    ) -> BuildResult {
        let mut r = BuildResult::new(name, version, architecture, &self.ctx.version, status);
        r.distro = self.ctx.distro.clone();
        r.artifact_url = self.ctx.artifact_url(&rel_path);
        r.built_at = self.ctx.built_at.clone();
        if status == Status::Bad {
            r.has_diffoscope = true;
            r.diffoscope_url = Some(diff_report_name(filename));
        }
        r.files = vec![rel_path];
        r
    }

    /// Compare package archives of one feed or target. `file_prefix` is the
    /// directory of the archives relative to the release dir (for example
    /// `targets/x86/64/packages` or `packages/x86_64/base`).
    ///
    /// Archives whose stem is not in `index` are skipped. Returns the number
    /// of results appended to `suite`.
    pub fn compare_packages(
        &self,
        suite: &mut Suite,
        origin: &Manifest,
        rebuilt: &Manifest,
        index: &PackageIndex,
        file_prefix: &str,
    ) -> usize {
        let prefix = file_prefix.trim_matches('/');
        let mut added = 0usize;
        let mut skipped = 0usize;

        for filename in union_keys(origin, rebuilt) {
            let Some(stem) = strip_package_ext(filename) else {
                continue;
            };
            let Some((name, version)) = index.lookup(stem) else {
                debug!(package = stem, "not in package index, skipping");
                skipped += 1;
                continue;
            };
            let status = classify(filename, origin, rebuilt);
            let rel = if prefix.is_empty() {
                filename.to_string()
            } else {
                format!("{prefix}/{filename}")
            };
            let r = self.result_for(filename, name, version, index.architecture(), rel, status);
            suite.add_result(Category::Packages, r);
            added += 1;
        }

        debug!(prefix, added, skipped, "compared packages");
        added
    }

    /// Compare firmware images listed in `profiles.json`.
    pub fn compare_images(&self, suite: &mut Suite, origin: &Manifest, rebuilt: &Manifest) -> usize {
        let mut added = 0usize;
        for filename in union_keys(origin, rebuilt) {
            let status = classify(filename, origin, rebuilt);
            let rel = format!("targets/{}/{}", self.ctx.target, filename);
            let r = self.result_for(
                filename,
                filename,
                &self.ctx.version,
                &self.ctx.target,
                rel,
                status,
            );
            suite.add_result(Category::Images, r);
            added += 1;
        }
        debug!(added, "compared images");
        added
    }
}

fn parse_sums(raw: &str) -> Result<Manifest> {
    Ok(parse_checksums(raw))
}

/// Compare one finished build tree against the published release.
///
/// `bin_dir` is the `bin/` dir of the rebuilt OpenWrt tree. Images come
/// from `profiles.json`, target packages from the target `sha256sums`, and
/// base feed packages from `packages/<arch>/sha256sums`. Parts missing from
/// the rebuilt tree are skipped; an origin manifest that cannot be read makes
/// every rebuilt artifact of that part `Unknown`.
pub fn compare_build(ctx: &CompareContext, bin_dir: &Path, origin: &dyn OriginSource) -> Result<Suite> {
    let comparator = Comparator::new(ctx);
    let mut suite = Suite::default();
    let target_rel = format!("targets/{}", ctx.target);
    let target_bin = bin_dir.join(&target_rel);

    let origin_manifest = |rel: &str, parse: fn(&str) -> Result<Manifest>| -> Manifest {
        match origin.read(rel).and_then(|raw| parse(&raw)) {
            Ok(m) => m,
            Err(e) => {
                warn!("origin {rel} unavailable, treating as empty: {e}");
                Manifest::new()
            }
        }
    };

    let profiles = target_bin.join("profiles.json");
    if profiles.is_file() {
        let rebuilt = parse_image_profiles_file(&profiles)?;
        let published = origin_manifest(&format!("{target_rel}/profiles.json"), parse_image_profiles);
        comparator.compare_images(&mut suite, &published, &rebuilt);
    } else {
        info!("no profiles.json in {}, skipping images", target_bin.display());
    }

    let target_index = target_bin.join("packages").join("index.json");
    let target_sums = target_bin.join("sha256sums");
    if !target_index.is_file() {
        info!("no package index in {}, skipping packages", target_bin.display());
        return Ok(suite);
    }
    let index = parse_package_index_file(&target_index)?;
    if target_sums.is_file() {
        let rebuilt = parse_checksums_file(&target_sums)?;
        let published = origin_manifest(&format!("{target_rel}/sha256sums"), parse_sums);
        comparator.compare_packages(
            &mut suite,
            &published,
            &rebuilt,
            &index,
            &format!("{target_rel}/packages"),
        );
    }

    let arch = index.architecture();
    if arch.is_empty() {
        return Ok(suite);
    }
    let feed_rel = format!("packages/{arch}");
    let base_index = bin_dir.join(&feed_rel).join("base").join("index.json");
    let base_sums = bin_dir.join(&feed_rel).join("sha256sums");
    if base_index.is_file() && base_sums.is_file() {
        let base = parse_package_index_file(&base_index)?;
        let rebuilt = parse_checksums_file(&base_sums)?;
        let published = origin_manifest(&format!("{feed_rel}/sha256sums"), parse_sums);
        comparator.compare_packages(
            &mut suite,
            &published,
            &rebuilt,
            &base,
            &format!("{feed_rel}/base"),
        );
    }

    let s = suite.stats();
    info!(
        good = s.good,
        bad = s.bad,
        unknown = s.unknown,
        "compared {} @ {}",
        ctx.target,
        ctx.version
    );
    Ok(suite)
}
