use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::parsers::Manifest;

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `<sha256> *<path>`; only the last path segment is kept.
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{64}) \*(?:.*/)?([^/]+)$").expect("checksum line regex")
    })
}

pub fn parse_checksums(content: &str) -> Manifest {
    let mut out = Manifest::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        let Some(caps) = line_re().captures(line) else {
            continue;
        };
        let name = caps[2].trim();
        if name.is_empty() {
            continue;
        }
        out.insert(name.to_string(), caps[1].to_ascii_lowercase());
    }
    out
}

pub fn parse_checksums_file(path: &Path) -> Result<Manifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read checksums {}: {e}", path.display())))?;
    Ok(parse_checksums(&raw))
}

pub fn render_checksums(manifest: &Manifest, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let mut out = String::new();
    for (name, digest) in manifest {
        if prefix.is_empty() {
            out.push_str(&format!("{digest} *{name}\n"));
        } else {
            out.push_str(&format!("{digest} *{prefix}/{name}\n"));
        }
    }
    out
}

fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut f = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash every regular file below `dir`. Basenames collide across
/// subdirectories the same way they do in a `sha256sums` file: the entry
/// visited last (sorted walk) wins.
pub fn checksum_directory(dir: &Path) -> Result<Manifest> {
    if !dir.is_dir() {
        return Err(Error::msg(format!(
            "checksum root {} is not a directory",
            dir.display()
        )));
    }
    let mut out = Manifest::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walk error in {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name == "sha256sums" {
            continue;
        }
        out.insert(name.to_string(), sha256_file(entry.path())?);
    }
    Ok(out)
}
