use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::parsers::Manifest;

/// Image checksums from `profiles.json` (`profiles.<id>.images[].{name,sha256}`).
pub fn parse_image_profiles(content: &str) -> Result<Manifest> {
    let v: Value = serde_json::from_str(content)
        .map_err(|e| Error::msg(format!("failed to parse profiles: {e}")))?;

    let mut out = Manifest::new();
    let Some(profiles) = v.get("profiles").and_then(Value::as_object) else {
        return Ok(out);
    };
    for profile in profiles.values() {
        let Some(images) = profile.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in images {
            let name = image.get("name").and_then(Value::as_str).map(str::trim);
            let sha = image.get("sha256").and_then(Value::as_str).map(str::trim);
            match (name, sha) {
                (Some(n), Some(s)) if !n.is_empty() && !s.is_empty() => {
                    out.insert(n.to_string(), s.to_ascii_lowercase());
                }
                _ => {}
            }
        }
    }
    Ok(out)
}

pub fn parse_image_profiles_file(path: &Path) -> Result<Manifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read profiles {}: {e}", path.display())))?;
    parse_image_profiles(&raw).map_err(|e| Error::msg(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_images_across_profiles() {
        let raw = serde_json::json!({
            "profiles": {
                "generic": {"images": [
                    {"name": "openwrt-x86-64-generic-squashfs-combined.img.gz", "sha256": "aa"},
                    {"name": "openwrt-x86-64-generic-ext4-combined.img.gz", "sha256": "bb"}
                ]},
                "other": {"images": [{"name": "other.bin", "sha256": "CC"}]}
            }
        })
        .to_string();
        let m = parse_image_profiles(&raw).expect("parse");
        assert_eq!(m.len(), 3);
        assert_eq!(m["other.bin"], "cc");
    }

    #[test]
    fn skips_incomplete_entries() {
        let raw = r#"{"profiles":{"p":{"images":[{"name":"a.bin"},{"sha256":"ff"},{"name":"b.bin","sha256":"ff"}]},"q":{}}}"#;
        let m = parse_image_profiles(raw).expect("parse");
        assert_eq!(m.len(), 1);
        assert!(m.contains_key("b.bin"));
    }

    #[test]
    fn missing_profiles_is_empty() {
        assert!(parse_image_profiles("{}").expect("parse").is_empty());
        assert!(parse_image_profiles("[").is_err());
    }
}
