//! Parsers for the manifests published next to OpenWrt builds.
//!
//! All parsers are lenient per entry: a malformed line or object is skipped,
//! only a completely unreadable input is an error.

use std::collections::BTreeMap;

pub mod checksums;
pub mod packages;
pub mod profiles;

pub use checksums::{checksum_directory, parse_checksums, parse_checksums_file, render_checksums};
pub use packages::{PackageIndex, parse_package_index, parse_package_index_file};
pub use profiles::{parse_image_profiles, parse_image_profiles_file};

/// Artifact basename -> lowercase hex digest.
pub type Manifest = BTreeMap<String, String>;
