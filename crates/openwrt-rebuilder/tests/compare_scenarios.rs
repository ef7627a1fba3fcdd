use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use openwrt_rebuilder::compare::{CompareContext, Comparator, compare_build};
use openwrt_rebuilder::fetch::DirOrigin;
use openwrt_rebuilder::history::{HistoryUpdate, MAX_HISTORY_ENTRIES, VersionHistory, update_history};
use openwrt_rebuilder::model::{Stats, Status, Suite};
use openwrt_rebuilder::parsers::{Manifest, parse_checksums, parse_package_index};

fn ctx() -> CompareContext {
    CompareContext {
        version: "SNAPSHOT".into(),
        target: "x86/64".into(),
        distro: "openwrt".into(),
        origin_url: "https://downloads.openwrt.org".into(),
        release_dir: "snapshots".into(),
        built_at: None,
    }
}

fn one(name: &str, digest: &str) -> Manifest {
    [(name.to_string(), digest.to_string())].into_iter().collect()
}

fn compare_foo(rebuilt_digest: &str) -> Suite {
    let index =
        parse_package_index(r#"{"architecture":"x86_64","packages":{"foo":"1.0"}}"#).unwrap();
    let c = ctx();
    let mut suite = Suite::default();
    Comparator::new(&c).compare_packages(
        &mut suite,
        &one("foo-1.0.ipk", "abc"),
        &one("foo-1.0.ipk", rebuilt_digest),
        &index,
        "packages/x86_64/base",
    );
    suite
}

#[test]
fn matching_package_is_good() {
    let suite = compare_foo("abc");
    assert_eq!(suite.packages.total_count(), 1);
    let r = &suite.packages.good[0];
    assert_eq!(r.name, "foo");
    assert_eq!(r.version, "1.0");
    assert_eq!(r.architecture, "x86_64");
    assert_eq!(r.status, Status::Good);
    assert!(r.diffoscope_url.is_none());
}

#[test]
fn differing_package_is_bad_with_report_name() {
    let suite = compare_foo("different");
    assert_eq!(suite.packages.total_count(), 1);
    let r = &suite.packages.bad[0];
    assert_eq!(r.status, Status::Bad);
    assert!(r.has_diffoscope);
    assert_eq!(r.diffoscope_url.as_deref(), Some("foo-1.0.ipk.html"));
}

#[test]
fn unindexed_rebuilt_only_package_is_skipped() {
    let index =
        parse_package_index(r#"{"architecture":"x86_64","packages":{"foo":"1.0"}}"#).unwrap();
    let c = ctx();
    let mut suite = Suite::default();
    let n = Comparator::new(&c).compare_packages(
        &mut suite,
        &Manifest::new(),
        &one("bar-2.0.ipk", "abc"),
        &index,
        "packages",
    );
    assert_eq!(n, 0);
    assert!(suite.is_empty());
}

#[test]
fn full_history_evicts_oldest_for_new_code() {
    let mut history = VersionHistory::empty("SNAPSHOT");
    for i in 0..MAX_HISTORY_ENTRIES {
        history = update_history(
            history,
            HistoryUpdate {
                stats: Stats::default(),
                targets: BTreeMap::new(),
                version_code: Some(format!("r{i}")),
                run_id: i.to_string(),
                commit: "deadbeef".into(),
                timestamp: format!("2025-01-{:02}T00:00:00Z", i + 1),
            },
        );
    }
    assert_eq!(history.entries.len(), MAX_HISTORY_ENTRIES);
    let oldest = history.entries.last().unwrap().version_code.clone();
    assert_eq!(oldest.as_deref(), Some("r0"));

    let history = update_history(
        history,
        HistoryUpdate {
            stats: Stats {
                good: 1,
                bad: 0,
                unknown: 0,
            },
            targets: BTreeMap::new(),
            version_code: Some("r-new".into()),
            run_id: "new".into(),
            commit: "cafebabe".into(),
            timestamp: "2025-02-01T00:00:00Z".into(),
        },
    );
    assert_eq!(history.entries.len(), MAX_HISTORY_ENTRIES);
    assert_eq!(history.entries[0].version_code.as_deref(), Some("r-new"));
    assert!(
        history
            .entries
            .iter()
            .all(|e| e.version_code.as_deref() != Some("r0"))
    );
}

#[test]
fn checksum_keys_are_basenames() {
    let a = "a".repeat(64);
    let b = "B".repeat(64);
    let text = format!(
        "{a} *bin/targets/x86/64/openwrt-x86-64-generic.img.gz\n{b} *foo-1.0.ipk\nnot a checksum line\n"
    );
    let m = parse_checksums(&text);
    assert_eq!(m.len(), 2);
    assert!(m.keys().all(|k| !k.contains('/')));
    assert_eq!(m["foo-1.0.ipk"], "b".repeat(64));
}

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, body).unwrap();
}

fn sums(entries: &[(&str, char)]) -> String {
    entries
        .iter()
        .map(|(f, c)| format!("{} *{f}\n", c.to_string().repeat(64)))
        .collect()
}

const PROFILES_ORIGIN: &str = r#"{
  "profiles": {
    "generic": {
      "images": [
        {"name": "openwrt-x86-64-generic-ext4-combined.img.gz", "sha256": "aaaa"},
        {"name": "openwrt-x86-64-generic-squashfs-combined.img.gz", "sha256": "bbbb"}
      ]
    }
  }
}"#;

const PROFILES_REBUILT: &str = r#"{
  "profiles": {
    "generic": {
      "images": [
        {"name": "openwrt-x86-64-generic-ext4-combined.img.gz", "sha256": "aaaa"},
        {"name": "openwrt-x86-64-generic-squashfs-combined.img.gz", "sha256": "cccc"}
      ]
    }
  }
}"#;

#[test]
fn build_tree_against_local_origin() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let origin = tmp.path().join("origin");
    let bin = tmp.path().join("bin");

    write(&origin, "targets/x86/64/profiles.json", PROFILES_ORIGIN);
    write(&bin, "targets/x86/64/profiles.json", PROFILES_REBUILT);

    write(
        &origin,
        "targets/x86/64/sha256sums",
        &sums(&[("packages/kmod-e1000-6.6.ipk", 'a'), ("packages/kmod-igb-6.6.ipk", 'b')]),
    );
    write(
        &bin,
        "targets/x86/64/sha256sums",
        &sums(&[("packages/kmod-e1000-6.6.ipk", 'a'), ("packages/kmod-igb-6.6.ipk", 'c')]),
    );
    write(
        &bin,
        "targets/x86/64/packages/index.json",
        r#"{"architecture":"x86_64","packages":{"kmod-e1000":"6.6","kmod-igb":"6.6"}}"#,
    );

    write(&bin, "packages/x86_64/sha256sums", &sums(&[("base/busybox-1.36.ipk", 'd')]));
    write(
        &bin,
        "packages/x86_64/base/index.json",
        r#"{"architecture":"x86_64","packages":{"busybox":"1.36"}}"#,
    );
    // no origin packages/x86_64/sha256sums: base packages become unknown

    let c = ctx();
    let suite = compare_build(&c, &bin, &DirOrigin::new(&origin)).expect("compare");

    assert_eq!(suite.images.good.len(), 1);
    assert_eq!(suite.images.bad.len(), 1);
    assert_eq!(
        suite.images.bad[0].diffoscope_url.as_deref(),
        Some("openwrt-x86-64-generic-squashfs-combined.img.gz.html")
    );

    let good: Vec<_> = suite.packages.good.iter().map(|r| r.name.as_str()).collect();
    let bad: Vec<_> = suite.packages.bad.iter().map(|r| r.name.as_str()).collect();
    let unknown: Vec<_> = suite.packages.unknown.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(good, vec!["kmod-e1000"]);
    assert_eq!(bad, vec!["kmod-igb"]);
    assert_eq!(unknown, vec!["busybox"]);
    assert_eq!(
        suite.packages.bad[0].files,
        vec!["targets/x86/64/packages/kmod-igb-6.6.ipk".to_string()]
    );
    assert_eq!(
        suite.packages.unknown[0].artifact_url,
        "https://downloads.openwrt.org/snapshots/packages/x86_64/base/busybox-1.36.ipk"
    );
}

#[test]
fn empty_build_tree_yields_empty_suite() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let c = ctx();
    let suite = compare_build(&c, tmp.path(), &DirOrigin::new(tmp.path())).expect("compare");
    assert!(suite.is_empty());
}
