use std::fs;

use openwrt_rebuilder::history::{BuildInfo, HistoryStore};
use openwrt_rebuilder::model::{BuildResult, Category, Status, Suite};
use openwrt_rebuilder::report::combine::CombineOptions;
use openwrt_rebuilder::report::{OutputMeta, collect_results, combine, load_output, write_output};

fn result(name: &str, status: Status) -> BuildResult {
    let mut r = BuildResult::new(name, "1.0", "x86_64", "SNAPSHOT", status);
    r.artifact_url = format!("https://downloads.openwrt.org/snapshots/packages/{name}-1.0.ipk");
    r.files = vec![format!("packages/{name}-1.0.ipk")];
    r
}

fn suite(entries: &[(&str, Status)]) -> Suite {
    let mut s = Suite::default();
    for (name, status) in entries {
        s.add_result(Category::Packages, result(name, *status));
    }
    s
}

fn build() -> BuildInfo {
    BuildInfo {
        time: "2025-01-16 12:00:00 UTC".into(),
        commit: "abcdef12".into(),
        branch: "main".into(),
        run_id: "42".into(),
    }
}

#[test]
fn suite_survives_json_round_trip() {
    let mut s = suite(&[("a", Status::Good), ("b", Status::Bad), ("c", Status::Unknown)]);
    let mut img = BuildResult::new("img.bin", "SNAPSHOT", "x86/64", "SNAPSHOT", Status::Bad);
    img.diffoscope_url = Some("img.bin.html".into());
    img.has_diffoscope = true;
    s.add_result(Category::Images, img);

    let value = s.to_value().expect("encode");
    assert_eq!(value["packages"]["BAD"][0]["name"], "b");
    let back = Suite::from_value(value).expect("decode");
    assert_eq!(back, s);
}

#[test]
fn empty_suite_still_writes_valid_documents() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("results/SNAPSHOT/x86/64");
    let meta = OutputMeta::now("x86/64", "SNAPSHOT");
    let stats_path = write_output(&meta, &Suite::default(), &dir).expect("write");
    assert!(stats_path.is_file());

    for name in ["packages.json", "images.json"] {
        let raw = fs::read_to_string(dir.join(name)).expect("read");
        let v: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(v, serde_json::json!([]));
    }
    let stats: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&stats_path).expect("read")).expect("json");
    assert_eq!(stats["totals"]["good"], 0);
    assert_eq!(stats["target"], "x86/64");

    let back = load_output(&dir).expect("load");
    assert!(back.suite.is_empty());
}

#[test]
fn snapshot_code_recovered_from_layout() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let results = tmp.path().join("results");
    let meta = OutputMeta::now("x86/64", "SNAPSHOT");
    write_output(
        &meta,
        &suite(&[("a", Status::Good)]),
        &results.join("SNAPSHOT/r28532-abc/x86/64"),
    )
    .expect("write");
    // stray report dirs are not runs
    fs::create_dir_all(results.join("SNAPSHOT/r28532-abc/x86/64/diffoscope")).expect("mkdir");

    let data = collect_results(&results).expect("collect");
    assert_eq!(data.keys().collect::<Vec<_>>(), vec!["SNAPSHOT/r28532-abc"]);
    assert!(data["SNAPSHOT/r28532-abc"].contains_key("x86/64"));
}

#[test]
fn combine_new_runs_overwrite_existing_per_target() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let results = tmp.path().join("results");
    let output = tmp.path().join("combined");
    let store = HistoryStore::new(&output);

    // previously published: two targets
    let meta_x86 = OutputMeta::now("x86/64", "24.10.0");
    let meta_ath = OutputMeta::now("ath79/generic", "24.10.0");
    write_output(
        &meta_x86,
        &suite(&[("old", Status::Bad)]),
        &output.join("24.10.0/x86/64"),
    )
    .expect("write existing x86");
    write_output(
        &meta_ath,
        &suite(&[("keep", Status::Good)]),
        &output.join("24.10.0/ath79/generic"),
    )
    .expect("write existing ath79");

    // new run replaces x86/64 only
    write_output(
        &meta_x86,
        &suite(&[("new", Status::Good), ("new2", Status::Good)]),
        &results.join("24.10.0/x86/64"),
    )
    .expect("write new");
    fs::create_dir_all(results.join("24.10.0/x86/64/diffoscope")).expect("mkdir");
    fs::write(
        results.join("24.10.0/x86/64/diffoscope/new-1.0.ipk.html"),
        "<html></html>",
    )
    .expect("write report");

    let stats = combine(
        &results,
        &output,
        &store,
        &build(),
        &CombineOptions::default(),
    )
    .expect("combine");
    assert_eq!(stats.good, 3);
    assert_eq!(stats.bad, 0);

    let x86 = load_output(&output.join("24.10.0/x86/64")).expect("x86");
    let names: Vec<_> = x86.suite.packages.good.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["new", "new2"]);
    assert!(x86.suite.packages.bad.is_empty());

    let ath = load_output(&output.join("24.10.0/ath79/generic")).expect("ath79");
    assert_eq!(ath.suite.packages.good[0].name, "keep");

    assert!(output.join("diffoscope/new-1.0.ipk.html").is_file());
    assert!(output.join("output.json").is_file());

    // history only counts the newly collected run
    let history = store.load("24.10.0");
    assert_eq!(history.entries.len(), 1);
    assert_eq!(history.entries[0].stats.good, 2);
    assert_eq!(history.entries[0].run_id, "42");
    assert!(history.entries[0].targets.contains_key("x86/64"));
}

#[test]
fn combine_with_nothing_returns_zero_stats() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = HistoryStore::new(tmp.path().join("out"));
    let stats = combine(
        &tmp.path().join("missing"),
        &tmp.path().join("out"),
        &store,
        &build(),
        &CombineOptions::default(),
    )
    .expect("combine");
    assert_eq!(stats.total(), 0);
}

#[test]
fn corrupt_history_is_replaced() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = HistoryStore::new(tmp.path());
    let p = store.path_for("SNAPSHOT");
    fs::create_dir_all(p.parent().expect("parent")).expect("mkdir");
    fs::write(&p, "{ not json").expect("write");

    let results = tmp.path().join("results");
    write_output(
        &OutputMeta::now("x86/64", "SNAPSHOT").with_version_code(Some("r1-a".into())),
        &suite(&[("a", Status::Good)]),
        &results.join("SNAPSHOT/r1-a/x86/64"),
    )
    .expect("write");

    combine(
        &results,
        &tmp.path().join("out"),
        &store,
        &build(),
        &CombineOptions::default(),
    )
    .expect("combine");

    let history = store.load("SNAPSHOT");
    assert_eq!(history.entries.len(), 1);
    assert_eq!(history.entries[0].version_code.as_deref(), Some("r1-a"));
}

#[test]
fn history_orders_codes_by_generation_time() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let results = tmp.path().join("results");
    let output = tmp.path().join("out");
    let store = HistoryStore::new(&output);

    // lexically r10000 sorts before r9999, but it is the newer build
    for (code, day) in [("r10000-bbb", "02"), ("r9999-aaa", "01")] {
        let meta = OutputMeta {
            generated_at: format!("2025-01-{day}T00:00:00+00:00"),
            ..OutputMeta::now("x86/64", "SNAPSHOT")
        }
        .with_version_code(Some(code.into()));
        write_output(
            &meta,
            &suite(&[("a", Status::Good)]),
            &results.join(format!("SNAPSHOT/{code}/x86/64")),
        )
        .expect("write");
    }

    combine(&results, &output, &store, &build(), &CombineOptions::default()).expect("combine");

    let history = store.load("SNAPSHOT");
    let codes: Vec<_> = history
        .entries
        .iter()
        .map(|e| e.version_code.as_deref().unwrap_or(""))
        .collect();
    assert_eq!(codes, vec!["r10000-bbb", "r9999-aaa"]);
    assert_eq!(history.entries[0].timestamp, "2025-01-02T00:00:00+00:00");
    assert_eq!(history.entries[1].timestamp, "2025-01-01T00:00:00+00:00");
}

#[test]
fn combine_copies_artifact_pairs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let results = tmp.path().join("results");
    let output = tmp.path().join("out");
    let store = HistoryStore::new(&output);

    write_output(
        &OutputMeta::now("x86/64", "24.10.0"),
        &suite(&[("foo", Status::Bad)]),
        &results.join("24.10.0/x86/64"),
    )
    .expect("write");
    let pair = results.join("artifacts/packages/foo-1.0.ipk");
    fs::create_dir_all(pair.join("nested")).expect("mkdir");
    fs::write(pair.join("origin"), "a").expect("write origin");
    fs::write(pair.join("rebuild"), "b").expect("write rebuild");
    fs::create_dir_all(results.join("artifacts/images/img.bin")).expect("mkdir");
    fs::write(results.join("artifacts/images/img.bin/origin"), "c").expect("write image");

    combine(&results, &output, &store, &build(), &CombineOptions::default()).expect("combine");

    let copied = output.join("artifacts/packages/foo-1.0.ipk");
    assert_eq!(fs::read_to_string(copied.join("origin")).expect("origin"), "a");
    assert_eq!(fs::read_to_string(copied.join("rebuild")).expect("rebuild"), "b");
    // only regular files of a pair are copied
    assert!(!copied.join("nested").exists());
    assert!(output.join("artifacts/images/img.bin/origin").is_file());

    // artifact dirs are not runs
    let data = collect_results(&results).expect("collect");
    assert_eq!(data.keys().collect::<Vec<_>>(), vec!["24.10.0"]);
}
