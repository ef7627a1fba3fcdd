//! Hand unreproducible artifacts to a diff tool.
//!
//! The comparison core only decides *which* pairs need a diff. Running the
//! tool is behind [`DiffTool`]; the stock implementation fetches the origin
//! file and runs diffoscope in a container.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::compare::diff_report_name;
use crate::config::DiffoscopeConfig;
use crate::error::{Error, Result};
use crate::model::{Category, Suite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRequest {
    pub category: Category,
    pub filename: String,
    pub origin_url: String,
    pub rebuilt_path: PathBuf,
    pub report_path: PathBuf,
}

/// One request per unreproducible result (images first, then packages).
/// `rebuilt_root` is the build's `bin/` dir, which mirrors the release dir
/// layout on the origin server.
pub fn plan_diff_requests(suite: &Suite, rebuilt_root: &Path, report_dir: &Path) -> Vec<DiffRequest> {
    let mut out = Vec::new();
    for (category, r) in suite.unreproducible() {
        let Some(rel) = r.file() else {
            warn!(name = %r.name, "unreproducible result has no file path, no diff");
            continue;
        };
        let filename = rel.rsplit('/').next().unwrap_or(rel).to_string();
        let report = r
            .diffoscope_url
            .clone()
            .unwrap_or_else(|| diff_report_name(&filename));
        out.push(DiffRequest {
            category,
            origin_url: r.artifact_url.clone(),
            rebuilt_path: rebuilt_root.join(rel),
            report_path: report_dir.join(report),
            filename,
        });
    }
    out
}

pub trait DiffTool: Sync {
    fn diff(&self, req: &DiffRequest) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffReport {
    pub attempted: usize,
    pub ok: usize,
    pub failed: Vec<String>,
}

/// Run every request with at most `jobs` in flight. Failures are logged and
/// reported, never propagated.
pub fn run_diff_requests(tool: &dyn DiffTool, requests: &[DiffRequest], jobs: usize) -> DiffReport {
    let workers = jobs.max(1).min(requests.len().max(1));
    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, Result<()>)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            scope.spawn(move || {
                loop {
                    let i = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(req) = requests.get(i) else {
                        break;
                    };
                    if tx.send((i, tool.diff(req))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut results: Vec<(usize, Result<()>)> = rx.into_iter().collect();
    results.sort_by_key(|(i, _)| *i);

    let mut report = DiffReport {
        attempted: results.len(),
        ..Default::default()
    };
    for (i, res) in results {
        match res {
            Ok(()) => report.ok += 1,
            Err(e) => {
                let name = &requests[i].filename;
                warn!("diff failed for {name}: {e}");
                report.failed.push(name.clone());
            }
        }
    }
    info!(
        attempted = report.attempted,
        ok = report.ok,
        failed = report.failed.len(),
        "diffoscope finished"
    );
    report
}

/// diffoscope in a container (podman or docker).
pub struct ContainerDiffoscope {
    cfg: DiffoscopeConfig,
    client: reqwest::blocking::Client,
}

impl ContainerDiffoscope {
    pub fn new(cfg: &DiffoscopeConfig) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            client: crate::fetch::client(Duration::from_secs(300))?,
        })
    }

    pub fn command(&self, origin: &Path, rebuilt: &Path, report: &Path) -> Result<Command> {
        let dir_of = |p: &Path| -> Result<PathBuf> {
            p.parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::msg(format!("path {} has no parent", p.display())))
        };
        let name_of = |p: &Path| -> Result<String> {
            p.file_name()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .ok_or_else(|| Error::msg(format!("path {} has no file name", p.display())))
        };

        let mut cmd = Command::new(&self.cfg.runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/origin:ro", dir_of(origin)?.display()))
            .arg("-v")
            .arg(format!("{}:/rebuild:ro", dir_of(rebuilt)?.display()))
            .arg("-v")
            .arg(format!("{}:/out", dir_of(report)?.display()))
            .arg(&self.cfg.image)
            .arg(format!("/origin/{}", name_of(origin)?))
            .arg(format!("/rebuild/{}", name_of(rebuilt)?))
            .arg("--html")
            .arg(format!("/out/{}", name_of(report)?));
        Ok(cmd)
    }

    fn run_with_timeout(&self, mut cmd: Command) -> Result<()> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {}: {e}", self.cfg.runtime)))?;
        let deadline = Instant::now() + Duration::from_secs(self.cfg.timeout_secs.max(1));
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // diffoscope exits 1 when it found differences.
                    return match status.code() {
                        Some(0) | Some(1) => Ok(()),
                        _ => Err(Error::msg(format!("diffoscope exited with {status}"))),
                    };
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::msg(format!(
                        "diffoscope timed out after {}s",
                        self.cfg.timeout_secs
                    )));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(200)),
                Err(e) => return Err(Error::msg(format!("failed to wait for diffoscope: {e}"))),
            }
        }
    }
}

impl DiffTool for ContainerDiffoscope {
    fn diff(&self, req: &DiffRequest) -> Result<()> {
        if !req.rebuilt_path.is_file() {
            return Err(Error::msg(format!(
                "rebuilt file {} is missing",
                req.rebuilt_path.display()
            )));
        }
        let work = tempfile::tempdir()
            .map_err(|e| Error::msg(format!("failed to create temp dir: {e}")))?;
        let origin = work.path().join(&req.filename);
        crate::fetch::fetch_to_file(&self.client, &req.origin_url, &origin)?;
        if let Some(parent) = req.report_path.parent() {
            crate::report::ensure_dir(parent)?;
        }
        let cmd = self.command(&origin, &req.rebuilt_path, &req.report_path)?;
        self.run_with_timeout(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildResult, Status};
    use std::sync::Mutex;

    fn bad(name: &str, file: &str) -> BuildResult {
        let mut r = BuildResult::new(name, "1.0", "x86_64", "SNAPSHOT", Status::Bad);
        r.artifact_url = format!("https://downloads.openwrt.org/snapshots/{file}");
        r.files = vec![file.to_string()];
        r.diffoscope_url = Some(diff_report_name(file.rsplit('/').next().unwrap_or(file)));
        r
    }

    #[test]
    fn plans_images_before_packages() {
        let mut suite = Suite::default();
        suite.add_result(Category::Packages, bad("foo", "packages/x86_64/base/foo-1.0.ipk"));
        suite.add_result(Category::Images, bad("img", "targets/x86/64/img.bin"));
        suite.add_result(
            Category::Packages,
            BuildResult::new("ok", "1.0", "x86_64", "SNAPSHOT", Status::Good),
        );

        let reqs = plan_diff_requests(&suite, Path::new("/b/bin"), Path::new("/r/diffoscope"));
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].category, Category::Images);
        assert_eq!(reqs[0].rebuilt_path, PathBuf::from("/b/bin/targets/x86/64/img.bin"));
        assert_eq!(reqs[1].filename, "foo-1.0.ipk");
        assert_eq!(reqs[1].report_path, PathBuf::from("/r/diffoscope/foo-1.0.ipk.html"));
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl DiffTool for Recorder {
        fn diff(&self, req: &DiffRequest) -> Result<()> {
            self.seen
                .lock()
                .map_err(|_| Error::msg("poisoned"))?
                .push(req.filename.clone());
            if req.filename.starts_with("broken") {
                return Err(Error::msg("tool failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn pool_runs_every_request_and_counts_failures() {
        let reqs: Vec<DiffRequest> = ["a.ipk", "broken.ipk", "c.ipk", "d.ipk", "e.ipk"]
            .iter()
            .map(|f| DiffRequest {
                category: Category::Packages,
                filename: f.to_string(),
                origin_url: String::new(),
                rebuilt_path: PathBuf::from(f),
                report_path: PathBuf::from(format!("{f}.html")),
            })
            .collect();
        let tool = Recorder {
            seen: Mutex::new(Vec::new()),
        };
        let report = run_diff_requests(&tool, &reqs, 3);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.ok, 4);
        assert_eq!(report.failed, vec!["broken.ipk".to_string()]);
        let mut seen = tool.seen.into_inner().expect("lock");
        seen.sort();
        assert_eq!(seen.len(), 5);

        assert_eq!(run_diff_requests(&tool_noop(), &[], 4), DiffReport::default());
    }

    struct Noop;

    impl DiffTool for Noop {
        fn diff(&self, _req: &DiffRequest) -> Result<()> {
            Ok(())
        }
    }

    fn tool_noop() -> Noop {
        Noop
    }

    #[test]
    fn container_command_mounts_each_side() {
        let tool = ContainerDiffoscope::new(&DiffoscopeConfig::default()).expect("tool");
        let cmd = tool
            .command(
                Path::new("/tmp/w/foo.ipk"),
                Path::new("/b/bin/packages/foo.ipk"),
                Path::new("/r/diffoscope/foo.ipk.html"),
            )
            .expect("command");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "podman");
        assert!(args.contains(&"/tmp/w:/origin:ro".to_string()));
        assert!(args.contains(&"/b/bin/packages:/rebuild:ro".to_string()));
        assert!(args.contains(&"/r/diffoscope:/out".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/out/foo.ipk.html"));
    }
}
