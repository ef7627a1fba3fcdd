use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use openwrt_rebuilder::compare::{CompareContext, compare_build};
use openwrt_rebuilder::config::{self, ConfigDoc, Overrides, RebuildConfig};
use openwrt_rebuilder::diffoscope::{ContainerDiffoscope, plan_diff_requests, run_diff_requests};
use openwrt_rebuilder::fetch::{DirOrigin, HttpOrigin, OriginSource};
use openwrt_rebuilder::history::{BuildInfo, HistoryStore};
use openwrt_rebuilder::model::Category;
use openwrt_rebuilder::parsers::{checksum_directory, render_checksums};
use openwrt_rebuilder::report::combine::CombineOptions;
use openwrt_rebuilder::report::{self, OutputMeta, load_output, write_output};
use openwrt_rebuilder::workspace::{WorkspacePaths, load_paths};
use openwrt_rebuilder::{Error, Result};

const DEFAULT_CONFIG: &str = "rebuilder.toml";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Build definition TOML (defaults to ./rebuilder.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compare a finished build tree against the published release
    Compare {
        /// Target to compare, e.g. x86/64 (or x86-64)
        #[arg(long)]
        target: Option<String>,
        /// OpenWrt version, e.g. SNAPSHOT or 24.10.0
        #[arg(long)]
        openwrt_version: Option<String>,
        /// Snapshot version code, e.g. r28532-abc123
        #[arg(long, env = "VERSION_CODE")]
        version_code: Option<String>,
        /// Read origin manifests from a local mirror of the release dir
        #[arg(long)]
        origin_dir: Option<PathBuf>,
        /// Parallel diffoscope jobs (0 = CPU count + 1)
        #[arg(long)]
        jobs: Option<usize>,
        /// Skip diffoscope for unreproducible artifacts
        #[arg(long)]
        no_diffoscope: bool,
    },
    /// Merge per-run results into the published layout and update history
    Combine {
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        history_dir: Option<PathBuf>,
        /// Remove previously published diffoscope reports and artifacts
        #[arg(long)]
        clean: bool,
    },
    /// Print the stored history of a version as JSON
    History {
        #[arg(value_name = "VERSION")]
        logical_version: String,
        #[arg(long)]
        history_dir: Option<PathBuf>,
    },
    /// List (or run) the diffs needed for a run output dir
    DiffRequests {
        /// Dir holding stats.json / packages.json / images.json
        run_dir: PathBuf,
        /// bin/ dir of the rebuilt tree
        #[arg(long)]
        bin_dir: Option<PathBuf>,
        /// Run diffoscope instead of only listing
        #[arg(long)]
        run: bool,
    },
    /// Print a sha256sums manifest for every file under a directory
    Checksums {
        dir: PathBuf,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Load and validate the configuration, then print it
    Validate {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        openwrt_version: Option<String>,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(args) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let doc = load_doc(args.config.as_deref())?;
    match args.cmd {
        Command::Compare {
            target,
            openwrt_version,
            version_code,
            origin_dir,
            jobs,
            no_diffoscope,
        } => {
            let overrides = Overrides {
                target,
                version: openwrt_version,
                jobs,
                no_diffoscope,
            };
            cmd_compare(&doc, &overrides, version_code, origin_dir.as_deref())
        }
        Command::Combine {
            results_dir,
            output_dir,
            history_dir,
            clean,
        } => {
            let cfg = RebuildConfig::from_doc(&doc, &Overrides::default())?;
            let mut paths = load_paths(&cfg.workspace, &cfg.version)?;
            if let Some(p) = results_dir {
                paths.results_dir = p;
            }
            if let Some(p) = output_dir {
                if history_dir.is_none() && cfg.workspace.history_dir.is_none() {
                    paths.history_dir = p.clone();
                }
                paths.output_dir = p;
            }
            if let Some(p) = history_dir {
                paths.history_dir = p;
            }
            cmd_combine(&paths, clean)
        }
        Command::History {
            logical_version: version,
            history_dir,
        } => {
            let cfg = RebuildConfig::from_doc(&doc, &Overrides::default())?;
            let dir = match history_dir {
                Some(p) => p,
                None => load_paths(&cfg.workspace, &version)?.history_dir,
            };
            let history = HistoryStore::new(dir).load(&version);
            let body = serde_json::to_string_pretty(&history)?;
            println!("{body}");
            Ok(())
        }
        Command::DiffRequests {
            run_dir,
            bin_dir,
            run,
        } => {
            let cfg = RebuildConfig::from_doc(&doc, &Overrides::default())?;
            let bin_dir = match bin_dir {
                Some(p) => p,
                None => load_paths(&cfg.workspace, &cfg.version)?.bin_dir(),
            };
            cmd_diff_requests(&cfg, &run_dir, &bin_dir, run)
        }
        Command::Checksums { dir, prefix } => {
            let manifest = checksum_directory(&dir)?;
            print!("{}", render_checksums(&manifest, &prefix));
            Ok(())
        }
        Command::Validate {
            target,
            openwrt_version,
        } => {
            let overrides = Overrides {
                target,
                version: openwrt_version,
                ..Default::default()
            };
            let cfg = RebuildConfig::from_doc(&doc, &overrides)?;
            cfg.validate()?;
            println!("config:     {}", doc.path.display());
            println!("target:     {}", cfg.target);
            println!("version:    {}", cfg.version);
            println!("branch:     {}", cfg.branch());
            println!("git:        {}", cfg.openwrt_git());
            println!("origin:     {}", cfg.origin_target_url(""));
            println!("jobs:       {}", cfg.jobs);
            println!("diffoscope: {}", cfg.diffoscope.enabled);
            Ok(())
        }
    }
}

fn load_doc(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => config::load(p),
        None if Path::new(DEFAULT_CONFIG).is_file() => config::load(Path::new(DEFAULT_CONFIG)),
        None => Ok(ConfigDoc::empty()),
    }
}

fn cmd_compare(
    doc: &ConfigDoc,
    overrides: &Overrides,
    version_code: Option<String>,
    origin_dir: Option<&Path>,
) -> Result<()> {
    let cfg = RebuildConfig::from_doc(doc, overrides)?;
    cfg.validate()?;
    let paths = load_paths(&cfg.workspace, &cfg.version)?;
    info!("comparing {} @ {}", cfg.target, cfg.version);
    let version_code = match version_code {
        Some(code) if !cfg.is_snapshot() => {
            warn!("ignoring version code {code}: {} is a release", cfg.version);
            None
        }
        other => other,
    };

    let origin: Box<dyn OriginSource> = match origin_dir {
        Some(dir) => Box::new(DirOrigin::new(dir)),
        None => Box::new(HttpOrigin::new(cfg.origin_release_url(""))?),
    };
    let meta = OutputMeta::now(&cfg.target, &cfg.version).with_version_code(version_code);
    let ctx = CompareContext::from_config(&cfg).with_built_at(meta.generated_at.clone());
    let suite = compare_build(&ctx, &paths.bin_dir(), origin.as_ref())?;
    if suite.is_empty() {
        return Err(Error::msg(format!(
            "no artifacts found under {}",
            paths.bin_dir().display()
        )));
    }

    let run_dir = paths.run_results_dir(&meta.version_key(), &cfg.target)?;
    if cfg.diffoscope.enabled {
        let requests = plan_diff_requests(&suite, &paths.bin_dir(), &run_dir.join("diffoscope"));
        if requests.is_empty() {
            info!("no unreproducible artifacts to diff");
        } else {
            let tool = ContainerDiffoscope::new(&cfg.diffoscope)?;
            run_diff_requests(&tool, &requests, cfg.jobs);
        }
    }

    let stats_path = write_output(&meta, &suite, &run_dir)?;
    info!("results written to {}", stats_path.display());
    for category in Category::ALL {
        let s = suite.results(category).stats();
        info!(
            "{}: {} GOOD, {} BAD, {} UNKNOWN",
            category.as_str(),
            s.good,
            s.bad,
            s.unknown
        );
    }
    Ok(())
}

fn cmd_combine(paths: &WorkspacePaths, clean: bool) -> Result<()> {
    let store = HistoryStore::new(&paths.history_dir);
    let build = BuildInfo::from_environment();
    let opts = CombineOptions {
        clean_previous: clean,
    };
    let stats = report::combine(&paths.results_dir, &paths.output_dir, &store, &build, &opts)?;
    if stats.total() == 0 {
        return Err(Error::msg(format!(
            "no results found in {}",
            paths.results_dir.display()
        )));
    }
    Ok(())
}

fn cmd_diff_requests(cfg: &RebuildConfig, run_dir: &Path, bin_dir: &Path, run: bool) -> Result<()> {
    let out = load_output(run_dir)?;
    let requests = plan_diff_requests(&out.suite, bin_dir, &run_dir.join("diffoscope"));
    if !run {
        for r in &requests {
            println!(
                "{:<8} {}  {}  -> {}",
                r.category.as_str(),
                r.origin_url,
                r.rebuilt_path.display(),
                r.report_path.display()
            );
        }
        return Ok(());
    }
    if requests.is_empty() {
        info!("nothing to diff in {}", run_dir.display());
        return Ok(());
    }
    let tool = ContainerDiffoscope::new(&cfg.diffoscope)?;
    let report = run_diff_requests(&tool, &requests, cfg.jobs);
    if !report.failed.is_empty() {
        warn!("{} diff(s) failed", report.failed.len());
    }
    Ok(())
}
