use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::info;

use distri::build::{self, Build, BuildConfig, BuildOutcome};
use distri::fuse::{ctl, Overlay};
use distri::store::Store;
use distri::{batch, env, resolve};

#[derive(Parser)]
#[command(
    name = "distri",
    version,
    about = "package store, overlay filesystem and build sandbox",
    max_term_width = 98
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the overlay filesystem over all installed packages
    Fuse {
        /// Package repository (directory or HTTP URL)
        #[arg(long)]
        repo: Option<String>,
        /// Where to mount the overlay
        #[arg(long, default_value = "/ro")]
        mountpoint: PathBuf,
        /// Control socket path (defaults to the runtime directory)
        #[arg(long)]
        ctl: Option<PathBuf>,
    },
    /// Build one package from its recipe directory
    Build {
        /// Directory containing build.textproto (defaults to `.`)
        pkg_dir: Option<PathBuf>,
        /// Store to resolve against and write images into
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Target architecture
        #[arg(long, default_value = "amd64")]
        arch: String,
        /// Parallelism passed to the build system
        #[arg(long)]
        jobs: Option<usize>,
        /// Build against the host instead of a namespace (for development)
        #[arg(long)]
        no_hermetic: bool,
        /// Spawn an interactive shell after the named stage
        #[arg(long)]
        debug: Option<String>,
        /// Internal: job file of the re-executed sandbox child
        #[arg(long, hide = true)]
        job: Option<PathBuf>,
    },
    /// Build many packages in dependency order
    Batch {
        /// Directory of recipe directories
        #[arg(long)]
        pkgs_dir: Option<PathBuf>,
        #[arg(long)]
        repo: Option<PathBuf>,
        #[arg(long, default_value = "amd64")]
        arch: String,
        /// Concurrent builds
        #[arg(long)]
        workers: Option<usize>,
        /// Only print the plan
        #[arg(long)]
        dry_run: bool,
    },
    /// Ask a running overlay to rescan the store
    Scan {
        #[arg(long, default_value = "/ro")]
        mountpoint: PathBuf,
    },
    /// Check that a running overlay responds
    Ping {
        #[arg(long, default_value = "/ro")]
        mountpoint: PathBuf,
    },
    /// Pre-create a top-level overlay directory
    Mkdir {
        dir: String,
        #[arg(long, default_value = "/ro")]
        mountpoint: PathBuf,
    },
    /// List the identifiers in a store
    Ls {
        #[arg(long)]
        repo: Option<String>,
    },
    /// Resolve partial identifiers to their runtime closure
    Resolve {
        deps: Vec<String>,
        #[arg(long)]
        repo: Option<String>,
    },
}

static SIGNALLED: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(sig: i32) {
    build::CANCELLED.store(true, Ordering::SeqCst);
    if SIGNALLED.swap(sig, Ordering::SeqCst) != 0 {
        // second signal: give up immediately
        unsafe { libc::_exit(128 + sig) };
    }
}

fn install_signal_handlers() {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    install_signal_handlers();

    match run(Cli::parse()) {
        Ok(()) => {
            let sig = SIGNALLED.load(Ordering::SeqCst);
            if sig != 0 {
                std::process::exit(128 + sig);
            }
        }
        Err(e) => {
            eprintln!("distri: {e:#}");
            let sig = SIGNALLED.load(Ordering::SeqCst);
            std::process::exit(if sig != 0 { 128 + sig } else { 1 });
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Fuse { repo, mountpoint, ctl } => {
            let repo = repo.unwrap_or_else(env::default_repo);
            let ctl = ctl.unwrap_or_else(default_ctl_path);
            let store = Arc::new(Store::new(repo));
            let overlay = Arc::new(Overlay::new(store, ctl));
            distri::fuse::mount(overlay, &mountpoint)
                .with_context(|| format!("mounting on {}", mountpoint.display()))?;
            Ok(())
        }

        Command::Build { job: Some(job), .. } => {
            // re-executed child inside the build namespace
            if !env::is_build_process() {
                bail!("--job is internal to the build sandbox");
            }
            build::run_job(&job)?;
            Ok(())
        }

        Command::Build { pkg_dir, repo, arch, jobs, no_hermetic, debug, job: None } => {
            let pkg_dir = match pkg_dir {
                Some(dir) => dir.canonicalize()?,
                None => std::env::current_dir()?,
            };
            let pkg = pkg_dir
                .file_name()
                .and_then(|n| n.to_str())
                .context("cannot derive package name from directory")?
                .to_string();
            let repo = repo.unwrap_or_else(|| env::distri_root().join("build/distri/pkg"));
            let cfg = BuildConfig {
                pkg,
                arch,
                pkg_dir,
                work_dir: env::distri_root().join("build"),
                repo,
                jobs: jobs.unwrap_or_else(default_jobs),
                hermetic: !no_hermetic,
                debug,
            };
            let mut build = Build::new(cfg)?;
            match build.run()? {
                BuildOutcome::Built(images) => {
                    for image in images {
                        println!("{}", image.display());
                    }
                }
                BuildOutcome::CacheHit => info!("unchanged, skipped"),
            }
            Ok(())
        }

        Command::Batch { pkgs_dir, repo, arch, workers, dry_run } => {
            let pkgs_dir = pkgs_dir.unwrap_or_else(|| env::distri_root().join("pkgs"));
            let repo = repo.unwrap_or_else(|| env::distri_root().join("build/distri/pkg"));
            let graph = batch::Graph::from_recipes(&pkgs_dir)?;
            if dry_run {
                let plan = graph.plan();
                for (v, deps) in plan.effective.iter().enumerate() {
                    let deps: Vec<&str> =
                        deps.iter().map(|&d| graph.nodes[d].pkg.as_str()).collect();
                    println!("{} <- {deps:?}", graph.nodes[v].pkg);
                }
                return Ok(());
            }

            let log_dir = env::distri_root().join("build/logs");
            std::fs::create_dir_all(&log_dir)?;
            let exe = std::env::current_exe()?;
            let result =
                batch::run(&graph, workers.unwrap_or_else(default_jobs), |node| {
                    let log = std::fs::File::create(log_dir.join(format!("{}.log", node.pkg)))?;
                    let status = std::process::Command::new(&exe)
                        .arg("build")
                        .arg(&node.pkg_dir)
                        .arg("--repo")
                        .arg(&repo)
                        .arg("--arch")
                        .arg(&arch)
                        .stdout(log.try_clone()?)
                        .stderr(log)
                        .status()?;
                    if !status.success() {
                        return Err(distri::Error::ToolFailed {
                            tool: format!("build of {}", node.pkg),
                            status,
                        });
                    }
                    Ok(())
                });

            println!("{} built, {} failed", result.succeeded.len(), result.failed.len());
            for (pkg, msg) in &result.failed {
                println!("  {pkg}: {msg} (log: {})", log_dir.join(format!("{pkg}.log")).display());
            }
            if !result.failed.is_empty() {
                bail!("{} packages failed", result.failed.len());
            }
            Ok(())
        }

        Command::Scan { mountpoint } => {
            let socket = ctl::socket_for_mountpoint(&mountpoint)?;
            ctl::scan_packages(&socket)?;
            Ok(())
        }

        Command::Ping { mountpoint } => {
            let socket = ctl::socket_for_mountpoint(&mountpoint)?;
            ctl::ping(&socket)?;
            println!("pong");
            Ok(())
        }

        Command::Mkdir { dir, mountpoint } => {
            let socket = ctl::socket_for_mountpoint(&mountpoint)?;
            ctl::mkdir_all(&socket, &dir)?;
            Ok(())
        }

        Command::Ls { repo } => {
            let store = Store::new(repo.unwrap_or_else(env::default_repo));
            for id in store.list()? {
                println!("{id}");
            }
            Ok(())
        }

        Command::Resolve { deps, repo } => {
            let store = Store::new(repo.unwrap_or_else(env::default_repo));
            for id in resolve::glob_and_resolve(&store, &deps, None)? {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_ctl_path() -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join(format!("distrifuse.{}.sock", std::process::id()))
}
