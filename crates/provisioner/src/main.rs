use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use provisioner::error::Error;
use provisioner::executor::RunContext;
use provisioner::manifest::{self, LoadOptions};
use provisioner::report::Reporter;
use provisioner::transport::{Environment, select, venv_pip_path};
use provisioner::{Result, engine};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a manifest, then print the per-resource fetch plan
    Plan {
        /// Path to a provisioning manifest TOML
        manifest: PathBuf,
        /// Base install path (defaults to the manifest's directory)
        #[arg(long)]
        install_path: Option<PathBuf>,
        /// Enable an optional resource group (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,
        /// Virtual environment path (defaults to <install-path>/venv)
        #[arg(long)]
        venv_path: Option<PathBuf>,
    },
    /// Fetch and install everything the manifest names
    Run {
        /// Path to a provisioning manifest TOML
        manifest: PathBuf,
        /// Base install path (defaults to the manifest's directory)
        #[arg(long)]
        install_path: Option<PathBuf>,
        /// Virtual environment path (defaults to <install-path>/venv)
        #[arg(long)]
        venv_path: Option<PathBuf>,
        /// Enable an optional resource group (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,
        /// Max concurrent data-file fetches (0 = manifest setting)
        #[arg(long, default_value_t = 0)]
        max_parallel: usize,
        /// Probe and report without fetching anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Plan {
            manifest,
            install_path,
            groups,
            venv_path,
        } => cmd_plan(&manifest, install_path, groups, venv_path),
        Command::Run {
            manifest,
            install_path,
            venv_path,
            groups,
            max_parallel,
            dry_run,
        } => cmd_run(
            &manifest,
            install_path,
            venv_path,
            groups,
            max_parallel,
            dry_run,
        ),
    }
}

fn load_opts(install_path: Option<PathBuf>, groups: Vec<String>) -> LoadOptions {
    LoadOptions {
        install_root: install_path,
        groups: groups.into_iter().collect::<BTreeSet<_>>(),
    }
}

fn cmd_plan(
    path: &PathBuf,
    install_path: Option<PathBuf>,
    groups: Vec<String>,
    venv_path: Option<PathBuf>,
) -> Result<()> {
    let opts = load_opts(install_path, groups);
    let m = manifest::load(path, &opts)?;
    let venv = venv_path.unwrap_or_else(|| m.settings.install_root.join("venv"));
    let env = Environment::detect(Some(&venv));

    for (i, desc) in m.resources.iter().enumerate() {
        let transport = match select(desc, &env) {
            Ok(plan) => plan.describe(),
            Err(e) => format!("unavailable: {e}"),
        };
        println!(
            "{:>2}. {:<28} {:<15} {}",
            i + 1,
            desc.name,
            desc.kind().as_str(),
            transport
        );
        println!("    -> {}", desc.destination.display());
    }
    Ok(())
}

fn cmd_run(
    path: &PathBuf,
    install_path: Option<PathBuf>,
    venv_path: Option<PathBuf>,
    groups: Vec<String>,
    max_parallel: usize,
    dry_run: bool,
) -> Result<()> {
    let opts = load_opts(install_path, groups);
    let mut m = manifest::load(path, &opts)?;
    if max_parallel > 0 {
        m.settings.max_parallel = max_parallel;
    }

    let venv = venv_path.unwrap_or_else(|| m.settings.install_root.join("venv"));
    if m.has_python_packages() && !venv_pip_path(&venv).is_file() {
        // Python installs share one venv; without it the run cannot proceed.
        return Err(Error::msg(format!(
            "virtual environment not found at {} (required by python packages in the manifest)",
            venv.display()
        )));
    }

    let reporter = Arc::new(Reporter::create(&m.settings.log_dir)?);
    let ctx = RunContext::new(dry_run, m.settings.retry_bound, reporter.clone());
    install_cancel_handler(&ctx);

    reporter.line(&format!(
        "RUN: {} ({} resources, install root {})",
        m.path.display(),
        m.resources.len(),
        m.settings.install_root.display()
    ));

    let mut env = Environment::detect(Some(&venv));
    // Per-resource failures stay exit 0; only preconditions are fatal.
    engine::run(&m, &mut env, &ctx)?;
    Ok(())
}

#[cfg(unix)]
fn install_cancel_handler(ctx: &RunContext) {
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicBool;

    static CANCEL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn on_sigint(_sig: libc::c_int) {
        if let Some(flag) = CANCEL_FLAG.get() {
            flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    if CANCEL_FLAG.set(ctx.cancel.clone()).is_ok() {
        let handler: extern "C" fn(libc::c_int) = on_sigint;
        unsafe {
            libc::signal(libc::SIGINT, handler as usize);
        }
    }
}

#[cfg(not(unix))]
fn install_cancel_handler(_ctx: &RunContext) {}
