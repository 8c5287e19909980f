use crate::chain::runner::ChainRunner;
use crate::chain::suite::SuiteCatalog;
use crate::config::settings::HarnessConfig;
use crate::config::types::EnvError;
use crate::env::registry::{EnvStatus, Registry};
use crate::safety::process::SystemProbe;
use crate::toolchain::GitToolchain;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "TESTBOX_CONFIG")]
    config: Option<PathBuf>,
    /// More diagnostic output (repeat for debug and trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Root data directory holding every environment
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove all environments, rebuild the foundation, run every suite
    RunAll,
    /// Run one suite, provisioning its prerequisites first
    Run {
        /// Suite name, or a sequential suite's number
        suite: String,
    },
    /// Rebuild the shared foundation environment only
    Foundation,
    /// Remove all environments
    Clean,
    /// Show marker and lock state of every environment
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Provision a suite's environment and print shell exports binding it
    Env {
        suite: String,
    },
}

extern "C" fn signal_handler(sig: i32) {
    // Async-signal-safe only: raw write and _exit. The kernel drops our flocks and the
    // `started` markers left behind make the next run rebuild.
    let msg = b"testbox: signal received, exiting\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn init_logging(level: log::LevelFilter) {
    // RUST_LOG still wins over -v
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
}

fn print_status(envs: &[EnvStatus], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(envs).context("encoding status")?;
        println!("{}", out);
        return Ok(());
    }
    for env in envs {
        let mut header = format!("{} ({})", env.name, env.kind);
        if !env.exists {
            header.push_str(" absent");
        }
        if let Some(generation) = &env.generation {
            header.push_str(&format!(" generation {}", generation));
        }
        println!("{}", header);
        for unit in &env.units {
            let owner = unit
                .lock_owner
                .map(|pid| format!(" locked by {}", pid))
                .unwrap_or_default();
            println!(
                "  {:<24} {:<10} {}{}",
                unit.unit,
                format!("{:?}", unit.markers).to_lowercase(),
                unit.verdict,
                owner
            );
        }
    }
    Ok(())
}

fn build_runner(cli: &Cli) -> std::result::Result<ChainRunner, EnvError> {
    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    config.verbosity = config.verbosity.max(cli.verbose);
    init_logging(config.log_level());
    config.validate()?;

    let catalog = SuiteCatalog::discover(&config.suites_dir, &config.suite_runner)?;
    let registry = Registry::new(
        config,
        catalog,
        Arc::new(GitToolchain::new()),
        Arc::new(SystemProbe::from_env()),
    );
    Ok(ChainRunner::new(registry))
}

fn fail(err: EnvError) -> ! {
    eprintln!("testbox: {}", err);
    std::process::exit(i32::from(&err));
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    let cli = Cli::parse();
    let runner = build_runner(&cli).unwrap_or_else(|e| fail(e));
    let registry = runner.registry();

    match &cli.command {
        Commands::RunAll => {
            let report = runner.run_all().unwrap_or_else(|e| fail(e));
            eprintln!("{}", report);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Run { suite } => {
            runner.run(suite).unwrap_or_else(|e| fail(e));
        }
        Commands::Foundation => {
            registry.rebuild_foundation().unwrap_or_else(|e| fail(e));
            eprintln!(
                "Foundation rebuilt at {}",
                registry.config().root_dir.join("foundation").display()
            );
        }
        Commands::Clean => {
            let report = registry.clean_all().unwrap_or_else(|e| fail(e));
            eprintln!("Removed {} environments", report.removed.len());
            if let Err(e) = report.into_result() {
                fail(e);
            }
        }
        Commands::Status { json } => {
            let envs = registry.status().unwrap_or_else(|e| fail(e));
            print_status(&envs, *json)?;
        }
        Commands::Env { suite } => {
            let env = registry.prepare(suite).unwrap_or_else(|e| fail(e));
            eprintln!("Environment {} ready at {}", env.name(), env.repo().display());
            print!("{}", registry.load(&env).shell_exports());
        }
    }
    Ok(())
}
