//! Contract test harness entry point
//!
//! This file is the test binary that runs the endpoint modules against the
//! parking API. The session is opt-in so a plain workspace `cargo test` does
//! not try to build the API:
//!
//!   cargo test --package parkcheck-e2e --test contract -- --run
//!   PARKCHECK_BASE_URL=http://127.0.0.1:8000 cargo test -p parkcheck-e2e --test contract -- --external

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parkcheck_e2e::config::{ENV_BASE_URL, ENV_CONFIG};
use parkcheck_e2e::runner::Interruption;
use parkcheck_e2e::{E2eError, E2eResult, Filter, HarnessConfig, TestRunner};

#[derive(Parser, Debug)]
#[command(name = "parkcheck")]
#[command(about = "Contract test runner for the parking API")]
#[command(ignore_errors = true)]
struct Args {
    /// Run the session (also implied by --config, --base-url or their env vars)
    #[arg(long, env = "PARKCHECK_RUN")]
    run: bool,

    /// TOML configuration file, relative to the workspace root
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the API, e.g. http://127.0.0.1:8000
    #[arg(long)]
    base_url: Option<String>,

    /// Attach to an already running server instead of building and spawning one
    #[arg(long)]
    external: bool,

    /// Port to run the server on
    #[arg(long)]
    port: Option<u16>,

    /// Run only this suite
    #[arg(short, long)]
    suite: Option<String>,

    /// Run only suites with this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Run only cases whose name contains this
    #[arg(short = 'k', long)]
    case: Option<String>,

    /// Path to the endpoint modules directory
    #[arg(long)]
    specs: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn enabled(&self) -> bool {
        self.run
            || self.config.is_some()
            || self.base_url.is_some()
            || std::env::var_os(ENV_CONFIG).is_some()
            || std::env::var_os(ENV_BASE_URL).is_some()
    }

    fn filter(&self) -> Filter {
        Filter {
            suite: self.suite.clone(),
            tag: self.tag.clone(),
            case: self.case.clone(),
        }
    }
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if !args.enabled() {
        info!("Contract session not requested; pass --run or set {} to run it", ENV_BASE_URL);
        return;
    }

    // Run async main
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(2);
        }
    };
    let result = rt.block_on(async_main(args));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Session aborted: {}", e);
            std::process::exit(2);
        }
    }
}

/// Workspace root, two levels above this crate
fn workspace_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest.to_path_buf())
}

fn build_config(args: &Args) -> E2eResult<HarnessConfig> {
    let root = workspace_root();
    let config_path = args.config.as_ref().map(|p| root.join(p));
    let mut config = HarnessConfig::discover(config_path.as_deref())?;

    if let Some(url) = &args.base_url {
        config.set_base_url(url)?;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.external {
        config.server.external = true;
    }
    if let Some(specs) = &args.specs {
        config.specs_dir = specs.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }

    config.validate()?;
    Ok(config.rooted(&root))
}

async fn async_main(args: Args) -> E2eResult<bool> {
    let config = build_config(&args)?;
    let mut runner = TestRunner::with_config(config)?.with_filter(args.filter());
    let mut interruption = Interruption::install()?;

    let outcome = tokio::select! {
        result = runner.run_all() => result,
        signal = interruption.recv() => {
            warn!("{} received, stopping server", signal);
            Err(E2eError::Interrupted)
        }
    };

    // Stop server
    runner.stop_server()?;

    let results = outcome?;

    // Write results
    runner.write_results(&results)?;

    Ok(results.success())
}
