//! vmshed: run a test matrix in short-lived virter VMs.
//!
//! Expands the test specification into concrete runs, locks the VM slot
//! range, and hands everything to the scheduler. Exit code is 0 iff every
//! planned run succeeded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use ipnet::{Ipv4Net, Ipv6Net};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmshed::config::{self, OnFailure, VmSpecification};
use vmshed::plan::{self, PlanOptions, base_image_names};
use vmshed::scheduler::{self, TestSuiteRun};
use vmshed::{locks, logging, process, results, virter};

#[derive(Parser)]
#[command(name = "vmshed", version, about = "Run tests in VMs")]
struct Cli {
    /// File containing the VM specification.
    #[arg(long, default_value = "vms.toml")]
    vms: PathBuf,

    /// File containing the test specification.
    #[arg(long, default_value = "tests.toml")]
    tests: PathBuf,

    /// Set or override provisioning values, e.g. '--set values.X=y'.
    #[arg(long, short = 's')]
    set: Vec<String>,

    /// VM base images to use (defaults to all).
    #[arg(long)]
    base_image: Vec<String>,

    /// VM base images to exclude.
    #[arg(long)]
    exclude_base_image: Vec<String>,

    /// Comma separated list of test names to execute ('all' runs everything).
    #[arg(long, default_value = "all")]
    torun: String,

    /// Number of times to repeat each test, expecting success on every attempt.
    #[arg(long, default_value_t = 1)]
    repeats: usize,

    /// Number of the first VM to start in parallel.
    #[arg(long, default_value_t = 2)]
    startvm: u32,

    /// Maximum number of VMs to start in parallel, starting at --startvm.
    #[arg(long, default_value_t = 12)]
    nvms: u32,

    /// What to do when a test fails.
    #[arg(long, value_enum, default_value_t = OnFailure::Continue)]
    on_failure: OnFailure,

    /// Directory for logs and results.
    #[arg(long, default_value = "tests-out")]
    out_dir: PathBuf,

    /// Variants to run (defaults to all).
    #[arg(long)]
    variant: Vec<String>,

    /// First IPv4 subnet to use for DHCP-enabled networks.
    #[arg(long, default_value = "10.224.0.0/24")]
    first_subnet: Ipv4Net,

    /// First IPv6 subnet to use for DHCP-enabled networks.
    #[arg(long, default_value = "fd62:a80c:412::/64")]
    first_v6_subnet: Ipv6Net,

    /// Template for the source URL of base image pulls; '{{ image }}' is
    /// replaced with the image name.
    #[arg(long)]
    pull_template: Option<String>,

    /// Seed for the base image assignment, for reproducible plans.
    #[arg(long)]
    seed: Option<u64>,

    /// Don't print progress messages while tests are running.
    #[arg(long)]
    quiet: bool,

    /// Dump subprocess stderr when printing errors at the end.
    #[arg(long)]
    error_details: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.quiet);

    match run(cli).await {
        Ok(failed) => std::process::exit(if failed > 0 { 1 } else { 0 }),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<usize> {
    if cli.startvm == 0 {
        bail!("--startvm has to be positive");
    }
    if cli.nvms == 0 {
        bail!("--nvms has to be positive");
    }

    let vm_spec = config::load_vm_spec(&cli.vms)?;
    let vms = config::filter_vms(&vm_spec.vms, &cli.base_image, &cli.exclude_base_image);
    if vms.is_empty() {
        bail!("no VMs remain after applying the base image filters");
    }
    let vm_spec = VmSpecification { vms, ..vm_spec };

    let test_spec = config::load_test_spec(&cli.tests)?;

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("create output directory {}", cli.out_dir.display()))?;

    let to_run = match cli.torun.as_str() {
        "" | "all" => None,
        list => Some(list.split(',').map(String::from).collect()),
    };
    let seed = cli.seed.unwrap_or_else(rand::random);
    info!(seed, "expanding the test matrix");
    let mut rng = StdRng::seed_from_u64(seed);
    let runs = plan::determine_test_runs(
        &mut rng,
        &vm_spec,
        &test_spec,
        &cli.out_dir,
        &PlanOptions {
            to_run,
            variants: cli.variant.clone(),
            repeats: cli.repeats,
        },
    )?;
    if runs.is_empty() {
        bail!("the test plan is empty");
    }
    for run in &runs {
        info!("PLAN: {} on {}", run.test_id, base_image_names(run).join(","));
    }

    // Fail fast when another vmshed already owns part of the ID range.
    let _locks = locks::lock_vm_ids(&std::env::temp_dir(), cli.startvm, cli.nvms)?;

    // First tool invocation generates the tool's SSH key pair; doing it here
    // once avoids concurrent first invocations racing on the key file.
    info!("STAGE: initialize virter");
    let handshake: Vec<String> = ["virter", "image", "ls", "--available"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    process::run_cmd(
        &handshake,
        virter::plain_command(&handshake),
        &CancellationToken::new(),
    )
    .await
    .context("cannot initialize virter")?;

    let suite = Arc::new(TestSuiteRun {
        vm_spec,
        test_spec,
        overrides: cli.set.clone(),
        out_dir: cli.out_dir.clone(),
        runs,
        start_vm: cli.startvm,
        nr_vms: cli.nvms,
        on_failure: cli.on_failure,
        quiet: cli.quiet,
        pull_template: cli.pull_template.clone(),
        first_v4_net: cli.first_subnet,
        first_v6_net: cli.first_v6_subnet,
    });

    let token = CancellationToken::new();
    install_signal_handler(token.clone())?;

    info!("STAGE: execute tests");
    let start_time = Utc::now();
    let started = Instant::now();
    let state = scheduler::run_scheduler(Arc::clone(&suite), &token).await;

    results::report_errors(&state, cli.error_details);
    results::save_results_json(&suite, start_time, &state)?;
    info!(elapsed = ?started.elapsed(), "OVERALL EXECUTIONTIME");

    Ok(results::count_failed(&suite, &state))
}

/// Cancel the suite token on SIGINT or SIGTERM.
fn install_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        warn!("received shutdown signal, canceling all running actions");
        token.cancel();
    });
    Ok(())
}
