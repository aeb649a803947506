//! Execution of a single test run: VM lifecycle, suite execution, artifacts.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OnFailure;
use crate::plan::TestRun;
use crate::process::{self, OutputPaths, deadline_token};
use crate::results::browse_url;
use crate::scheduler::TestSuiteRun;
use crate::state::{TestResult, TestStatus};
use crate::virter;
use crate::{junit, virter::vm_name};

/// Timeout for cleanup commands that run after the suite finished.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Framework log of one run: collected for `report.log` and duplicated to
/// the process log unless `--quiet` is set.
struct RunLog {
    test_id: String,
    quiet: bool,
    buf: String,
}

impl RunLog {
    fn new(test_id: &str, quiet: bool) -> Self {
        Self {
            test_id: test_id.to_string(),
            quiet,
            buf: String::new(),
        }
    }

    fn append(&mut self, line: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        self.buf.push_str(&format!("{stamp} {line}\n"));
        if !self.quiet {
            info!(id = %self.test_id, "{line}");
        }
    }
}

/// One VM slot of a run, fully resolved.
struct VmInstance {
    name: String,
    id: u32,
    image: String,
    memory: String,
    vcpus: u32,
    boot_capacity: String,
    disks: Vec<String>,
}

/// Run the test and produce its report block and result.
///
/// Does not touch shared state; everything it needs arrives by value or
/// behind the suite reference, and the outcome travels back on the action.
pub async fn perform_test(
    suite: &TestSuiteRun,
    run: &TestRun,
    ids: &[u32],
    network_names: &[String],
    token: &CancellationToken,
) -> (String, TestResult) {
    let started = Instant::now();
    let mut log = RunLog::new(&run.test_id, suite.quiet);
    let mut result = execute_run(suite, run, ids, network_names, token, &mut log).await;
    result.exec_time = started.elapsed();
    log.append(&format!(
        "EXECUTIONTIME: {}, {:.2?}",
        run.test_id, result.exec_time
    ));
    result.framework_log = log.buf;

    let report = render_report(run, &result);
    write_run_artifacts(suite, run, &result, &report);
    (report, result)
}

async fn execute_run(
    suite: &TestSuiteRun,
    run: &TestRun,
    ids: &[u32],
    network_names: &[String],
    token: &CancellationToken,
    log: &mut RunLog,
) -> TestResult {
    let access_network = &network_names[0];
    let extra_networks = &network_names[1..];
    let instances: Vec<VmInstance> = run
        .vms
        .iter()
        .zip(ids)
        .map(|(vm, &id)| VmInstance {
            name: vm_name(id),
            id,
            image: suite.vm_spec.image_name(vm),
            memory: vm.memory.clone(),
            vcpus: vm.vcpus,
            boot_capacity: vm.boot_capacity.clone(),
            disks: vm.disks.clone(),
        })
        .collect();

    log.append(&format!(
        "EXECUTING: {} with IDs {:?} on networks {:?}",
        run.test_id, ids, network_names
    ));

    if let Err(err) = std::fs::create_dir_all(&run.out_dir) {
        let mut result = TestResult::new(TestStatus::Error);
        result.error =
            Some(anyhow!(err).context(format!("create run directory {}", run.out_dir.display())));
        return result;
    }

    let start = Instant::now();
    let result = match start_vms(run, &instances, access_network, extra_networks, token).await {
        Ok(()) => {
            log.append(&format!(
                "EXECUTIONTIME: starting VMs: {:.2?}",
                start.elapsed()
            ));
            exec_suite(suite, run, &instances, access_network, token, log).await
        }
        Err(err) => {
            let mut result = TestResult::new(TestStatus::Error);
            result.error = Some(err.context(format!("start VMs for {}", run.test_id)));
            result
        }
    };

    copy_artifacts(suite, run, &instances, access_network, log).await;

    let keep = suite.on_failure == OnFailure::KeepVms && result.status != TestStatus::Success;
    if keep {
        log.append("keeping VMs for inspection, remove them with \"virter vm rm\" when done");
    } else {
        shutdown_vms(run, &instances, access_network, log).await;
    }

    match result.status {
        TestStatus::Success => log.append(&format!("SUCCESS: {}", run.test_id)),
        status => log.append(&format!("{}: {}", status.as_str(), run.test_id)),
    }
    if let Some(err) = &result.error {
        log.append(&format!("ERROR: {err:#}"));
    }
    result
}

/// Start all VMs of the run concurrently; the first failure wins.
async fn start_vms(
    run: &TestRun,
    instances: &[VmInstance],
    access_network: &str,
    extra_networks: &[String],
    token: &CancellationToken,
) -> Result<()> {
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for instance in instances {
        let rm_argv = virter::vm_rm_args(&instance.name);
        let run_argv = virter::vm_run_args(&virter::VmRunOpts {
            name: instance.name.clone(),
            id: instance.id,
            console_dir: &run.out_dir,
            memory: &instance.memory,
            vcpus: instance.vcpus,
            boot_capacity: &instance.boot_capacity,
            disks: &instance.disks,
            extra_networks,
            image: &instance.image,
        });
        let log_path = run.out_dir.join(format!("vm_run_{}.log", instance.name));
        let access = access_network.to_string();
        let token = token.clone();
        tasks.spawn(async move {
            // stale VM from an aborted earlier run; removal is idempotent
            process::run_cmd(&rm_argv, virter::command(&rm_argv, &access), &token).await?;
            let paths = OutputPaths::stderr_only(log_path);
            process::run_cmd_with_logs(&run_argv, virter::command(&run_argv, &access), &token, &paths)
                .await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("join VM start task").and_then(|res| res);
        if let Err(err) = outcome {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Execute the suite file inside the VMs and classify the outcome.
async fn exec_suite(
    suite: &TestSuiteRun,
    run: &TestRun,
    instances: &[VmInstance],
    access_network: &str,
    token: &CancellationToken,
    log: &mut RunLog,
) -> TestResult {
    let variables: Vec<(String, String)> = run
        .variant
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let names: Vec<String> = instances.iter().map(|vm| vm.name.clone()).collect();
    let argv = virter::vm_exec_args(
        &suite.test_spec.test_suite_file,
        &run.test_name,
        &run.out_dir,
        &suite.overrides,
        &variables,
        &names,
    );

    log.append(&format!("EXECUTING the actual test: {}", argv.join(" ")));
    let start = Instant::now();
    let timeout = Duration::from_secs(suite.test_spec.test_timeout_secs());
    let deadline = deadline_token(token, timeout);
    let (exec_result, output) =
        process::run_cmd_combined(&argv, virter::command(&argv, access_network), &deadline).await;
    log.append(&format!(
        "EXECUTIONTIME: {} {:.2?}",
        run.test_id,
        start.elapsed()
    ));

    let mut result = match exec_result {
        Ok(()) => TestResult::new(TestStatus::Success),
        Err(err) => {
            let status = if token.is_cancelled() {
                TestStatus::Canceled
            } else if deadline.is_cancelled() {
                TestStatus::FailedTimeout
            } else {
                TestStatus::Failed
            };
            let mut result = TestResult::new(status);
            result.error = Some(err.context(format!("{}: test failed", run.test_id)));
            result
        }
    };
    result.tool_log = String::from_utf8_lossy(&output).into_owned();
    result
}

/// Copy the declared artifact directories off every VM.
///
/// Runs even when the suite failed; the artifacts are usually exactly what
/// is needed to understand the failure. Copy errors do not change the test
/// outcome.
async fn copy_artifacts(
    suite: &TestSuiteRun,
    run: &TestRun,
    instances: &[VmInstance],
    access_network: &str,
    log: &mut RunLog,
) {
    for instance in instances {
        for artifact in &suite.test_spec.artifacts {
            let dst = run.out_dir.join(&instance.name);
            if let Err(err) = std::fs::create_dir_all(&dst) {
                log.append(&format!("WARNING: create {}: {err}", dst.display()));
                continue;
            }
            let argv = virter::vm_cp_args(&instance.name, artifact, &dst);
            let token = deadline_token(&CancellationToken::new(), CLEANUP_TIMEOUT);
            if let Err(err) =
                process::run_cmd(&argv, virter::command(&argv, access_network), &token).await
            {
                log.append(&format!(
                    "WARNING: copy artifact {artifact} from {}: {err:#}",
                    instance.name
                ));
            }
        }
    }
}

/// Remove the run's VMs, continuing past individual failures.
async fn shutdown_vms(
    run: &TestRun,
    instances: &[VmInstance],
    access_network: &str,
    log: &mut RunLog,
) {
    for instance in instances {
        let argv = virter::vm_rm_args(&instance.name);
        let paths = OutputPaths::stderr_only(
            run.out_dir.join(format!("vm_rm_{}.log", instance.name)),
        );
        let token = deadline_token(&CancellationToken::new(), CLEANUP_TIMEOUT);
        if let Err(err) = process::run_cmd_with_logs(
            &argv,
            virter::command(&argv, access_network),
            &token,
            &paths,
        )
        .await
        {
            log.append(&format!("ERROR: could not stop VM {}: {err:#}", instance.name));
        }
    }
    log.append("waited for VMs");
}

fn render_report(run: &TestRun, result: &TestResult) -> String {
    let mut report = String::new();
    report.push_str(
        "===========================================================================\n",
    );
    report.push_str(&format!(
        "| ** Results for {} - {}\n",
        run.test_id,
        result.status.as_str()
    ));
    if let Some(url) = browse_url(&run.out_dir) {
        report.push_str(&format!("| ** {url}\n"));
    }
    report.push_str(
        "===========================================================================\n",
    );
    report.push_str(&result.framework_log);
    report.push_str(&format!("END Results for {}\n", run.test_id));
    report
}

/// Persist the per-run logs and the XML record.
fn write_run_artifacts(suite: &TestSuiteRun, run: &TestRun, result: &TestResult, report: &str) {
    for (name, contents) in [("test.log", result.tool_log.as_str()), ("report.log", report)] {
        let path = run.out_dir.join(name);
        if let Err(err) = write_log(&path, contents) {
            warn!(id = %run.test_id, "failed to write {name}: {err:#}");
        }
    }

    let results_dir = suite.out_dir.join("test-results");
    if let Err(err) = junit::write_xml_log(&results_dir, &run.test_id, result) {
        warn!(id = %run.test_id, "failed to write XML log: {err:#}");
    }
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
