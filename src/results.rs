//! Result persistence and end-of-run reporting.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::plan::base_image_names;
use crate::process::CommandError;
use crate::scheduler::TestSuiteRun;
use crate::state::{SuiteState, TestStatus};

/// One line of `results.json`.
#[derive(Debug, Serialize)]
struct ResultRecord<'a> {
    id: &'a str,
    time: DateTime<Utc>,
    name: &'a str,
    vm_count: usize,
    variant: &'a str,
    base_images: Vec<String>,
    status: &'a str,
    score: u32,
    duration_ns: u64,
}

/// Write newline-delimited JSON records, one per run that produced a result.
///
/// Skipped runs have no result and canceled runs say nothing about the test,
/// so neither appears in the file.
pub fn save_results_json(
    suite: &TestSuiteRun,
    start_time: DateTime<Utc>,
    state: &SuiteState,
) -> Result<()> {
    let path = suite.out_dir.join("results.json");
    info!(path = %path.display(), "saving results as JSON");
    let mut file = File::create(&path).with_context(|| format!("create {}", path.display()))?;

    for run in &suite.runs {
        let Some(result) = state.run_results.get(&run.test_id) else {
            continue;
        };
        if result.status == TestStatus::Canceled {
            continue;
        }

        let record = ResultRecord {
            id: &run.test_id,
            // all records carry the suite start time, as one data point per run
            time: start_time,
            name: &run.test_name,
            vm_count: run.vms.len(),
            variant: &run.variant.name,
            base_images: base_image_names(run),
            status: result.status.as_str(),
            score: result.status.score(),
            duration_ns: result.exec_time.as_nanos() as u64,
        };
        let mut line = serde_json::to_string(&record).context("encode result record")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
    }

    file.sync_all().context("sync results.json")
}

/// Number of planned runs that did not reach `Success`.
///
/// Runs without a result (skipped) count as failed: the plan was not
/// completed.
pub fn count_failed(suite: &TestSuiteRun, state: &SuiteState) -> usize {
    suite
        .runs
        .iter()
        .filter(|run| {
            !matches!(
                state.run_results.get(&run.test_id),
                Some(result) if result.status == TestStatus::Success
            )
        })
        .count()
}

/// Log the accumulated errors, optionally with the stderr of every failed
/// subprocess found in the error chains.
pub fn report_errors(state: &SuiteState, error_details: bool) {
    if state.errors.is_empty() {
        info!("STATUS: all tests succeeded");
        return;
    }

    warn!("ERROR: printing all errors");
    for (index, error) in state.errors.iter().enumerate() {
        warn!("ERROR {index}: {error:#}");
        if error_details {
            dump_stderr(error);
        }
    }
}

fn dump_stderr(error: &anyhow::Error) {
    for cause in error.chain() {
        if let Some(cmd_error) = cause.downcast_ref::<CommandError>() {
            warn!(
                "ERROR DETAILS: stderr of `{}`:",
                cmd_error.argv.join(" ")
            );
            eprint!("{}", String::from_utf8_lossy(&cmd_error.stderr));
        }
    }
}

/// CI artifact browse URL of a directory, when running under CI.
pub fn browse_url(dir: &Path) -> Option<String> {
    let job_url = std::env::var("CI_JOB_URL").ok()?;
    let project_dir = std::env::var("CI_PROJECT_DIR").ok()?;
    browse_url_from(&job_url, &project_dir, dir)
}

fn browse_url_from(job_url: &str, project_dir: &str, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(project_dir).ok()?;
    Some(format!("{job_url}/artifacts/browse/{}", relative.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OnFailure, TestSpecification, Variant, Vm, VmSpecification};
    use crate::plan::TestRun;
    use crate::state::TestResult;
    use std::path::PathBuf;
    use std::time::Duration;

    fn suite_with_runs(out_dir: PathBuf) -> TestSuiteRun {
        let vm = Vm {
            base_image: "b0".to_string(),
            ..Vm::default()
        };
        let run = |id: &str| TestRun {
            test_name: "t".to_string(),
            test_id: id.to_string(),
            out_dir: out_dir.join("log").join(id),
            vms: vec![vm.clone()],
            networks: Vec::new(),
            variant: Variant {
                name: "default".to_string(),
                ..Variant::default()
            },
        };
        let runs = vec![
            run("t-1-default-0"),
            run("t-1-default-1"),
            run("t-1-default-2"),
        ];
        TestSuiteRun {
            vm_spec: VmSpecification {
                vms: vec![vm.clone()],
                ..VmSpecification::default()
            },
            test_spec: TestSpecification::default(),
            overrides: Vec::new(),
            out_dir,
            runs,
            start_vm: 5,
            nr_vms: 2,
            on_failure: OnFailure::Continue,
            quiet: true,
            pull_template: None,
            first_v4_net: "10.224.0.0/24".parse().expect("v4"),
            first_v6_net: "fd62:a80c:412::/64".parse().expect("v6"),
        }
    }

    #[test]
    fn excludes_skipped_and_canceled_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let suite = suite_with_runs(temp.path().to_path_buf());
        let mut state = SuiteState::new(&suite);

        let mut success = TestResult::new(TestStatus::Success);
        success.exec_time = Duration::from_secs(2);
        state
            .run_results
            .insert("t-1-default-0".to_string(), success);
        state.run_results.insert(
            "t-1-default-1".to_string(),
            TestResult::new(TestStatus::Canceled),
        );
        // t-1-default-2 skipped: no result

        save_results_json(&suite, Utc::now(), &state).expect("save");

        let contents =
            std::fs::read_to_string(suite.out_dir.join("results.json")).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(record["id"], "t-1-default-0");
        assert_eq!(record["status"], "SUCCESS");
        assert_eq!(record["score"], 1);
        assert_eq!(record["vm_count"], 1);
        assert_eq!(record["base_images"][0], "b0");
        assert_eq!(record["duration_ns"], 2_000_000_000u64);

        assert_eq!(count_failed(&suite, &state), 2);
    }

    #[test]
    fn browse_url_requires_matching_prefix() {
        assert_eq!(
            browse_url_from(
                "https://ci.example.com/jobs/1",
                "/builds/proj",
                Path::new("/builds/proj/out/log/t-1-default-0"),
            )
            .as_deref(),
            Some("https://ci.example.com/jobs/1/artifacts/browse/out/log/t-1-default-0")
        );
        assert_eq!(
            browse_url_from(
                "https://ci.example.com/jobs/1",
                "/builds/proj",
                Path::new("/elsewhere/out"),
            ),
            None
        );
    }
}
