//! The decision loop: dispatch as many actions as resources allow, wait for
//! one completion, apply it, repeat.
//!
//! All state mutation happens on this task. Action executions are spawned
//! concurrently and return their action over the completion channel, so
//! `pre` ordering follows dispatch order while `post` ordering follows
//! completion order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use ipnet::{Ipv4Net, Ipv6Net};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{
    Action, AddNetworkAction, PerformTestAction, ProvisionImageAction, PullImageAction,
};
use crate::config::{NetworkSpec, OnFailure, TestSpecification, Vm, VmSpecification};
use crate::plan::TestRun;
use crate::process::deadline_token;
use crate::state::{ImageStage, NetworkStage, RunStage, SuiteState};
use crate::virter;

/// Timeout for each individual teardown command.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// The full, immutable context of one vmshed invocation.
pub struct TestSuiteRun {
    pub vm_spec: VmSpecification,
    pub test_spec: TestSpecification,
    /// `--set` overrides forwarded to provisioning and suite execution.
    pub overrides: Vec<String>,
    pub out_dir: PathBuf,
    pub runs: Vec<TestRun>,
    pub start_vm: u32,
    pub nr_vms: u32,
    pub on_failure: OnFailure,
    pub quiet: bool,
    pub pull_template: Option<String>,
    pub first_v4_net: Ipv4Net,
    pub first_v6_net: Ipv6Net,
}

/// Run the scheduler to completion and tear down created resources.
///
/// The returned state carries the run results and all accumulated errors.
pub async fn run_scheduler(suite: Arc<TestSuiteRun>, token: &CancellationToken) -> SuiteState {
    let mut state = SuiteState::new(&suite);
    schedule_loop(&suite, &mut state, token).await;
    tear_down(&suite, &mut state).await;
    state
}

async fn schedule_loop(
    suite: &Arc<TestSuiteRun>,
    state: &mut SuiteState,
    parent: &CancellationToken,
) {
    let token = parent.child_token();
    let (completions, mut completed) = mpsc::unbounded_channel::<Action>();
    let mut active_actions = 0usize;

    loop {
        while !run_stopping(suite, state) && !token.is_cancelled() {
            let Some(mut action) = choose_next_action(suite, state) else {
                break;
            };
            debug!(action = %action.name(), "SCHEDULE: perform action");
            if let Err(err) = action.apply_pre(state) {
                state.errors.push(err);
                continue;
            }
            active_actions += 1;
            let completions = completions.clone();
            let suite = Arc::clone(suite);
            let token = token.clone();
            tokio::spawn(async move {
                action.execute(&suite, &token).await;
                let _ = completions.send(action);
            });
        }

        if active_actions == 0 {
            for run in &suite.runs {
                if state.run_stage(&run.test_id) != RunStage::Done {
                    state
                        .errors
                        .push(anyhow!("skipped test run: {}", run.test_id));
                }
            }
            break;
        }

        debug!("SCHEDULE: wait for result");
        let Some(action) = completed.recv().await else {
            break;
        };
        active_actions -= 1;
        debug!(action = %action.name(), "SCHEDULE: apply result");
        action.apply_post(state);

        if run_stopping(suite, state) {
            token.cancel();
        }
    }
}

/// Whether the loop should stop dispatching new work.
///
/// A failed network or image is always fatal; a failed test only stops the
/// suite when the failure policy says so.
pub fn run_stopping(suite: &TestSuiteRun, state: &SuiteState) -> bool {
    if suite.on_failure != OnFailure::Continue && !state.errors.is_empty() {
        return true;
    }

    if state
        .networks
        .values()
        .any(|network| network.stage == NetworkStage::Error)
    {
        return true;
    }

    suite.vm_spec.vms.iter().any(|vm| {
        state.base_image_stage(&vm.base_image) == ImageStage::Error
            || state.vm_image_stage(vm.id()) == ImageStage::Error
    })
}

/// Pick the next runnable action, or `None` to go idle.
pub fn choose_next_action(suite: &TestSuiteRun, state: &SuiteState) -> Option<Action> {
    // Ignore IDs held by provisioning when ranking tests: those IDs will
    // return, and counting them would make small tests overtake large ones.
    let non_test_ids = count_non_test_ids(suite, state);

    let mut best_run: Option<&TestRun> = None;
    for run in &suite.runs {
        if state.run_stage(&run.test_id) != RunStage::New {
            continue;
        }
        if non_test_ids < run.vms.len() {
            continue;
        }
        if run_better(state, best_run, run) {
            best_run = Some(run);
        }
    }

    if let Some(run) = best_run {
        if let Some(action) = next_action_run(state, run) {
            return Some(action);
        }
    }

    if state.free_ids.is_empty() {
        return None;
    }

    for vm in &suite.vm_spec.vms {
        if state.base_image_stage(&vm.base_image) == ImageStage::None
            || state.vm_image_stage(vm.id()) == ImageStage::None
        {
            return next_action_provision(state, vm);
        }
    }

    None
}

/// Whether `b` is a better candidate than the current best `a`.
fn run_better(state: &SuiteState, a: Option<&TestRun>, b: &TestRun) -> bool {
    let Some(a) = a else {
        return true;
    };

    // Larger runs first: they pack the available IDs more densely.
    if b.vms.len() < a.vms.len() {
        return false;
    }
    if b.vms.len() > a.vms.len() {
        return true;
    }

    if all_images_ready(state, a) && all_networks_ready(state, a) {
        return false;
    }
    if all_images_ready(state, b) && all_networks_ready(state, b) {
        return true;
    }

    false
}

fn all_images_ready(state: &SuiteState, run: &TestRun) -> bool {
    run.vms.iter().all(|vm| {
        state.base_image_stage(&vm.base_image) == ImageStage::Ready
            && state.vm_image_stage(vm.id()) == ImageStage::Ready
    })
}

fn all_networks_ready(state: &SuiteState, run: &TestRun) -> bool {
    let access = NetworkSpec::access(run.variant.ipv6);
    if find_ready_network(state, &[], &access, true).is_none() {
        return false;
    }
    let (_, remaining) = find_extra_networks(state, run);
    remaining.is_empty()
}

/// Names of ready networks matching the run's extra specs, and the specs for
/// which no network is ready yet.
fn find_extra_networks(state: &SuiteState, run: &TestRun) -> (Vec<String>, Vec<NetworkSpec>) {
    let mut names = Vec::new();
    let mut remaining = Vec::new();
    let mut used = Vec::new();

    for spec in &run.networks {
        match find_ready_network(state, &used, spec, false) {
            Some(name) => {
                used.push(name.clone());
                names.push(name);
            }
            None => remaining.push(spec.clone()),
        }
    }

    (names, remaining)
}

/// The first `Ready` network whose fields match the spec exactly.
fn find_ready_network(
    state: &SuiteState,
    exclude: &[String],
    spec: &NetworkSpec,
    access: bool,
) -> Option<String> {
    for index in 0..state.networks.len() {
        let name = generate_network_name(index, access);
        let Some(network) = state.networks.get(&name) else {
            continue;
        };
        if network.stage != NetworkStage::Ready {
            continue;
        }
        if exclude.contains(&name) {
            continue;
        }
        if network.spec != *spec || network.is_access != access {
            continue;
        }
        return Some(name);
    }
    None
}

fn count_non_test_ids(suite: &TestSuiteRun, state: &SuiteState) -> usize {
    let mut non_test_ids = suite.nr_vms as usize;
    for run in &suite.runs {
        if state.run_stage(&run.test_id) == RunStage::Exec {
            non_test_ids -= run.vms.len();
        }
    }
    non_test_ids
}

fn next_action_run(state: &SuiteState, run: &TestRun) -> Option<Action> {
    if state.free_ids.len() < run.vms.len() {
        return None;
    }
    if !all_images_ready(state, run) {
        return None;
    }

    let access = NetworkSpec::access(run.variant.ipv6);
    let Some(access_name) = find_ready_network(state, &[], &access, true) else {
        return make_add_network_action(state, access, true);
    };

    let (extra_names, remaining) = find_extra_networks(state, run);
    if let Some(missing) = remaining.first() {
        return make_add_network_action(state, missing.clone(), false);
    }

    let ids = state.take_free_ids(run.vms.len());
    let mut network_names = vec![access_name];
    network_names.extend(extra_names);
    Some(Action::PerformTest(PerformTestAction {
        run: run.clone(),
        ids,
        network_names,
        report: String::new(),
        result: None,
    }))
}

fn next_action_provision(state: &SuiteState, vm: &Vm) -> Option<Action> {
    if state.base_image_stage(&vm.base_image) == ImageStage::None {
        return Some(Action::PullImage(PullImageAction {
            image: vm.base_image.clone(),
            error: None,
        }));
    }

    if state.base_image_stage(&vm.base_image) != ImageStage::Ready {
        return None;
    }

    let access = NetworkSpec::access(false);
    let Some(network_name) = find_ready_network(state, &[], &access, true) else {
        return make_add_network_action(state, access, true);
    };

    let ids = state.take_free_ids(1);
    Some(Action::ProvisionImage(ProvisionImageAction {
        vm: vm.clone(),
        id: ids[0],
        network_name,
        error: None,
    }))
}

/// Produce an AddNetwork action, unless one is already in flight.
///
/// The backing tool can generate duplicate bridge names when two networks are
/// created at once, so network creation is serialized process-wide.
fn make_add_network_action(
    state: &SuiteState,
    spec: NetworkSpec,
    is_access: bool,
) -> Option<Action> {
    if state
        .networks
        .values()
        .any(|network| network.stage == NetworkStage::Add)
    {
        return None;
    }

    Some(Action::AddNetwork(AddNetworkAction {
        network_name: generate_network_name(state.networks.len(), is_access),
        spec,
        is_access,
        v4_net: None,
        v6_net: None,
        error: None,
    }))
}

fn generate_network_name(id: usize, access: bool) -> String {
    let network_type = if access { "access" } else { "extra" };
    format!("vmshed-{id}-{network_type}")
}

/// Remove created networks and provisioned images after the loop exits.
///
/// Network removal honors the keep-vms policy; image removal does not, since
/// a half-provisioned image is useless for post-mortem and blocks the next
/// invocation.
async fn tear_down(suite: &TestSuiteRun, state: &mut SuiteState) {
    if !state.errors.is_empty() && suite.on_failure == OnFailure::KeepVms {
        warn!("there were errors, not removing networks");
        info!("use \"virter network rm ...\" to remove networks when done");
    } else {
        let names: Vec<String> = state.networks.keys().cloned().collect();
        for name in names {
            let token = deadline_token(&CancellationToken::new(), TEARDOWN_TIMEOUT);
            if let Err(err) = virter::remove_network(&suite.out_dir, &name, &token).await {
                state
                    .errors
                    .push(err.context(format!("remove network {name}")));
                continue;
            }
            if let Some(network) = state.networks.get_mut(&name) {
                for net in network.v4_net.take().into_iter().chain(network.v6_net.take()) {
                    state.subnets.free(net);
                }
            }
        }
    }

    remove_images(suite).await;
}

async fn remove_images(suite: &TestSuiteRun) {
    if !suite.vm_spec.provisions() {
        return;
    }

    for vm in &suite.vm_spec.vms {
        let image = suite.vm_spec.image_name(vm);
        // "vm rm" first: a failed build can leave its scratch VM running
        for argv in [virter::vm_rm_args(&image), virter::image_rm_args(&image)] {
            let token = deadline_token(&CancellationToken::new(), TEARDOWN_TIMEOUT);
            if let Err(err) =
                crate::process::run_cmd(&argv, virter::plain_command(&argv), &token).await
            {
                warn!(image = %image, "could not remove image: {err:#}");
            }
        }
    }
}
