//! Scheduler actions and their three-phase contract.
//!
//! The set of actions is closed, so they are a plain enum dispatched by
//! match. `pre` and `post` run on the scheduler task and are the only places
//! that touch [`SuiteState`]; `execute` runs concurrently and stores its
//! outcome on the action itself, which travels back to the scheduler over the
//! completion channel by ownership.

use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{NetworkSpec, Vm};
use crate::plan::TestRun;
use crate::scheduler::TestSuiteRun;
use crate::state::{ImageStage, NetworkStage, NetworkState, RunStage, SuiteState, TestResult};
use crate::test_exec;
use crate::virter;

pub enum Action {
    AddNetwork(AddNetworkAction),
    PullImage(PullImageAction),
    ProvisionImage(ProvisionImageAction),
    PerformTest(PerformTestAction),
}

pub struct AddNetworkAction {
    pub network_name: String,
    pub spec: NetworkSpec,
    pub is_access: bool,
    pub v4_net: Option<IpNet>,
    pub v6_net: Option<IpNet>,
    pub error: Option<anyhow::Error>,
}

pub struct PullImageAction {
    pub image: String,
    pub error: Option<anyhow::Error>,
}

pub struct ProvisionImageAction {
    pub vm: Vm,
    pub id: u32,
    pub network_name: String,
    pub error: Option<anyhow::Error>,
}

pub struct PerformTestAction {
    pub run: TestRun,
    pub ids: Vec<u32>,
    /// Access network first, then the extra networks in declaration order.
    pub network_names: Vec<String>,
    pub report: String,
    pub result: Option<TestResult>,
}

impl Action {
    /// Diagnostic label.
    pub fn name(&self) -> String {
        match self {
            Action::AddNetwork(a) => format!("Add network {}", a.network_name),
            Action::PullImage(a) => format!("Pull base image '{}'", a.image),
            Action::ProvisionImage(a) => {
                format!("Provision image {} with ID {}", a.vm.id(), a.id)
            }
            Action::PerformTest(a) => {
                format!("Test {} with IDs {:?}", a.run.test_id, a.ids)
            }
        }
    }

    /// Reserve resources before the action starts. Runs on the scheduler.
    ///
    /// Failure leaves the touched resource in `Error`, which stops the loop.
    pub fn apply_pre(&mut self, state: &mut SuiteState) -> Result<()> {
        match self {
            Action::AddNetwork(a) => {
                state.networks.insert(
                    a.network_name.clone(),
                    NetworkState {
                        spec: a.spec.clone(),
                        is_access: a.is_access,
                        stage: NetworkStage::Add,
                        v4_net: None,
                        v6_net: None,
                    },
                );
                if a.spec.dhcp {
                    a.v4_net = Some(reserve_subnet(state, &a.network_name, false)?);
                    if a.spec.ipv6 {
                        a.v6_net = Some(reserve_subnet(state, &a.network_name, true)?);
                    }
                    if let Some(network) = state.networks.get_mut(&a.network_name) {
                        network.v4_net = a.v4_net;
                        network.v6_net = a.v6_net;
                    }
                }
            }
            Action::PullImage(a) => {
                state
                    .base_images
                    .insert(a.image.clone(), ImageStage::Provision);
            }
            Action::ProvisionImage(a) => {
                state
                    .vm_images
                    .insert(a.vm.id().to_string(), ImageStage::Provision);
                state.free_ids.remove(&a.id);
                state.set_network_stage(&a.network_name, NetworkStage::Busy);
            }
            Action::PerformTest(a) => {
                state
                    .run_stages
                    .insert(a.run.test_id.clone(), RunStage::Exec);
                state.remove_ids(&a.ids);
                for network_name in &a.network_names {
                    state.set_network_stage(network_name, NetworkStage::Busy);
                }
            }
        }
        Ok(())
    }

    /// Perform the real work. Runs concurrently with other executes; the
    /// outcome lands on the action itself.
    pub async fn execute(&mut self, suite: &TestSuiteRun, token: &CancellationToken) {
        match self {
            Action::AddNetwork(a) => {
                let dhcp_count = if a.is_access { suite.nr_vms } else { 0 };
                a.error = virter::add_network(
                    &suite.out_dir,
                    &a.network_name,
                    &a.spec,
                    a.v4_net.as_ref(),
                    a.v6_net.as_ref(),
                    suite.start_vm,
                    dhcp_count,
                    token,
                )
                .await
                .err();
            }
            Action::PullImage(a) => {
                a.error = virter::pull_image(
                    &suite.out_dir,
                    &a.image,
                    suite.pull_template.as_deref(),
                    token,
                )
                .await
                .err();
            }
            Action::ProvisionImage(a) => {
                a.error = virter::provision_image(suite, a.id, &a.vm, &a.network_name, token)
                    .await
                    .err();
            }
            Action::PerformTest(a) => {
                let (report, result) =
                    test_exec::perform_test(suite, &a.run, &a.ids, &a.network_names, token).await;
                a.report = report;
                a.result = Some(result);
            }
        }
    }

    /// Apply the outcome to the state. Runs on the scheduler.
    pub fn apply_post(self, state: &mut SuiteState) {
        match self {
            Action::AddNetwork(a) => match a.error {
                None => state.set_network_stage(&a.network_name, NetworkStage::Ready),
                Some(err) => {
                    // The network may partially exist; keep the subnets
                    // reserved until teardown removes it.
                    state.set_network_stage(&a.network_name, NetworkStage::Error);
                    state
                        .errors
                        .push(err.context(format!("add network {}", a.network_name)));
                }
            },
            Action::PullImage(a) => match a.error {
                None => {
                    state.base_images.insert(a.image, ImageStage::Ready);
                }
                Some(err) => {
                    state
                        .errors
                        .push(err.context(format!("pull image {}", a.image)));
                    state.base_images.insert(a.image, ImageStage::Error);
                }
            },
            Action::ProvisionImage(a) => {
                state.set_network_stage(&a.network_name, NetworkStage::Ready);
                state.free_ids.insert(a.id);
                match a.error {
                    None => {
                        info!(image = a.vm.id(), "STATUS: successfully provisioned");
                        state
                            .vm_images
                            .insert(a.vm.id().to_string(), ImageStage::Ready);
                    }
                    Some(err) => {
                        state
                            .vm_images
                            .insert(a.vm.id().to_string(), ImageStage::Error);
                        state
                            .errors
                            .push(err.context(format!("provision {}", a.vm.id())));
                    }
                }
            }
            Action::PerformTest(a) => {
                let mut result = a
                    .result
                    .unwrap_or_else(|| TestResult::new(crate::state::TestStatus::Error));
                info!(
                    id = %a.run.test_id,
                    status = result.status.as_str(),
                    "RESULT"
                );
                print!("{}", a.report);

                state.run_stages.insert(a.run.test_id.clone(), RunStage::Done);
                if let Some(err) = result.error.take() {
                    result.error = Some(anyhow!("{err:#}"));
                    state.errors.push(err.context(a.run.test_id.clone()));
                }
                state.run_results.insert(a.run.test_id.clone(), result);
                for network_name in &a.network_names {
                    state.set_network_stage(network_name, NetworkStage::Ready);
                }
                state.return_ids(&a.ids);
            }
        }
    }
}

fn reserve_subnet(state: &mut SuiteState, network_name: &str, ipv6: bool) -> Result<IpNet> {
    match state.subnets.reserve_next(ipv6) {
        Ok(net) => Ok(net),
        Err(err) => {
            state.set_network_stage(network_name, NetworkStage::Error);
            Err(err).with_context(|| format!("reserve subnet for {network_name}"))
        }
    }
}
