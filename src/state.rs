//! Mutable resource state shared by the decision loop and action updates.
//!
//! The aggregate is owned by the scheduler task. Actions never touch it from
//! their execution tasks; they reserve in `pre` and settle in `post`, both of
//! which run on the scheduler, so no locking is involved.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::config::NetworkSpec;
use crate::scheduler::TestSuiteRun;
use crate::subnet::SubnetPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    /// Creation in flight; at most one network is in this stage at a time.
    Add,
    Ready,
    /// Held by exactly one run or provisioning build.
    Busy,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStage {
    None,
    Provision,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    New,
    Exec,
    Done,
}

/// Final classification of one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Skipped,
    Success,
    Canceled,
    FailedTimeout,
    Failed,
    /// The run never reached the suite execution (VM start failed, ...).
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Skipped => "SKIPPED",
            TestStatus::Success => "SUCCESS",
            TestStatus::Canceled => "CANCELED",
            TestStatus::FailedTimeout => "FAILED_TIMEOUT",
            TestStatus::Failed => "FAILED",
            TestStatus::Error => "ERROR",
        }
    }

    /// The score recorded in results.json: 1 for success, 0 otherwise.
    pub fn score(&self) -> u32 {
        match self {
            TestStatus::Success => 1,
            _ => 0,
        }
    }
}

/// Outcome of one test run.
#[derive(Debug)]
pub struct TestResult {
    pub status: TestStatus,
    pub exec_time: Duration,
    pub error: Option<anyhow::Error>,
    /// Scheduler-side log of the run (VM lifecycle, timings).
    pub framework_log: String,
    /// Combined output of the suite execution inside the VMs.
    pub tool_log: String,
}

impl TestResult {
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            exec_time: Duration::ZERO,
            error: None,
            framework_log: String::new(),
            tool_log: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct NetworkState {
    pub spec: NetworkSpec,
    pub is_access: bool,
    pub stage: NetworkStage,
    /// Subnets reserved for this network's DHCP ranges; returned to the pool
    /// when the network is removed.
    pub v4_net: Option<ipnet::IpNet>,
    pub v6_net: Option<ipnet::IpNet>,
}

/// The scheduler's view of every scarce resource.
pub struct SuiteState {
    /// Network name → state, including networks currently being created.
    pub networks: HashMap<String, NetworkState>,
    /// Base image name → lifecycle stage.
    pub base_images: HashMap<String, ImageStage>,
    /// Per-VM provisioned image ID → lifecycle stage.
    pub vm_images: HashMap<String, ImageStage>,
    pub run_stages: HashMap<String, RunStage>,
    pub run_results: HashMap<String, TestResult>,
    /// VM slot IDs not assigned to any in-flight action, ascending.
    pub free_ids: BTreeSet<u32>,
    pub subnets: SubnetPool,
    pub errors: Vec<anyhow::Error>,
}

impl SuiteState {
    pub fn new(suite: &TestSuiteRun) -> Self {
        let mut run_stages = HashMap::new();
        for run in &suite.runs {
            run_stages.insert(run.test_id.clone(), RunStage::New);
        }

        let initial_base = if suite.pull_template.is_some() {
            ImageStage::None
        } else {
            ImageStage::Ready
        };
        let initial_vm_image = if suite.vm_spec.provisions() {
            ImageStage::None
        } else {
            ImageStage::Ready
        };

        let mut base_images = HashMap::new();
        let mut vm_images = HashMap::new();
        for vm in &suite.vm_spec.vms {
            base_images.insert(vm.base_image.clone(), initial_base);
            vm_images.insert(vm.id().to_string(), initial_vm_image);
        }

        let free_ids = (suite.start_vm..suite.start_vm + suite.nr_vms).collect();

        Self {
            networks: HashMap::new(),
            base_images,
            vm_images,
            run_stages,
            run_results: HashMap::new(),
            free_ids,
            subnets: SubnetPool::new(suite.first_v4_net, suite.first_v6_net),
            errors: Vec::new(),
        }
    }

    pub fn run_stage(&self, test_id: &str) -> RunStage {
        self.run_stages
            .get(test_id)
            .copied()
            .unwrap_or(RunStage::New)
    }

    pub fn base_image_stage(&self, image: &str) -> ImageStage {
        self.base_images
            .get(image)
            .copied()
            .unwrap_or(ImageStage::None)
    }

    pub fn vm_image_stage(&self, id: &str) -> ImageStage {
        self.vm_images.get(id).copied().unwrap_or(ImageStage::None)
    }

    /// Take the `n` smallest free IDs. Stable selection keeps repeated runs
    /// on the same slots, which aids debugging.
    pub fn take_free_ids(&self, n: usize) -> Vec<u32> {
        self.free_ids.iter().copied().take(n).collect()
    }

    pub fn remove_ids(&mut self, ids: &[u32]) {
        for id in ids {
            self.free_ids.remove(id);
        }
    }

    pub fn return_ids(&mut self, ids: &[u32]) {
        for id in ids {
            self.free_ids.insert(*id);
        }
    }

    pub fn set_network_stage(&mut self, name: &str, stage: NetworkStage) {
        if let Some(network) = self.networks.get_mut(name) {
            network.stage = stage;
        }
    }
}
