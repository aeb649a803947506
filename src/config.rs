//! VM and test specifications loaded from TOML.
//!
//! Both files are written by humans and must stay stable: missing fields get
//! defaults, unknown combinations are rejected by `validate()` before any VM
//! is touched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// Default timeout for a single suite execution inside the VMs.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 5 * 60;
/// Default timeout for one provisioning build.
pub const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 3 * 60;

/// What to do when a test run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OnFailure {
    /// Run the remaining tests regardless.
    Continue,
    /// Stop dispatching and cancel in-flight work.
    Terminate,
    /// Stop like `terminate`, but preserve VMs and networks for post-mortem.
    KeepVms,
}

/// The VM specification file (`--vms`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmSpecification {
    /// Suffix used when composing provisioned image names.
    pub name: String,

    /// Provisioning script; when absent, base images are used directly.
    pub provision_file: Option<PathBuf>,

    pub provision_timeout: Option<u64>,
    pub provision_boot_capacity: Option<String>,
    pub provision_memory: Option<String>,
    pub provision_cpus: Option<u32>,

    pub vms: Vec<Vm>,
}

impl VmSpecification {
    /// Whether a provisioning step stands between base images and tests.
    pub fn provisions(&self) -> bool {
        self.provision_file.is_some()
    }

    pub fn provision_timeout_secs(&self) -> u64 {
        self.provision_timeout
            .unwrap_or(DEFAULT_PROVISION_TIMEOUT_SECS)
    }

    /// Name of the image a VM boots from: the provisioned derivative if a
    /// provision file is configured, the base image otherwise.
    pub fn image_name(&self, vm: &Vm) -> String {
        if self.provisions() {
            format!("{}-{}", vm.id(), self.name)
        } else {
            vm.base_image.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vms.is_empty() {
            return Err(anyhow!("vms.toml declares no VMs"));
        }
        if self.provisions() && self.name.is_empty() {
            return Err(anyhow!("provision_file requires a non-empty name"));
        }
        for vm in &self.vms {
            if vm.base_image.is_empty() {
                return Err(anyhow!("VM without base_image"));
            }
        }
        Ok(())
    }
}

/// One VM descriptor from the VM specification.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Vm {
    pub name: Option<String>,
    pub base_image: String,
    pub values: BTreeMap<String, String>,
    pub memory: String,
    pub vcpus: u32,
    pub boot_capacity: String,
    pub disks: Vec<String>,
    pub vm_tags: Vec<String>,
    pub user_name: Option<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self {
            name: None,
            base_image: String::new(),
            values: BTreeMap::new(),
            memory: "4G".to_string(),
            vcpus: 2,
            boot_capacity: "10G".to_string(),
            disks: Vec::new(),
            vm_tags: Vec::new(),
            user_name: None,
        }
    }
}

impl Vm {
    /// Stable key for the per-VM provisioned image.
    pub fn id(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.base_image)
    }

    /// Whether this VM carries every required tag.
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.vm_tags.contains(tag))
    }
}

/// The test specification file (`--tests`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestSpecification {
    pub test_suite_file: PathBuf,
    /// Timeout in seconds for a single suite execution.
    pub test_timeout: Option<u64>,
    /// Directories copied off every VM after the suite ran.
    pub artifacts: Vec<String>,
    pub variants: Vec<Variant>,
    /// Named extra-network specs referenced from `tests.*.networks`.
    pub networks: BTreeMap<String, NetworkSpec>,
    pub tests: BTreeMap<String, Test>,
}

impl Default for TestSpecification {
    fn default() -> Self {
        Self {
            test_suite_file: PathBuf::from("run.toml"),
            test_timeout: None,
            artifacts: Vec::new(),
            variants: Vec::new(),
            networks: BTreeMap::new(),
            tests: BTreeMap::new(),
        }
    }
}

impl TestSpecification {
    pub fn test_timeout_secs(&self) -> u64 {
        self.test_timeout.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS)
    }

    /// The declared variants, or the implicit default variant.
    pub fn effective_variants(&self) -> Vec<Variant> {
        if self.variants.is_empty() {
            vec![Variant {
                name: "default".to_string(),
                ..Variant::default()
            }]
        } else {
            self.variants.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            return Err(anyhow!("tests.toml declares no tests"));
        }
        for (name, test) in &self.tests {
            if test.vms.is_empty() {
                return Err(anyhow!("test {name} declares no VM counts"));
            }
            if test.vms.iter().any(|&count| count == 0) {
                return Err(anyhow!("test {name} declares a zero VM count"));
            }
            for network in &test.networks {
                if !self.networks.contains_key(network) {
                    return Err(anyhow!("test {name} references unknown network {network}"));
                }
            }
            for variant in &test.variants {
                if !self
                    .effective_variants()
                    .iter()
                    .any(|v| &v.name == variant)
                {
                    return Err(anyhow!("test {name} references unknown variant {variant}"));
                }
            }
        }
        Ok(())
    }
}

/// A named set of values passed to the test suite; may also filter base
/// images via `vm_tags`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Variant {
    pub name: String,
    pub variables: BTreeMap<String, String>,
    pub ipv6: bool,
    pub vm_tags: Vec<String>,
}

/// One test entry.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Test {
    /// VM counts to run this test with; one set of runs per count.
    pub vms: Vec<usize>,
    pub vm_tags: Vec<String>,
    /// All VMs of a run use one randomly drawn image.
    pub samevms: bool,
    /// One run per matching base image.
    pub needallplatforms: bool,
    /// Restrict to these variants; empty admits all.
    pub variants: Vec<String>,
    /// Names of extra networks from the top-level `networks` table.
    pub networks: Vec<String>,
}

/// Parameters of a virtual network as passed to the external tool.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkSpec {
    pub forward: String,
    pub ipv6: bool,
    pub dhcp: bool,
    pub domain: String,
}

impl NetworkSpec {
    /// The NAT network carrying control-plane SSH traffic to all VMs.
    pub fn access(ipv6: bool) -> Self {
        Self {
            forward: "nat".to_string(),
            ipv6,
            dhcp: true,
            domain: "test".to_string(),
        }
    }
}

pub fn load_vm_spec(path: &Path) -> Result<VmSpecification> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut spec: VmSpecification =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    spec.provision_file = spec
        .provision_file
        .map(|file| join_if_rel(path, &file))
        .filter(|file| !file.as_os_str().is_empty());
    spec.validate()?;
    Ok(spec)
}

pub fn load_test_spec(path: &Path) -> Result<TestSpecification> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut spec: TestSpecification =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    spec.test_suite_file = join_if_rel(path, &spec.test_suite_file);
    spec.validate()?;
    Ok(spec)
}

/// Resolve a path relative to the directory of the spec file naming it.
fn join_if_rel(spec_path: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return path.to_path_buf();
    }
    match spec_path.parent() {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

/// Restrict the VM list to the requested base images.
///
/// An empty include list admits everything; excludes are applied afterwards.
pub fn filter_vms(vms: &[Vm], base_images: &[String], exclude: &[String]) -> Vec<Vm> {
    vms.iter()
        .filter(|vm| base_images.is_empty() || base_images.contains(&vm.base_image))
        .filter(|vm| !exclude.contains(&vm.base_image))
        .cloned()
        .collect()
}
