//! Invocation adapters for the external VM-management tool.
//!
//! Each adapter builds an argv as a pure function (so the exact command lines
//! are testable) and runs it through the subprocess layer. All invocations
//! carry the access network in the tool's environment.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use ipnet::IpNet;
use minijinja::{Environment, context};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{NetworkSpec, Vm};
use crate::process::{self, OutputPaths};
use crate::scheduler::TestSuiteRun;
use crate::subnet::gateway_cidr;

pub const TOOL: &str = "virter";

/// Name of the VM with the given slot ID.
pub fn vm_name(id: u32) -> String {
    format!("lbtest-vm-{id}")
}

/// Build a `Command` from an argv, attaching the tool environment.
///
/// `VIRTER_LIBVIRT_NETWORK` selects the access network for DHCP leases and
/// SSH; static DHCP keeps lease handling deterministic across VM restarts.
pub fn command(argv: &[String], access_network: &str) -> Command {
    let mut cmd = plain_command(argv);
    cmd.env("VIRTER_LIBVIRT_NETWORK", access_network);
    cmd.env("VIRTER_LIBVIRT_STATIC_DHCP", "true");
    cmd
}

/// Build a `Command` for invocations that are not tied to a network
/// (network management itself, image pulls, the startup handshake).
pub fn plain_command(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

pub fn add_network_args(
    name: &str,
    spec: &NetworkSpec,
    v4_net: Option<&IpNet>,
    v6_net: Option<&IpNet>,
    dhcp_id: u32,
    dhcp_count: u32,
) -> Vec<String> {
    let mut argv = vec![
        TOOL.to_string(),
        "network".to_string(),
        "add".to_string(),
        name.to_string(),
    ];
    if spec.dhcp {
        let v4 = v4_net.expect("DHCP network requires a reserved IPv4 subnet");
        argv.push("--network-cidr".to_string());
        argv.push(gateway_cidr(v4));
        argv.push("--dhcp".to_string());
        if let Some(v6) = v6_net {
            argv.push("--network-v6-cidr".to_string());
            argv.push(gateway_cidr(v6));
        }
    }
    if !spec.forward.is_empty() {
        argv.push("--forward-mode".to_string());
        argv.push(spec.forward.clone());
    }
    if !spec.domain.is_empty() {
        argv.push("--domain".to_string());
        argv.push(spec.domain.clone());
    }
    if dhcp_count > 0 {
        argv.push("--dhcp-id".to_string());
        argv.push(dhcp_id.to_string());
        argv.push("--dhcp-count".to_string());
        argv.push(dhcp_count.to_string());
    }
    argv
}

pub fn remove_network_args(name: &str) -> Vec<String> {
    vec![
        TOOL.to_string(),
        "network".to_string(),
        "rm".to_string(),
        name.to_string(),
    ]
}

pub fn pull_image_args(image: &str, source: Option<&str>) -> Vec<String> {
    let mut argv = vec![
        TOOL.to_string(),
        "image".to_string(),
        "pull".to_string(),
        image.to_string(),
    ];
    if let Some(source) = source {
        argv.push(source.to_string());
    }
    argv
}

pub fn image_rm_args(name: &str) -> Vec<String> {
    vec![
        TOOL.to_string(),
        "image".to_string(),
        "rm".to_string(),
        name.to_string(),
    ]
}

pub fn vm_rm_args(name: &str) -> Vec<String> {
    vec![
        TOOL.to_string(),
        "vm".to_string(),
        "rm".to_string(),
        name.to_string(),
    ]
}

/// Options for an `image build` provisioning run.
#[derive(Debug)]
pub struct BuildImageOpts<'a> {
    pub id: u32,
    pub provision_file: &'a Path,
    pub console_dir: &'a Path,
    /// `--set` pairs, already in `key=value` form.
    pub sets: Vec<String>,
    pub boot_capacity: Option<&'a str>,
    pub memory: Option<&'a str>,
    pub vcpus: Option<u32>,
    pub user: Option<&'a str>,
}

pub fn build_image_args(opts: &BuildImageOpts<'_>, base_image: &str, new_image: &str) -> Vec<String> {
    let mut argv = vec![
        TOOL.to_string(),
        "image".to_string(),
        "build".to_string(),
        "--id".to_string(),
        opts.id.to_string(),
        "--provision".to_string(),
        opts.provision_file.display().to_string(),
        "--console".to_string(),
        opts.console_dir.display().to_string(),
    ];
    for set in &opts.sets {
        argv.push("--set".to_string());
        argv.push(set.clone());
    }
    if let Some(boot_capacity) = opts.boot_capacity {
        argv.push("--bootcap".to_string());
        argv.push(boot_capacity.to_string());
    }
    if let Some(memory) = opts.memory {
        argv.push("--memory".to_string());
        argv.push(memory.to_string());
    }
    if let Some(vcpus) = opts.vcpus {
        argv.push("--vcpus".to_string());
        argv.push(vcpus.to_string());
    }
    if let Some(user) = opts.user {
        argv.push("--user".to_string());
        argv.push(user.to_string());
    }
    argv.push("--vnc".to_string());
    argv.push("--vnc-bind-ip".to_string());
    argv.push("0.0.0.0".to_string());
    argv.push(base_image.to_string());
    argv.push(new_image.to_string());
    argv
}

/// Options for a `vm run` invocation.
#[derive(Debug)]
pub struct VmRunOpts<'a> {
    pub name: String,
    pub id: u32,
    pub console_dir: &'a Path,
    pub memory: &'a str,
    pub vcpus: u32,
    pub boot_capacity: &'a str,
    pub disks: &'a [String],
    /// Extra networks beyond the access network.
    pub extra_networks: &'a [String],
    pub image: &'a str,
}

pub fn vm_run_args(opts: &VmRunOpts<'_>) -> Vec<String> {
    let mut argv = vec![
        TOOL.to_string(),
        "vm".to_string(),
        "run".to_string(),
        "--name".to_string(),
        opts.name.clone(),
        "--id".to_string(),
        opts.id.to_string(),
        "--console".to_string(),
        opts.console_dir.display().to_string(),
        "--memory".to_string(),
        opts.memory.to_string(),
        "--vcpus".to_string(),
        opts.vcpus.to_string(),
        "--bootcapacity".to_string(),
        opts.boot_capacity.to_string(),
    ];
    for disk in opts.disks {
        argv.push("--disk".to_string());
        argv.push(disk.clone());
    }
    for network in opts.extra_networks {
        argv.push("--nic".to_string());
        argv.push(format!("type=network,source={network}"));
    }
    argv.push("--wait-ssh".to_string());
    argv.push(opts.image.to_string());
    argv
}

/// Argv for executing the test suite inside the given VMs.
pub fn vm_exec_args(
    suite_file: &Path,
    test_name: &str,
    out_dir: &Path,
    overrides: &[String],
    variables: &[(String, String)],
    vm_names: &[String],
) -> Vec<String> {
    let mut argv = vec![
        TOOL.to_string(),
        "vm".to_string(),
        "exec".to_string(),
        "--provision".to_string(),
        suite_file.display().to_string(),
        "--set".to_string(),
        format!("env.TEST_NAME={test_name}"),
        "--set".to_string(),
        format!("values.OutDir={}", out_dir.display()),
    ];
    for over in overrides {
        argv.push("--set".to_string());
        argv.push(over.clone());
    }
    for (key, value) in variables {
        argv.push("--set".to_string());
        argv.push(format!("values.{key}={value}"));
    }
    argv.extend(vm_names.iter().cloned());
    argv
}

pub fn vm_cp_args(vm: &str, src: &str, host_dst: &Path) -> Vec<String> {
    vec![
        TOOL.to_string(),
        "vm".to_string(),
        "cp".to_string(),
        format!("{vm}:{src}"),
        host_dst.display().to_string(),
    ]
}

/// Render the pull template into a concrete image source.
pub fn render_pull_source(template: &str, image: &str) -> Result<String> {
    let env = Environment::new();
    let tmpl = env
        .template_from_str(template)
        .context("parse pull template")?;
    tmpl.render(context! { image => image })
        .context("render pull template")
}

/// Create a network, logging stderr under `network-log/`.
pub async fn add_network(
    out_dir: &Path,
    name: &str,
    spec: &NetworkSpec,
    v4_net: Option<&IpNet>,
    v6_net: Option<&IpNet>,
    dhcp_id: u32,
    dhcp_count: u32,
    token: &CancellationToken,
) -> Result<()> {
    let argv = add_network_args(name, spec, v4_net, v6_net, dhcp_id, dhcp_count);
    let paths = OutputPaths::stderr_only(
        out_dir
            .join("network-log")
            .join(format!("network_add_{name}.log")),
    );
    process::run_cmd_with_logs(&argv, plain_command(&argv), token, &paths).await
}

/// Remove a network, logging stderr under `network-log/`.
pub async fn remove_network(out_dir: &Path, name: &str, token: &CancellationToken) -> Result<()> {
    let argv = remove_network_args(name);
    let paths = OutputPaths::stderr_only(
        out_dir
            .join("network-log")
            .join(format!("network_rm_{name}.log")),
    );
    process::run_cmd_with_logs(&argv, plain_command(&argv), token, &paths).await
}

/// Build the per-VM provisioned image inside a scratch VM.
///
/// The scratch VM is attached to a ready access network; the build runs
/// under the provisioning timeout layered on the suite cancellation.
pub async fn provision_image(
    suite: &TestSuiteRun,
    id: u32,
    vm: &Vm,
    network_name: &str,
    token: &CancellationToken,
) -> Result<()> {
    let new_image = suite.vm_spec.image_name(vm);

    // leftover image from an aborted earlier run; removal is idempotent
    let rm_argv = image_rm_args(&new_image);
    process::run_cmd(&rm_argv, command(&rm_argv, network_name), token).await?;

    let console_dir = suite.out_dir.join("provision-log");
    std::fs::create_dir_all(&console_dir)
        .with_context(|| format!("create {}", console_dir.display()))?;

    let mut sets = suite.overrides.clone();
    for (key, value) in &vm.values {
        sets.push(format!("values.{key}={value}"));
    }
    let provision_file = suite
        .vm_spec
        .provision_file
        .as_deref()
        .context("provision file not configured")?;
    let argv = build_image_args(
        &BuildImageOpts {
            id,
            provision_file,
            console_dir: &console_dir,
            sets,
            boot_capacity: suite.vm_spec.provision_boot_capacity.as_deref(),
            memory: suite.vm_spec.provision_memory.as_deref(),
            vcpus: suite.vm_spec.provision_cpus,
            user: vm.user_name.as_deref(),
        },
        &vm.base_image,
        &new_image,
    );
    let paths = OutputPaths {
        stderr_path: console_dir.join(format!("{new_image}-provision.log")),
        meta_path: Some(console_dir.join(format!("{new_image}-meta.json"))),
    };

    let timeout = Duration::from_secs(suite.vm_spec.provision_timeout_secs());
    let deadline = process::deadline_token(token, timeout);
    let start = Instant::now();
    let result =
        process::run_cmd_with_logs(&argv, command(&argv, network_name), &deadline, &paths).await;
    debug!(image = %new_image, elapsed = ?start.elapsed(), "EXECUTIONTIME: provisioning");

    if token.is_cancelled() {
        bail!("canceled");
    }
    if deadline.is_cancelled() {
        return result.context("timeout");
    }
    result
}

/// Pull a base image, optionally from a rendered template source.
pub async fn pull_image(
    out_dir: &Path,
    image: &str,
    template: Option<&str>,
    token: &CancellationToken,
) -> Result<()> {
    let source = match template {
        Some(template) => Some(render_pull_source(template, image)?),
        None => None,
    };
    let argv = pull_image_args(image, source.as_deref());
    let paths = OutputPaths::stderr_only(
        out_dir
            .join("image-log")
            .join(format!("image_pull_{image}.log")),
    );
    process::run_cmd_with_logs(&argv, plain_command(&argv), token, &paths).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_network_args_with_dhcp_and_v6() {
        let spec = NetworkSpec::access(true);
        let v4: IpNet = "10.224.1.0/24".parse().expect("v4");
        let v6: IpNet = "fd62:a80c:412::/64".parse().expect("v6");
        let argv = add_network_args("vmshed-0-access", &spec, Some(&v4), Some(&v6), 5, 2);
        assert_eq!(
            argv,
            vec![
                "virter",
                "network",
                "add",
                "vmshed-0-access",
                "--network-cidr",
                "10.224.1.1/24",
                "--dhcp",
                "--network-v6-cidr",
                "fd62:a80c:412::1/64",
                "--forward-mode",
                "nat",
                "--domain",
                "test",
                "--dhcp-id",
                "5",
                "--dhcp-count",
                "2",
            ]
        );
    }

    #[test]
    fn add_network_args_without_dhcp() {
        let spec = NetworkSpec {
            forward: String::new(),
            ipv6: false,
            dhcp: false,
            domain: String::new(),
        };
        let argv = add_network_args("vmshed-1-extra", &spec, None, None, 5, 0);
        assert_eq!(argv, vec!["virter", "network", "add", "vmshed-1-extra"]);
    }

    #[test]
    fn build_image_args_orders_flags() {
        let opts = BuildImageOpts {
            id: 7,
            provision_file: Path::new("/spec/provision.toml"),
            console_dir: Path::new("/out/provision-log"),
            sets: vec!["values.X=y".to_string()],
            boot_capacity: Some("20G"),
            memory: Some("6G"),
            vcpus: Some(4),
            user: Some("tester"),
        };
        let argv = build_image_args(&opts, "base-1", "base-1-drbd");
        assert_eq!(
            argv,
            vec![
                "virter",
                "image",
                "build",
                "--id",
                "7",
                "--provision",
                "/spec/provision.toml",
                "--console",
                "/out/provision-log",
                "--set",
                "values.X=y",
                "--bootcap",
                "20G",
                "--memory",
                "6G",
                "--vcpus",
                "4",
                "--user",
                "tester",
                "--vnc",
                "--vnc-bind-ip",
                "0.0.0.0",
                "base-1",
                "base-1-drbd",
            ]
        );
    }

    #[test]
    fn vm_run_args_includes_disks_and_nics() {
        let opts = VmRunOpts {
            name: vm_name(5),
            id: 5,
            console_dir: Path::new("/out/log/t-1-default-0"),
            memory: "4G",
            vcpus: 2,
            boot_capacity: "10G",
            disks: &["name=data,size=2G".to_string()],
            extra_networks: &["vmshed-1-extra".to_string()],
            image: "base-1-drbd",
        };
        let argv = vm_run_args(&opts);
        assert_eq!(
            argv,
            vec![
                "virter",
                "vm",
                "run",
                "--name",
                "lbtest-vm-5",
                "--id",
                "5",
                "--console",
                "/out/log/t-1-default-0",
                "--memory",
                "4G",
                "--vcpus",
                "2",
                "--bootcapacity",
                "10G",
                "--disk",
                "name=data,size=2G",
                "--nic",
                "type=network,source=vmshed-1-extra",
                "--wait-ssh",
                "base-1-drbd",
            ]
        );
    }

    #[test]
    fn vm_exec_args_sets_name_outdir_and_variables() {
        let argv = vm_exec_args(
            Path::new("/spec/run.toml"),
            "test_list",
            Path::new("/out/log/test_list-1-default-0"),
            &["values.Override=1".to_string()],
            &[("etcd".to_string(), "true".to_string())],
            &[vm_name(5)],
        );
        assert_eq!(
            argv,
            vec![
                "virter",
                "vm",
                "exec",
                "--provision",
                "/spec/run.toml",
                "--set",
                "env.TEST_NAME=test_list",
                "--set",
                "values.OutDir=/out/log/test_list-1-default-0",
                "--set",
                "values.Override=1",
                "--set",
                "values.etcd=true",
                "lbtest-vm-5",
            ]
        );
    }

    #[test]
    fn renders_pull_template() {
        let source = render_pull_source(
            "https://images.example.com/{{ image }}.qcow2",
            "ubuntu-focal",
        )
        .expect("render");
        assert_eq!(source, "https://images.example.com/ubuntu-focal.qcow2");
    }
}
