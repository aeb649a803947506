//! Expansion of the test matrix into concrete runs.
//!
//! The expansion is deterministic for a given RNG seed: tests are visited in
//! name order and image draws consume the RNG in a fixed sequence, so a seed
//! reproduces the exact plan of an earlier invocation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::config::{NetworkSpec, Test, TestSpecification, Variant, Vm, VmSpecification};

/// One concrete invocation of a test. Immutable after expansion.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub test_name: String,
    pub test_id: String,
    pub out_dir: PathBuf,
    /// VM descriptors with their assigned base images, one per VM slot.
    pub vms: Vec<Vm>,
    /// Extra per-test networks, in declaration order.
    pub networks: Vec<NetworkSpec>,
    pub variant: Variant,
}

/// Expansion inputs beyond the two specification files.
#[derive(Debug, Default)]
pub struct PlanOptions {
    /// Test names to run; `None` runs everything.
    pub to_run: Option<Vec<String>>,
    /// Variant names to admit; empty admits all.
    pub variants: Vec<String>,
    pub repeats: usize,
}

pub fn test_id(test: &str, vm_count: usize, variant: &str, index: usize) -> String {
    format!("{test}-{vm_count}-{variant}-{index}")
}

/// Expand the test × vm-count × variant × repeat matrix into runs.
///
/// Combinations whose tag filter matches no base image are skipped with a
/// diagnostic; they are not errors.
pub fn determine_test_runs(
    rng: &mut StdRng,
    vm_spec: &VmSpecification,
    test_spec: &TestSpecification,
    out_dir: &Path,
    opts: &PlanOptions,
) -> Result<Vec<TestRun>> {
    let mut runs = Vec::new();

    for (test_name, test) in &test_spec.tests {
        if let Some(to_run) = &opts.to_run {
            if !to_run.contains(test_name) {
                continue;
            }
        }

        for &vm_count in &test.vms {
            for variant in admitted_variants(test_spec, test, &opts.variants) {
                runs.extend(expand_combination(
                    rng, vm_spec, test_spec, out_dir, test_name, test, vm_count, &variant,
                    opts.repeats,
                )?);
            }
        }
    }

    Ok(runs)
}

fn admitted_variants(
    test_spec: &TestSpecification,
    test: &Test,
    filter: &[String],
) -> Vec<Variant> {
    test_spec
        .effective_variants()
        .into_iter()
        .filter(|variant| filter.is_empty() || filter.contains(&variant.name))
        .filter(|variant| test.variants.is_empty() || test.variants.contains(&variant.name))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn expand_combination(
    rng: &mut StdRng,
    vm_spec: &VmSpecification,
    test_spec: &TestSpecification,
    out_dir: &Path,
    test_name: &str,
    test: &Test,
    vm_count: usize,
    variant: &Variant,
    repeats: usize,
) -> Result<Vec<TestRun>> {
    let mut required_tags = variant.vm_tags.clone();
    required_tags.extend(test.vm_tags.iter().cloned());

    let matching: Vec<&Vm> = vm_spec
        .vms
        .iter()
        .filter(|vm| vm.has_tags(&required_tags))
        .collect();
    if matching.is_empty() {
        warn!(
            test = test_name,
            variant = %variant.name,
            tags = ?required_tags,
            "no base image matches the tag filter, skipping"
        );
        return Ok(Vec::new());
    }

    let networks: Vec<NetworkSpec> = test
        .networks
        .iter()
        .map(|name| {
            test_spec
                .networks
                .get(name)
                .cloned()
                .with_context(|| format!("test {test_name} references unknown network {name}"))
        })
        .collect::<Result<_>>()?;

    let mut runs = Vec::new();
    let mut emit = |vms: Vec<Vm>| {
        let id = test_id(test_name, vm_count, &variant.name, runs.len());
        runs.push(TestRun {
            test_name: test_name.to_string(),
            out_dir: out_dir.join("log").join(&id),
            test_id: id,
            vms,
            networks: networks.clone(),
            variant: variant.clone(),
        });
    };

    for _ in 0..repeats {
        if test.needallplatforms {
            for vm in &matching {
                emit(vec![(*vm).clone(); vm_count]);
            }
        } else if test.samevms {
            let vm = draw(rng, &matching);
            emit(vec![vm; vm_count]);
        } else {
            let vms = (0..vm_count).map(|_| draw(rng, &matching)).collect();
            emit(vms);
        }
    }

    Ok(runs)
}

fn draw(rng: &mut StdRng, matching: &[&Vm]) -> Vm {
    (*matching.choose(rng).expect("matching set is not empty")).clone()
}

/// The base image of every VM in a run, for plan logging and results.
pub fn base_image_names(run: &TestRun) -> Vec<String> {
    run.vms.iter().map(|vm| vm.base_image.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashMap;

    const VM_SPEC: &str = r#"name = "t"
provision_file = "provision-test.toml"

[[vms]]
base_image = "centos-8-linstor-k193"
vm_tags = ["postgresql", "mariadb"]

[[vms]]
base_image = "ubuntu-xenial-linstor-k185"

[[vms]]
base_image = "ubuntu-bionic-linstor-k109"
vm_tags = ["zfs", "postgresql", "mariadb"]

[[vms]]
base_image = "ubuntu-focal-linstor-k40"
vm_tags = ["zfs", "postgresql", "mariadb"]
"#;

    fn expand(
        test_spec: &str,
        opts: &PlanOptions,
    ) -> (Vec<TestRun>, HashMap<String, Vec<String>>) {
        let vm_spec: VmSpecification = toml::from_str(VM_SPEC).expect("vm spec");
        let test_spec: TestSpecification = toml::from_str(test_spec).expect("test spec");
        let mut rng = StdRng::seed_from_u64(12345678);
        let runs = determine_test_runs(&mut rng, &vm_spec, &test_spec, Path::new("/out"), opts)
            .expect("expand");
        let by_id = runs
            .iter()
            .map(|run| (run.test_id.clone(), base_image_names(run)))
            .collect();
        (runs, by_id)
    }

    fn ids(runs: &[TestRun]) -> Vec<&str> {
        runs.iter().map(|run| run.test_id.as_str()).collect()
    }

    #[test]
    fn expands_counts_and_tag_filters() {
        let (runs, by_id) = expand(
            r#"[tests]
[tests.test_list_commands]
vms = [1, 2]

[tests.test_zfs_disk2_diskless1]
vms = [3]
vm_tags = ["zfs"]
"#,
            &PlanOptions {
                repeats: 1,
                ..PlanOptions::default()
            },
        );

        assert_eq!(
            ids(&runs),
            vec![
                "test_list_commands-1-default-0",
                "test_list_commands-2-default-0",
                "test_zfs_disk2_diskless1-3-default-0",
            ]
        );
        for image in &by_id["test_zfs_disk2_diskless1-3-default-0"] {
            assert!(
                ["ubuntu-bionic-linstor-k109", "ubuntu-focal-linstor-k40"]
                    .contains(&image.as_str()),
                "image {image} does not carry the zfs tag"
            );
        }
    }

    #[test]
    fn repeats_multiply_runs() {
        let (runs, _) = expand(
            r#"[tests]
[tests.test_list_commands]
vms = [1, 2]
"#,
            &PlanOptions {
                repeats: 3,
                ..PlanOptions::default()
            },
        );

        assert_eq!(
            ids(&runs),
            vec![
                "test_list_commands-1-default-0",
                "test_list_commands-1-default-1",
                "test_list_commands-1-default-2",
                "test_list_commands-2-default-0",
                "test_list_commands-2-default-1",
                "test_list_commands-2-default-2",
            ]
        );
    }

    #[test]
    fn to_run_filters_tests() {
        let (runs, _) = expand(
            r#"[tests]
[tests.test_list_commands]
vms = [1]

[tests.test_recreate_deleted_resource]
vms = [1]

[tests.test_auto_place_replicas_on_same]
vms = [4]
"#,
            &PlanOptions {
                to_run: Some(vec![
                    "test_list_commands".to_string(),
                    "test_auto_place_replicas_on_same".to_string(),
                ]),
                repeats: 1,
                ..PlanOptions::default()
            },
        );

        assert_eq!(
            ids(&runs),
            vec![
                "test_auto_place_replicas_on_same-4-default-0",
                "test_list_commands-1-default-0",
            ]
        );
    }

    #[test]
    fn variants_multiply_and_filter() {
        let spec = r#"[[variants]]
name = "default"
variables = { etcd = "false" }

[[variants]]
name = "etcd"
variables = { etcd = "true" }

[tests]
[tests.test_list_commands]
vms = [1, 2]
"#;

        let (all, _) = expand(
            spec,
            &PlanOptions {
                repeats: 1,
                ..PlanOptions::default()
            },
        );
        assert_eq!(
            ids(&all),
            vec![
                "test_list_commands-1-default-0",
                "test_list_commands-1-etcd-0",
                "test_list_commands-2-default-0",
                "test_list_commands-2-etcd-0",
            ]
        );

        let (filtered, _) = expand(
            spec,
            &PlanOptions {
                variants: vec!["etcd".to_string()],
                repeats: 1,
                ..PlanOptions::default()
            },
        );
        assert_eq!(
            ids(&filtered),
            vec![
                "test_list_commands-1-etcd-0",
                "test_list_commands-2-etcd-0",
            ]
        );
    }

    #[test]
    fn needallplatforms_with_variant_tags() {
        let (runs, by_id) = expand(
            r#"[[variants]]
name = "default"

[[variants]]
name = "etcd"
vm_tags = ["zfs"]

[tests]
[tests.test_list_commands]
vms = [1]
needallplatforms = true
"#,
            &PlanOptions {
                repeats: 1,
                ..PlanOptions::default()
            },
        );

        assert_eq!(runs.len(), 6);
        assert_eq!(
            by_id["test_list_commands-1-default-0"],
            vec!["centos-8-linstor-k193"]
        );
        assert_eq!(
            by_id["test_list_commands-1-default-1"],
            vec!["ubuntu-xenial-linstor-k185"]
        );
        assert_eq!(
            by_id["test_list_commands-1-default-2"],
            vec!["ubuntu-bionic-linstor-k109"]
        );
        assert_eq!(
            by_id["test_list_commands-1-default-3"],
            vec!["ubuntu-focal-linstor-k40"]
        );
        assert_eq!(
            by_id["test_list_commands-1-etcd-0"],
            vec!["ubuntu-bionic-linstor-k109"]
        );
        assert_eq!(
            by_id["test_list_commands-1-etcd-1"],
            vec!["ubuntu-focal-linstor-k40"]
        );
    }

    #[test]
    fn samevms_uses_one_image_for_all_slots() {
        let (runs, _) = expand(
            r#"[tests]
[tests.test_quorum]
vms = [3]
samevms = true
"#,
            &PlanOptions {
                repeats: 4,
                ..PlanOptions::default()
            },
        );

        for run in &runs {
            let images = base_image_names(run);
            assert_eq!(images.len(), 3);
            assert!(images.iter().all(|image| image == &images[0]));
        }
    }

    #[test]
    fn empty_match_set_is_skipped_not_an_error() {
        let (runs, _) = expand(
            r#"[tests]
[tests.test_exotic]
vms = [1]
vm_tags = ["no-such-tag"]
"#,
            &PlanOptions {
                repeats: 1,
                ..PlanOptions::default()
            },
        );
        assert!(runs.is_empty());
    }

    #[test]
    fn expansion_is_reproducible_for_a_seed() {
        let spec = r#"[tests]
[tests.test_list_commands]
vms = [2]
"#;
        let opts = PlanOptions {
            repeats: 5,
            ..PlanOptions::default()
        };
        let (_, first) = expand(spec, &opts);
        let (_, second) = expand(spec, &opts);
        assert_eq!(first, second);
    }

    #[test]
    fn runs_resolve_extra_networks() {
        let (runs, _) = expand(
            r#"[networks.replication]
forward = "nat"
dhcp = true

[tests]
[tests.test_two_nets]
vms = [2]
networks = ["replication"]
"#,
            &PlanOptions {
                repeats: 1,
                ..PlanOptions::default()
            },
        );

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].networks.len(), 1);
        assert!(runs[0].networks[0].dhcp);
        assert_eq!(runs[0].out_dir, Path::new("/out/log/test_two_nets-2-default-0"));
    }
}
