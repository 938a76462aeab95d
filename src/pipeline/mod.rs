//! Pipeline driver.
//!
//! - [`lock`] - exclusive work directory ownership
//! - [`manifest`] - `run-manifest.json` record of each run
//!
//! Stages run strictly in sequence; the first failure ends the run and is
//! returned as-is. Artifacts of completed stages stay on disk. Every stage
//! recomputes its inputs from the filesystem, so re-running from the start is
//! always safe.

pub mod lock;
pub mod manifest;

use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::discovery::{discover, DiscoveredSet};
use crate::error::{PipelineError, Stage};
use crate::build::BuiltPackage;
use crate::process::Runner;
use crate::repo::{integrate, Integration};
use crate::synth::{synthesize, GeneratedSpec};
use crate::validate::{validate_all, ValidationResult};
use crate::{build, preflight, sign};
use lock::WorkspaceLock;
use manifest::{RunManifest, RunStatus, SpecRecord};

/// Everything one successful run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub discovered: DiscoveredSet,
    pub specs: Vec<GeneratedSpec>,
    pub built: Vec<BuiltPackage>,
    pub validation: Vec<ValidationResult>,
    pub signed: usize,
    /// `None` when no repository is configured.
    pub integration: Option<Integration>,
}

impl PipelineReport {
    pub fn validation_failures(&self) -> usize {
        self.validation.iter().filter(|r| !r.passed()).count()
    }
}

/// Run every stage for `config`.
///
/// # Arguments
///
/// * `config` - Resolved run configuration
/// * `runner` - Executes every external tool
///
/// # Returns
///
/// * `Ok(PipelineReport)` when every enabled stage completed
/// * `Err` with the first stage failure; `run-manifest.json` records it either way
pub fn run(config: &BuildConfig, runner: &dyn Runner) -> Result<PipelineReport, PipelineError> {
    preflight::check(config, runner)?;
    let _lock = WorkspaceLock::acquire(&config.lock_path()).map_err(PipelineError::preflight)?;

    let mut manifest =
        RunManifest::start(&config.release, &config.dist_tag()).map_err(PipelineError::preflight)?;
    info!(run_id = %manifest.run_id, release = %config.release, "pipeline started");

    let outcome = run_stages(config, runner, &mut manifest);
    let status = match &outcome {
        Ok(_) => RunStatus::Succeeded,
        Err(e) => {
            manifest.failed_stage = Some(e.stage().tag().to_string());
            manifest.error = Some(e.to_string());
            RunStatus::Failed
        }
    };
    if let Err(e) = manifest
        .finish(status)
        .and_then(|_| manifest.write(&config.work_dir))
    {
        warn!(error = %format!("{e:#}"), "could not write run manifest");
    }

    match &outcome {
        Ok(report) => info!(
            run_id = %manifest.run_id,
            specs = report.specs.len(),
            built = report.built.len(),
            validation_failures = report.validation_failures(),
            signed = report.signed,
            "pipeline finished"
        ),
        Err(e) => warn!(run_id = %manifest.run_id, stage = %e.stage(), "pipeline failed"),
    }
    outcome
}

fn run_stages(
    config: &BuildConfig,
    runner: &dyn Runner,
    manifest: &mut RunManifest,
) -> Result<PipelineReport, PipelineError> {
    info!(stage = %Stage::Discovery, "stage started");
    let discovered = discover(config, runner)?;

    info!(stage = %Stage::Synthesis, "stage started");
    let specs = synthesize(config, &discovered)?;
    manifest.specs = specs.iter().map(SpecRecord::of).collect();

    info!(stage = %Stage::Build, "stage started");
    let built = build::build(config, &specs, runner)?;
    manifest.built = built.iter().map(BuiltPackage::file_name).collect();

    info!(stage = %Stage::Validation, "stage started");
    let validation = validate_all(config, &built, runner)?;
    manifest.validation = validation.clone();

    let signed = match &config.repo_signing {
        Some(signing) => {
            info!(stage = %Stage::Signing, "stage started");
            sign::sign(&config.output_dir, signing, runner)?
        }
        None => 0,
    };
    manifest.signed = signed;

    let integration = match &config.repository_dir {
        Some(repo_root) => {
            info!(stage = %Stage::Integration, "stage started");
            let result = integrate(&config.output_dir, repo_root, config.integration_policy, runner)?;
            manifest.integrated = file_names(&result.copied);
            manifest.removed_originals = file_names(&result.removed_originals);
            Some(result)
        }
        None => {
            info!("no repository configured; skipping integration");
            None
        }
    };

    Ok(PipelineReport {
        discovered,
        specs,
        built,
        validation,
        signed,
        integration,
    })
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepoSigning, ValidationPolicy};
    use crate::package::query_manifest;
    use crate::repo::index::RepositoryIndex;
    use crate::testing::{fixture_config, touch_packages, FakeRepo};
    use std::fs;
    use tempfile::TempDir;

    const BOOT_PACKAGES: [&str; 4] = ["grub2-efi-image", "linux", "linux-esx", "shim-signed"];

    fn scenario(tmp: &TempDir, repo: &FakeRepo) -> BuildConfig {
        let config = fixture_config(tmp.path(), repo);
        touch_packages(&tmp.path().join("iso/RPMS/x86_64"), repo);
        config
    }

    #[test]
    fn test_scenario_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5();
        let config = scenario(&tmp, &repo);
        let runner = repo.runner();

        let report = run(&config, &runner).unwrap();
        assert_eq!(report.discovered.kernels.len(), 2);
        assert_eq!(report.specs.len(), 4);
        assert_eq!(report.built.len(), 4);
        assert_eq!(report.validation_failures(), 0);
        assert_eq!(report.signed, 0);

        let index = RepositoryIndex::load(tmp.path().join("iso").as_path()).unwrap();
        for name in BOOT_PACKAGES {
            assert_eq!(index.find(name).len(), 1, "{name}");
            assert_eq!(index.find(&format!("{name}-mok")).len(), 1, "{name}-mok");
        }
        let boot_related = index
            .packages()
            .iter()
            .filter(|p| BOOT_PACKAGES.iter().any(|b| p.name.trim_end_matches("-mok") == *b))
            .count();
        assert_eq!(boot_related, 8);

        let manifest = fs::read_to_string(config.work_dir.join(manifest::MANIFEST_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["integrated"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5();
        let config = scenario(&tmp, &repo);
        let runner = repo.runner();

        let first = run(&config, &runner).unwrap();
        let first_specs: Vec<Vec<u8>> =
            first.specs.iter().map(|s| fs::read(&s.path).unwrap()).collect();
        let second = run(&config, &runner).unwrap();
        let second_specs: Vec<Vec<u8>> =
            second.specs.iter().map(|s| fs::read(&s.path).unwrap()).collect();

        assert_eq!(first_specs, second_specs);
        assert_eq!(first.built, second.built);
    }

    #[test]
    fn test_kernel_variants_do_not_share_files() {
        let tmp = TempDir::new().unwrap();
        // the base package also carries files of the esx release next to its own
        let repo = FakeRepo::photon5().with_paths(
            "linux-6.1.159-7.ph5.x86_64.rpm",
            &[
                "/boot/System.map-6.1.159-7.ph5-esx",
                "/lib/modules/6.1.159-7.ph5-esx/modules.dep",
            ],
        );
        let config = scenario(&tmp, &repo);
        let runner = repo.runner();
        let report = run(&config, &runner).unwrap();

        let find = |prefix: &str| {
            report
                .built
                .iter()
                .find(|p| p.file_name().starts_with(prefix))
                .map(|p| p.path.clone())
                .unwrap()
        };
        let base = query_manifest(&runner, &find("linux-mok-")).unwrap();
        let esx = query_manifest(&runner, &find("linux-esx-mok-")).unwrap();

        assert!(base.contains(&"/boot/vmlinuz-6.1.159-7.ph5".to_string()));
        assert!(base.contains(&"/lib/modules/6.1.159-7.ph5/modules.dep".to_string()));
        assert!(esx.contains(&"/boot/vmlinuz-6.1.159-7.ph5-esx".to_string()));
        assert!(base.iter().all(|f| !f.contains("-esx")), "{base:?}");
        assert!(esx.iter().all(|f| !esx_foreign(f)), "{esx:?}");
    }

    fn esx_foreign(path: &str) -> bool {
        path.ends_with("6.1.159-7.ph5") || path.contains("6.1.159-7.ph5/")
    }

    #[test]
    fn test_build_failure_is_recorded_in_manifest() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5().fail_build("grub2-efi-image-mok.spec");
        let config = scenario(&tmp, &repo);
        let runner = repo.runner();

        let err = run(&config, &runner).unwrap_err();
        assert_eq!(err.stage(), Stage::Build);
        // shim builds first and stays on disk
        assert!(config
            .build_dir
            .join("RPMS/x86_64/shim-signed-mok-15.8-1.ph5.x86_64.rpm")
            .is_file());

        let manifest = fs::read_to_string(config.work_dir.join(manifest::MANIFEST_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failed_stage"], "build");
        assert_eq!(json["specs"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_tampered_binary_is_fatal_only_under_strict_policy() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5().tamper("grubx64.efi");
        let mut config = scenario(&tmp, &repo);
        let runner = repo.runner();

        let report = run(&config, &runner).unwrap();
        assert_eq!(report.validation_failures(), 1);
        assert!(report.integration.is_some());

        config.validation_policy = ValidationPolicy::Fatal;
        let err = run(&config, &runner).unwrap_err();
        assert_eq!(err.exit_code(), 15);
    }

    #[test]
    fn test_repository_signing_runs_when_configured() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5();
        let mut config = scenario(&tmp, &repo);
        config.repo_signing = Some(RepoSigning {
            keyring: tmp.path().join("gnupg"),
            identity: "Repo Signer".into(),
        });
        let runner = repo.runner();

        let report = run(&config, &runner).unwrap();
        assert_eq!(report.signed, 4);
        assert_eq!(runner.calls_to("rpmsign").len(), 4);
    }

    #[test]
    fn test_held_lock_fails_preflight() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5();
        let config = scenario(&tmp, &repo);
        let _held = WorkspaceLock::acquire(&config.lock_path()).unwrap();

        let err = run(&config, &repo.runner()).unwrap_err();
        assert_eq!(err.stage(), Stage::Preflight);
        assert!(err.to_string().contains("in use by another run"));
    }

    #[test]
    fn test_missing_tool_fails_before_discovery() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo::photon5();
        let config = scenario(&tmp, &repo);
        let runner = repo.runner().without_program("dracut");

        let err = run(&config, &runner).unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert!(runner.calls().is_empty());
    }
}
