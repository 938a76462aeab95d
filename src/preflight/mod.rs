//! Preflight checks run before any stage.
//!
//! Validates that the host has every tool the pipeline and the generated
//! build definitions invoke, so a missing tool fails in seconds instead of
//! halfway through a kernel build.

use anyhow::{bail, Context, Result};
use std::fs;

use crate::config::BuildConfig;
use crate::error::PipelineError;
use crate::process::Runner;

/// Tools every run needs, as (command, package providing it).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("rpm", "rpm"),
    ("rpmbuild", "rpm-build"),
    ("rpm2cpio", "rpm"),
    ("cpio", "cpio"),
    ("sbsign", "sbsigntools"),
    ("sbverify", "sbsigntools"),
    ("grub2-mkimage", "grub2"),
    ("depmod", "kmod"),
    ("dracut", "dracut"),
    ("createrepo_c", "createrepo_c"),
];

/// Needed only when repository signing is configured.
pub const SIGNING_TOOLS: &[(&str, &str)] = &[("rpmsign", "rpm-sign")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `runner` - Answers which programs are on `PATH`
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(runner: &dyn Runner, tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !runner.has_program(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

fn check_work_dir(config: &BuildConfig) -> Result<()> {
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating work dir '{}'", config.work_dir.display()))?;
    let marker = config.work_dir.join(".write-check");
    fs::write(&marker, b"")
        .with_context(|| format!("work dir '{}' is not writable", config.work_dir.display()))?;
    fs::remove_file(&marker)
        .with_context(|| format!("removing write check '{}'", marker.display()))?;
    Ok(())
}

fn check_inner(config: &BuildConfig, runner: &dyn Runner) -> Result<()> {
    check_required_tools(runner, REQUIRED_TOOLS)?;
    if config.repo_signing.is_some() {
        check_required_tools(runner, SIGNING_TOOLS)?;
    }
    for (what, path) in [
        ("signing key", &config.signing_key),
        ("signing certificate", &config.signing_cert),
    ] {
        if !path.is_file() {
            bail!("{} not found: {}", what, path.display());
        }
    }
    if let Some(cert) = &config.shim_vendor_cert {
        if !cert.is_file() {
            bail!("shim vendor certificate not found: {}", cert.display());
        }
    }
    check_work_dir(config)
}

/// Validate the host and workspace for `config`.
///
/// # Arguments
///
/// * `config` - Run configuration; selects optional tools and key material
/// * `runner` - Answers which programs are on `PATH`
///
/// # Returns
///
/// * `Ok(())` if tools, key material and work dir are usable
/// * `Err(PreflightFailed)` listing missing tools and their packages
pub fn check(config: &BuildConfig, runner: &dyn Runner) -> Result<(), PipelineError> {
    check_inner(config, runner).map_err(PipelineError::preflight)
}
