//! Signature validation of built packages.
//!
//! A package passes when `rpm -K` accepts it and every boot binary it ships
//! verifies against the expected certificate. Which binaries are required
//! depends on the kind of definition the package was built from:
//!
//! | Kind | Required | Optional | Certificate |
//! |------|----------|----------|-------------|
//! | bootloader | `grubx64.efi` | `grub.efi` | MOK |
//! | kernel | `boot/vmlinuz-*` | | MOK |
//! | shim | | `bootx64.efi`, `mmx64.efi` | vendor, when configured |

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{BuildConfig, ValidationPolicy};
use crate::efi::{EfiArch, EFI_BOOT_DIR};
use crate::build::BuiltPackage;
use crate::error::PipelineError;
use crate::process::{Cmd, Runner};
use crate::synth::SpecKind;

/// Marker `sbverify` prints for a valid signature.
pub const VERIFIED_MARKER: &str = "Signature verification OK";

/// Per-package outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ValidationResult {
    pub package: String,
    pub signature_valid: bool,
    pub package_integrity_valid: bool,
    /// First diagnostic encountered.
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.signature_valid && self.package_integrity_valid
    }

    fn fail_signature(&mut self, message: String) {
        self.signature_valid = false;
        self.error.get_or_insert(message);
    }
}

/// Boot binary present in an extracted payload.
#[derive(Debug, Clone)]
struct BootBinary {
    path: PathBuf,
    required: bool,
}

/// Find the boot binaries of `kind` under `root`, failing when a required one is absent.
fn boot_binaries(root: &Path, kind: SpecKind, arch: EfiArch) -> Result<Vec<BootBinary>> {
    let efi_dir = root.join(EFI_BOOT_DIR.trim_start_matches('/'));
    let mut found = Vec::new();
    match kind {
        SpecKind::Bootloader => {
            let image = efi_dir.join(arch.grub_image());
            if !image.is_file() {
                bail!("required binary {} is missing", arch.grub_image());
            }
            found.push(BootBinary {
                path: image,
                required: true,
            });
            let alias = efi_dir.join("grub.efi");
            if alias.is_file() {
                found.push(BootBinary {
                    path: alias,
                    required: false,
                });
            }
        }
        SpecKind::Kernel => {
            let boot = root.join("boot");
            for entry in WalkDir::new(&boot).max_depth(1).sort_by_file_name() {
                let Ok(entry) = entry else { continue };
                let name = entry.file_name().to_string_lossy();
                if entry.file_type().is_file() && name.starts_with("vmlinuz-") {
                    found.push(BootBinary {
                        path: entry.into_path(),
                        required: true,
                    });
                }
            }
            if found.is_empty() {
                bail!("required binary boot/vmlinuz-* is missing");
            }
        }
        SpecKind::Shim => {
            for file in [arch.shim_image(), arch.mok_manager()] {
                let path = efi_dir.join(file);
                if path.is_file() {
                    found.push(BootBinary {
                        path,
                        required: false,
                    });
                }
            }
        }
    }
    Ok(found)
}

/// Extract the payload of `package` into `scratch`, replacing whatever was there.
fn extract_payload(runner: &dyn Runner, package: &Path, scratch: &Path) -> Result<()> {
    if scratch.exists() {
        fs::remove_dir_all(scratch)
            .with_context(|| format!("clearing scratch dir '{}'", scratch.display()))?;
    }
    let root = scratch.join("root");
    fs::create_dir_all(&root)
        .with_context(|| format!("creating scratch dir '{}'", root.display()))?;

    let archive = scratch.join("payload.cpio");
    Cmd::new("rpm2cpio")
        .arg_path(package)
        .stdout_to(&archive)
        .error_msg(&format!("converting payload of '{}'", package.display()))
        .run_with(runner)?;
    Cmd::new("cpio")
        .args(["-idmu", "--quiet", "-F"])
        .arg_path(&archive)
        .current_dir(&root)
        .error_msg(&format!("extracting payload of '{}'", package.display()))
        .run_with(runner)?;
    Ok(())
}

fn check_integrity(runner: &dyn Runner, package: &Path) -> Result<()> {
    let out = Cmd::new("rpm")
        .arg("-K")
        .arg_path(package)
        .error_msg(&format!("integrity check of '{}'", package.display()))
        .run_with(runner)?;
    if !out.stdout.contains("digests") {
        bail!(
            "integrity check of '{}' did not report digests: {}",
            package.display(),
            out.combined().trim()
        );
    }
    Ok(())
}

/// Verify one binary; `Err` carries the diagnostic.
fn verify_binary(runner: &dyn Runner, binary: &Path, cert: &Path) -> Result<()> {
    let cmd = Cmd::new("sbverify")
        .arg("--cert")
        .arg_path(cert)
        .arg_path(binary);
    let out = runner.run(&cmd)?;
    if out.success() && out.combined().contains(VERIFIED_MARKER) {
        return Ok(());
    }
    let detail = out.combined();
    let detail = detail.trim();
    bail!(
        "{}: {}",
        binary.display(),
        if detail.is_empty() {
            "no verification output"
        } else {
            detail
        }
    )
}

/// Validate one built package.
///
/// # Arguments
///
/// * `runner` - Executes `rpm -K`, `rpm2cpio`, `cpio` and `sbverify`
/// * `package` - Built package file
/// * `kind` - Kind of definition the package was built from; selects the required binaries
/// * `cert` - Certificate the binaries must verify against, `None` to skip
///   signature checks (vendor-signed shim without a configured vendor certificate)
/// * `scratch` - Extraction directory, emptied first
/// * `arch` - Selects the EFI binary names
///
/// # Returns
///
/// Never an error; every problem lands in the [`ValidationResult`].
pub fn validate(
    runner: &dyn Runner,
    package: &Path,
    kind: SpecKind,
    cert: Option<&Path>,
    scratch: &Path,
    arch: EfiArch,
) -> ValidationResult {
    let file_name = package
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut result = ValidationResult {
        package: file_name.clone(),
        signature_valid: true,
        package_integrity_valid: true,
        error: None,
    };

    if let Err(e) = check_integrity(runner, package) {
        result.package_integrity_valid = false;
        result.error = Some(format!("{e:#}"));
    }

    if let Err(e) = extract_payload(runner, package, scratch) {
        result.fail_signature(format!("{e:#}"));
        return result;
    }

    let binaries = match boot_binaries(&scratch.join("root"), kind, arch) {
        Ok(b) => b,
        Err(e) => {
            result.fail_signature(format!("{file_name}: {e}"));
            return result;
        }
    };

    let Some(cert) = cert else {
        debug!(package = %file_name, "no certificate for this package kind; signatures not checked");
        return result;
    };
    for binary in &binaries {
        match verify_binary(runner, &binary.path, cert) {
            Ok(()) => debug!(binary = %binary.path.display(), required = binary.required, "signature verified"),
            Err(e) => result.fail_signature(format!("{e:#}")),
        }
    }
    result
}

/// Validate every package in `packages` and apply the configured policy.
///
/// # Arguments
///
/// * `config` - Certificates, architecture, work dir and [`ValidationPolicy`]
/// * `packages` - Output of the build stage
/// * `runner` - Executes the verification tools
///
/// # Returns
///
/// * `Ok` with one result per package, failures included, under [`ValidationPolicy::Warn`]
/// * `Err(ValidationFailed)` when any package failed and the policy is fatal
pub fn validate_all(
    config: &BuildConfig,
    packages: &[BuiltPackage],
    runner: &dyn Runner,
) -> Result<Vec<ValidationResult>, PipelineError> {
    let scratch_root = config.work_dir.join("validate");
    let mut results = Vec::new();

    for package in packages {
        let stem = package
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cert = match package.kind {
            SpecKind::Shim => config.shim_vendor_cert.as_deref(),
            SpecKind::Bootloader | SpecKind::Kernel => Some(config.signing_cert.as_path()),
        };

        let result = validate(
            runner,
            &package.path,
            package.kind,
            cert,
            &scratch_root.join(&stem),
            config.arch,
        );
        if result.passed() {
            info!(package = %result.package, "validation passed");
        } else {
            warn!(
                package = %result.package,
                signature_valid = result.signature_valid,
                integrity_valid = result.package_integrity_valid,
                error = result.error.as_deref().unwrap_or(""),
                "validation failed"
            );
        }
        results.push(result);
    }

    let failed: Vec<&ValidationResult> = results.iter().filter(|r| !r.passed()).collect();
    if let Some(first) = failed.first() {
        if config.validation_policy == ValidationPolicy::Fatal {
            return Err(PipelineError::ValidationFailed {
                failed: failed.len(),
                first: format!(
                    "{}: {}",
                    first.package,
                    first.error.as_deref().unwrap_or("unknown")
                ),
            });
        }
        warn!(
            failed = failed.len(),
            "continuing despite validation failures"
        );
    }
    Ok(results)
}
