//! Discovery of the boot-critical packages of a release.
//!
//! Four roles are looked up by the files their packages install:
//!
//! | Role | Provided file | Required |
//! |------|---------------|----------|
//! | bootloader image | `EFI/BOOT/grubx64.efi` | yes |
//! | kernel variants | `/boot/vmlinuz-*` | at least one |
//! | shim loader | `EFI/BOOT/bootx64.efi` | yes |
//! | shim source | `/usr/share/shim/*/<mokmanager>` | no |

use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::efi::{EfiArch, KERNEL_IMAGE_PREFIX};
use crate::error::PipelineError;
use crate::package::{find_template, PackageDescriptor, PackageLocator};
use crate::process::Runner;

/// Directory the vendor shim package installs its binaries under.
pub const SHIM_SOURCE_PREFIX: &str = "/usr/share/shim/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Bootloader,
    Kernel,
    ShimLoader,
    ShimSource,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Bootloader => "bootloader image",
            Role::Kernel => "kernel",
            Role::ShimLoader => "shim loader",
            Role::ShimSource => "shim source",
        })
    }
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredSet {
    pub bootloader: Option<PackageDescriptor>,
    pub kernels: Vec<PackageDescriptor>,
    pub shim: Option<PackageDescriptor>,
    pub shim_source: Option<PackageDescriptor>,
    pub release: String,
    pub dist_tag: String,
}

impl DiscoveredSet {
    /// Required roles with nothing discovered.
    pub fn missing_roles(&self) -> Vec<Role> {
        let mut missing = Vec::new();
        if self.bootloader.is_none() {
            missing.push(Role::Bootloader);
        }
        if self.kernels.is_empty() {
            missing.push(Role::Kernel);
        }
        if self.shim.is_none() {
            missing.push(Role::ShimLoader);
        }
        missing
    }

    pub fn is_usable(&self) -> bool {
        self.missing_roles().is_empty()
    }

    /// Every discovered descriptor with its role, bootloader first.
    pub fn descriptors(&self) -> Vec<(Role, &PackageDescriptor)> {
        let mut out = Vec::new();
        if let Some(d) = &self.bootloader {
            out.push((Role::Bootloader, d));
        }
        out.extend(self.kernels.iter().map(|k| (Role::Kernel, k)));
        if let Some(d) = &self.shim {
            out.push((Role::ShimLoader, d));
        }
        if let Some(d) = &self.shim_source {
            out.push((Role::ShimSource, d));
        }
        out
    }
}

/// Discover the packages a run derives from.
///
/// # Arguments
///
/// * `config` - Release layout, architecture, kernel series and variant cap
/// * `runner` - Answers the `rpm -qlp` / `rpm -qp` queries
///
/// # Returns
///
/// * `Ok(DiscoveredSet)` with every required role filled; a missing template is only logged
/// * `Err(DiscoveryFailed)` when the bootloader, every kernel, or the shim loader is missing
pub fn discover(config: &BuildConfig, runner: &dyn Runner) -> Result<DiscoveredSet, PipelineError> {
    let set = discover_in(
        runner,
        &config.source_package_dir,
        &config.source_spec_dir,
        config,
    )
    .map_err(PipelineError::discovery)?;

    let missing = set.missing_roles();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(Role::to_string).collect();
        return Err(PipelineError::DiscoveryFailed {
            message: format!(
                "required package(s) not found in '{}': {}",
                config.source_package_dir.display(),
                names.join(", ")
            ),
        });
    }

    info!(
        release = %set.release,
        dist_tag = %set.dist_tag,
        bootloader = set.bootloader.as_ref().map(|d| d.name.as_str()).unwrap_or("-"),
        kernels = ?set.kernels.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(),
        shim = set.shim.as_ref().map(|d| d.name.as_str()).unwrap_or("-"),
        shim_source = set.shim_source.as_ref().map(|d| d.name.as_str()).unwrap_or("-"),
        "discovery complete"
    );
    Ok(set)
}

fn discover_in(
    runner: &dyn Runner,
    package_dir: &Path,
    spec_dir: &Path,
    config: &BuildConfig,
) -> Result<DiscoveredSet> {
    let arch = config.arch;
    let locator = PackageLocator::scan(runner, package_dir)?;
    info!(
        dir = %package_dir.display(),
        candidates = locator.candidate_count(),
        "scanning distribution packages"
    );

    let bootloader = locator.find_providing(&EfiArch::efi_path(arch.grub_image()))?;
    let kernels = find_kernels(&locator, config)?;
    let shim = locator.find_providing(&EfiArch::efi_path(arch.shim_image()))?;
    let shim_source = find_shim_source(&locator, arch)?;

    let mut set = DiscoveredSet {
        bootloader,
        kernels,
        shim,
        shim_source,
        release: config.release.clone(),
        dist_tag: config.dist_tag(),
    };

    attach_templates(&mut set, spec_dir);
    Ok(set)
}

fn find_kernels(locator: &PackageLocator<'_>, config: &BuildConfig) -> Result<Vec<PackageDescriptor>> {
    let unfiltered = format!("{KERNEL_IMAGE_PREFIX}*");

    let mut kernels = match config.preferred_kernel_series() {
        Some(series) => {
            let narrowed = format!("{KERNEL_IMAGE_PREFIX}{series}.*");
            let found = locator.find_all_providing(&narrowed)?;
            if found.is_empty() {
                info!(
                    release = %config.release,
                    series,
                    "no kernels of the preferred series; scanning all kernel images"
                );
                locator.find_all_providing(&unfiltered)?
            } else {
                found
            }
        }
        None => locator.find_all_providing(&unfiltered)?,
    };
    kernels = newest_per_name(kernels);

    if kernels.len() > config.max_kernel_variants {
        let dropped: Vec<String> = kernels[config.max_kernel_variants..]
            .iter()
            .map(PackageDescriptor::file_name)
            .collect();
        warn!(
            limit = config.max_kernel_variants,
            dropped = ?dropped,
            "kernel variant limit reached"
        );
        kernels.truncate(config.max_kernel_variants);
    }

    Ok(kernels)
}

/// Keep one build per kernel package name, the newest version-release.
///
/// Each survivor keeps the position of the first build seen under its name.
fn newest_per_name(found: Vec<PackageDescriptor>) -> Vec<PackageDescriptor> {
    let mut kept: Vec<PackageDescriptor> = Vec::new();
    for candidate in found {
        let Some(i) = kept.iter().position(|k| k.name == candidate.name) else {
            kept.push(candidate);
            continue;
        };
        let skipped = if candidate.cmp_version_release(&kept[i]).is_gt() {
            std::mem::replace(&mut kept[i], candidate)
        } else {
            candidate
        };
        warn!(
            chosen = %kept[i].file_name(),
            skipped = %skipped.file_name(),
            "multiple builds of the same kernel package; skipping older candidate"
        );
    }
    kept
}

fn find_shim_source(locator: &PackageLocator<'_>, arch: EfiArch) -> Result<Option<PackageDescriptor>> {
    let manager = format!("/{}", arch.mok_manager());
    let candidates = locator.find_all_matching(&format!("{SHIM_SOURCE_PREFIX}*"), |entry| {
        entry.ends_with(&manager)
    })?;
    let mut with_manager = candidates.into_iter();
    let chosen = with_manager.next();
    for skipped in with_manager {
        warn!(
            chosen = %chosen.as_ref().map(PackageDescriptor::file_name).unwrap_or_default(),
            skipped = %skipped.file_name(),
            "multiple shim source packages; skipping candidate"
        );
    }
    if chosen.is_none() {
        info!("no vendor shim source package; MokManager will come from the shim loader package");
    }
    Ok(chosen)
}

fn attach_templates(set: &mut DiscoveredSet, spec_dir: &Path) {
    let slots = set
        .bootloader
        .iter_mut()
        .chain(set.kernels.iter_mut())
        .chain(set.shim.iter_mut())
        .chain(set.shim_source.iter_mut());
    for desc in slots {
        desc.spec_path = find_template(spec_dir, &desc.name);
        if desc.spec_path.is_none() {
            warn!(package = %desc.name, "no build-definition template found");
        }
    }
}
