//! Build-definition synthesis for the derived packages.
//!
//! - [`bootloader`] - standalone grub image, SBAT, MOK signature, token gate
//! - [`kernel`] - per-variant kernel image, modules, initrd
//! - [`shim`] - verbatim first-stage loader and MokManager
//! - [`token`] - hardware token gate scriptlets
//! - [`template`] - shared preamble
//!
//! Every definition of a run is rendered and checked in memory before the
//! first file is written, so a bad descriptor never leaves a partial set
//! behind. Output depends only on the configuration and discovered set.

pub mod bootloader;
pub mod kernel;
pub mod shim;
pub mod template;
pub mod token;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::discovery::DiscoveredSet;
use crate::error::PipelineError;
use crate::package::PackageDescriptor;
use shim::ShimSources;
use template::require_identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecKind {
    Shim,
    Bootloader,
    Kernel,
}

impl SpecKind {
    /// Best guess at the kind of a package no generated definition accounts for.
    pub fn guess_from_name(name: &str) -> Self {
        if name.starts_with("linux") || name.starts_with("kernel") {
            SpecKind::Kernel
        } else if name.starts_with("shim") {
            SpecKind::Shim
        } else {
            SpecKind::Bootloader
        }
    }
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpecKind::Shim => "shim",
            SpecKind::Bootloader => "bootloader",
            SpecKind::Kernel => "kernel",
        })
    }
}

/// One generated build definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSpec {
    pub kind: SpecKind,
    /// Name of the package the definition derives from.
    pub original: String,
    pub derived_name: String,
    pub path: PathBuf,
    /// Files the definition lists as `SourceN`, copied into the builder's sources.
    pub sources: Vec<PathBuf>,
    pub contents: String,
}

impl GeneratedSpec {
    pub fn file_name(&self) -> String {
        format!("{}.spec", self.derived_name)
    }
}

/// Render every definition for `set` and write them into `config.spec_dir`.
///
/// # Arguments
///
/// * `config` - Key material, local kernel dir, token gate and spec dir
/// * `set` - Output of discovery
///
/// # Returns
///
/// * `Ok` with the definitions in build order: shim, bootloader, then each kernel variant
/// * `Err(SpecGenerationFailed)` before any file is written when one definition cannot be rendered
pub fn synthesize(
    config: &BuildConfig,
    set: &DiscoveredSet,
) -> Result<Vec<GeneratedSpec>, PipelineError> {
    let specs = render_all(config, set)?;

    fs::create_dir_all(&config.spec_dir)
        .with_context(|| format!("creating spec dir '{}'", config.spec_dir.display()))
        .map_err(|e| PipelineError::spec("*", e))?;

    for spec in &specs {
        fs::write(&spec.path, &spec.contents)
            .with_context(|| format!("writing '{}'", spec.path.display()))
            .map_err(|e| PipelineError::spec(&spec.file_name(), e))?;
        debug!(spec = %spec.path.display(), kind = %spec.kind, "wrote build definition");
    }

    info!(
        count = specs.len(),
        dir = %config.spec_dir.display(),
        "generated build definitions"
    );
    Ok(specs)
}

/// Render every definition without touching the filesystem beyond reading templates.
pub fn render_all(
    config: &BuildConfig,
    set: &DiscoveredSet,
) -> Result<Vec<GeneratedSpec>, PipelineError> {
    check_signing_material(config).map_err(|e| PipelineError::spec("*", e))?;

    let dist_tag = set.dist_tag.as_str();
    let mut specs = Vec::new();

    let shim = set.shim.as_ref().ok_or_else(|| missing("shim loader"))?;
    specs.push(render_shim(config, set, shim, dist_tag)?);

    let grub = set
        .bootloader
        .as_ref()
        .ok_or_else(|| missing("bootloader image"))?;
    specs.push(render_one(config, SpecKind::Bootloader, grub, vec![grub.path.clone()], || {
        bootloader::render(config, grub, dist_tag)
    })?);

    if set.kernels.is_empty() {
        return Err(missing("kernel"));
    }
    for k in &set.kernels {
        specs.push(render_one(config, SpecKind::Kernel, k, vec![k.path.clone()], || {
            kernel::render(config, k, dist_tag)
        })?);
    }

    let mut seen = std::collections::BTreeSet::new();
    for spec in &specs {
        if !seen.insert(spec.derived_name.clone()) {
            return Err(PipelineError::spec(
                &spec.file_name(),
                anyhow::anyhow!("two discovered packages derive the same name"),
            ));
        }
    }

    Ok(specs)
}

fn render_shim(
    config: &BuildConfig,
    set: &DiscoveredSet,
    loader: &PackageDescriptor,
    dist_tag: &str,
) -> Result<GeneratedSpec, PipelineError> {
    let der = config.key_storage_dir.join(&config.mok_der_name);
    let sources = ShimSources {
        loader: loader.clone(),
        manager: set.shim_source.clone(),
        mok_der: der.is_file().then_some(der),
    };
    let mut files = vec![loader.path.clone()];
    if let Some(m) = &sources.manager {
        if let Err(e) = require_identity(m) {
            return Err(PipelineError::spec(&spec_file(loader), e));
        }
        files.push(m.path.clone());
    }
    if let Some(der) = &sources.mok_der {
        files.push(der.clone());
    }
    render_one(config, SpecKind::Shim, loader, files, || {
        shim::render(config, &sources, dist_tag)
    })
}

fn render_one(
    config: &BuildConfig,
    kind: SpecKind,
    orig: &PackageDescriptor,
    sources: Vec<PathBuf>,
    render: impl FnOnce() -> Result<String>,
) -> Result<GeneratedSpec, PipelineError> {
    let file = spec_file(orig);
    require_identity(orig).map_err(|e| PipelineError::spec(&file, e))?;
    let contents = render().map_err(|e| PipelineError::spec(&file, e))?;
    Ok(GeneratedSpec {
        kind,
        original: orig.name.clone(),
        derived_name: orig.derived_name(),
        path: config.spec_dir.join(&file),
        sources,
        contents,
    })
}

fn spec_file(orig: &PackageDescriptor) -> String {
    format!("{}.spec", orig.derived_name())
}

fn missing(role: &str) -> PipelineError {
    PipelineError::spec("*", anyhow::anyhow!("no {role} package in the discovered set"))
}

fn check_signing_material(config: &BuildConfig) -> Result<()> {
    for (what, path) in [
        ("signing key", &config.signing_key),
        ("signing certificate", &config.signing_cert),
    ] {
        if path.as_os_str().is_empty() {
            bail!("{what} path is empty");
        }
    }
    Ok(())
}
