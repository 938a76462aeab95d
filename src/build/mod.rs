//! Build orchestration.
//!
//! - [`layout`] - rpmbuild top directory, scratch reset, output collection
//!
//! Definitions are built strictly in the order synthesis returns them (shim,
//! bootloader, kernel variants). The first failing build aborts the stage.

pub mod layout;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::error::PipelineError;
use crate::package::RpmFileName;
use crate::process::{Cmd, Runner};
use crate::synth::{GeneratedSpec, SpecKind};
use layout::BuildLayout;

/// Lines of builder output kept in a [`PipelineError::BuildFailed`].
pub const OUTPUT_TAIL_LINES: usize = 40;

/// A package copied into the output directory, with the kind of definition it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPackage {
    pub kind: SpecKind,
    pub path: PathBuf,
}

impl BuiltPackage {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Build every definition and copy the results into `config.output_dir`.
///
/// # Arguments
///
/// * `config` - Run configuration; `build_dir` is the rpmbuild top directory
/// * `specs` - Definitions in build order, as returned by synthesis
/// * `runner` - Executes `rpmbuild`
///
/// # Returns
///
/// * `Ok` with the copied packages sorted by path, each tagged with its definition kind
/// * `Err(BuildFailed)` when rpmbuild exits non-zero or produces nothing
/// * `Err(BuildSetupFailed)` when rpmbuild could not be started or its output not collected
pub fn build(
    config: &BuildConfig,
    specs: &[GeneratedSpec],
    runner: &dyn Runner,
) -> Result<Vec<BuiltPackage>, PipelineError> {
    let layout = BuildLayout::new(&config.build_dir);
    prepare(&layout, config).map_err(|e| PipelineError::build_setup("*", e))?;

    let dist_tag = config.dist_tag();
    for spec in specs {
        build_one(&layout, spec, &dist_tag, runner)?;
    }

    let packages = collect(&layout, &config.output_dir, specs)
        .map_err(|e| PipelineError::build_setup("*", e))?;
    info!(
        count = packages.len(),
        dir = %config.output_dir.display(),
        "collected derived packages"
    );
    Ok(packages)
}

/// rpmbuild request for `spec`.
pub fn rpmbuild_cmd(top: &Path, dist_tag: &str, spec: &Path) -> Cmd {
    Cmd::new("rpmbuild")
        .define("_topdir", &top.display().to_string())
        .define("dist", dist_tag)
        .arg("-bb")
        .arg_path(spec)
}

fn prepare(layout: &BuildLayout, config: &BuildConfig) -> Result<()> {
    // Results of an earlier run must not be collected as this run's output.
    let rpms = layout.rpms();
    if rpms.exists() {
        fs::remove_dir_all(&rpms)
            .with_context(|| format!("clearing build output '{}'", rpms.display()))?;
    }
    layout.prepare()?;

    if config.output_dir.exists() {
        fs::remove_dir_all(&config.output_dir).with_context(|| {
            format!("clearing output dir '{}'", config.output_dir.display())
        })?;
    }
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output dir '{}'", config.output_dir.display()))?;
    Ok(())
}

fn build_one(
    layout: &BuildLayout,
    spec: &GeneratedSpec,
    dist_tag: &str,
    runner: &dyn Runner,
) -> Result<(), PipelineError> {
    let file = spec.file_name();
    let setup_failed = |e: anyhow::Error| PipelineError::build_setup(&file, e);

    for source in &spec.sources {
        layout.stage_source(source).map_err(setup_failed)?;
    }
    if spec.kind == SpecKind::Kernel {
        layout.reset_scratch().map_err(setup_failed)?;
    }

    info!(spec = %file, kind = %spec.kind, "building derived package");
    let cmd = rpmbuild_cmd(layout.top(), dist_tag, &spec.path);
    let output = runner.run(&cmd).map_err(setup_failed)?;
    if !output.success() {
        return Err(PipelineError::BuildFailed {
            spec: file,
            code: output.code,
            output_tail: output.tail(OUTPUT_TAIL_LINES),
        });
    }

    require_product(layout, &spec.derived_name).map_err(|e| PipelineError::BuildFailed {
        spec: file.clone(),
        code: output.code,
        output_tail: format!("{e:#}\n{}", output.tail(OUTPUT_TAIL_LINES)),
    })?;
    debug!(spec = %file, "build finished");
    Ok(())
}

/// A zero exit without the expected package is still a failed build.
fn require_product(layout: &BuildLayout, derived_name: &str) -> Result<()> {
    let produced = layout.built_packages()?.iter().any(|p| {
        RpmFileName::from_path(p)
            .map(|r| r.name == derived_name)
            .unwrap_or(false)
    });
    if !produced {
        bail!(
            "rpmbuild exited 0 but no '{}' package appeared under '{}'",
            derived_name,
            layout.rpms().display()
        );
    }
    Ok(())
}

/// Kind of the definition that produced `name`.
///
/// Packages no definition claims (debuginfo and the like) fall back to a
/// guess from the name.
fn kind_of(specs: &[GeneratedSpec], name: &RpmFileName) -> SpecKind {
    if let Some(spec) = specs.iter().find(|s| s.derived_name == name.name) {
        return spec.kind;
    }
    let guessed = SpecKind::guess_from_name(&name.name);
    warn!(package = %name.name, kind = %guessed, "no definition produced this package; kind guessed from its name");
    guessed
}

fn collect(
    layout: &BuildLayout,
    output_dir: &Path,
    specs: &[GeneratedSpec],
) -> Result<Vec<BuiltPackage>> {
    let mut copied = Vec::new();
    for built in layout.built_packages()? {
        let Some(name) = built.file_name() else {
            continue;
        };
        let parsed = RpmFileName::from_path(&built).with_context(|| {
            format!("built package '{}' has no name-version-release.arch form", built.display())
        })?;
        let dest = output_dir.join(name);
        fs::copy(&built, &dest).with_context(|| {
            format!("copying '{}' to '{}'", built.display(), dest.display())
        })?;
        copied.push(BuiltPackage {
            kind: kind_of(specs, &parsed),
            path: dest,
        });
    }
    copied.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(copied)
}
