//! Publication of derived packages into the target repository.
//!
//! - [`index`] - repomd / primary metadata reader

pub mod index;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::IntegrationPolicy;
use crate::error::PipelineError;
use crate::package::{RpmFileName, DERIVED_SUFFIX};
use crate::process::{Cmd, Runner};
use crate::sign::derived_packages;
use index::RepositoryIndex;

/// Package sub-directory of the repository root.
pub const REPO_PACKAGE_SUBDIR: &str = "RPMS";

/// Outcome of one integration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Integration {
    pub copied: Vec<PathBuf>,
    pub removed_originals: Vec<PathBuf>,
    pub indexed_derived: Vec<String>,
}

/// Copy `package` into its arch directory under `repo_root` and confirm the copy.
fn publish(package: &Path, repo_root: &Path) -> Result<PathBuf> {
    let parsed = RpmFileName::from_path(package)
        .with_context(|| format!("'{}' is not an N-V-R.A.rpm file", package.display()))?;
    let dir = repo_root.join(REPO_PACKAGE_SUBDIR).join(&parsed.arch);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating repository dir '{}'", dir.display()))?;

    let name = package
        .file_name()
        .with_context(|| format!("'{}' has no file name", package.display()))?;
    let dest = dir.join(name);
    fs::copy(package, &dest).with_context(|| {
        format!("copying '{}' to '{}'", package.display(), dest.display())
    })?;

    let expected = fs::metadata(package)
        .with_context(|| format!("reading metadata '{}'", package.display()))?
        .len();
    match fs::metadata(&dest) {
        Ok(meta) if meta.is_file() && meta.len() == expected => Ok(dest),
        Ok(meta) => bail!(
            "copy of '{}' is incomplete: {} of {} bytes",
            dest.display(),
            meta.len(),
            expected
        ),
        Err(e) => bail!("copy of '{}' is missing after copy: {}", dest.display(), e),
    }
}

/// Remove originals in `dir` that `derived` stands in for.
fn remove_originals(dir: &Path, derived: &RpmFileName) -> Result<Vec<PathBuf>> {
    let Some(original) = derived.name.strip_suffix(DERIVED_SUFFIX) else {
        return Ok(Vec::new());
    };
    let mut removed = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading repository dir '{}'", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    for path in paths {
        let matches = RpmFileName::from_path(&path)
            .map(|p| p.name == original)
            .unwrap_or(false);
        if matches {
            fs::remove_file(&path)
                .with_context(|| format!("removing original '{}'", path.display()))?;
            removed.push(path);
        }
    }
    Ok(removed)
}

/// File names of `copied` packages with no entry of the same name, version,
/// release and arch in `index`.
fn unindexed_copies(index: &RepositoryIndex, copied: &[PathBuf]) -> Vec<String> {
    copied
        .iter()
        .filter_map(|path| {
            let parsed = RpmFileName::from_path(path)?;
            let listed = index.find(&parsed.name).iter().any(|p| {
                p.version == parsed.version && p.release == parsed.release && p.arch == parsed.arch
            });
            (!listed).then(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
        })
        .collect()
}

pub fn createrepo_cmd(repo_root: &Path) -> Cmd {
    Cmd::new("createrepo_c")
        .arg_path(repo_root)
        .error_msg("regenerating repository metadata")
}

fn integrate_inner(
    output_dir: &Path,
    repo_root: &Path,
    policy: IntegrationPolicy,
    runner: &dyn Runner,
) -> Result<Integration> {
    let packages = derived_packages(output_dir)?;
    if packages.is_empty() {
        bail!("no derived packages in '{}'", output_dir.display());
    }

    let mut result = Integration::default();
    for package in &packages {
        let dest = publish(package, repo_root)?;
        debug!(package = %dest.display(), "published");
        if policy == IntegrationPolicy::ReplaceOriginals {
            if let (Some(parsed), Some(dir)) = (RpmFileName::from_path(&dest), dest.parent()) {
                for removed in remove_originals(dir, &parsed)? {
                    warn!(package = %removed.display(), "removed original package");
                    result.removed_originals.push(removed);
                }
            }
        }
        result.copied.push(dest);
    }

    createrepo_cmd(repo_root).run_with(runner)?;

    let index = RepositoryIndex::load(repo_root)?;
    result.indexed_derived = index.derived().iter().map(|p| p.name.clone()).collect();
    result.indexed_derived.sort();
    result.indexed_derived.dedup();
    if result.indexed_derived.is_empty() {
        bail!(
            "regenerated index of '{}' lists no derived package",
            repo_root.display()
        );
    }

    let unindexed = unindexed_copies(&index, &result.copied);
    if !unindexed.is_empty() {
        bail!(
            "regenerated index of '{}' does not list published package(s): {}",
            repo_root.display(),
            unindexed.join(", ")
        );
    }
    Ok(result)
}

/// Publish every derived package in `output_dir` into `repo_root` and
/// regenerate the repository index over the whole repository.
///
/// # Arguments
///
/// * `output_dir` - Directory holding the built (and possibly signed) packages
/// * `repo_root` - Repository root; packages land in `RPMS/<arch>/`
/// * `policy` - Whether originals stay next to their derived packages
/// * `runner` - Executes `createrepo_c`
///
/// # Returns
///
/// * `Ok(Integration)` once every copied package is listed in the regenerated index
/// * `Err(IntegrationFailed)` on a failed copy, a failed reindex, or an index missing a copy
pub fn integrate(
    output_dir: &Path,
    repo_root: &Path,
    policy: IntegrationPolicy,
    runner: &dyn Runner,
) -> Result<Integration, PipelineError> {
    let result =
        integrate_inner(output_dir, repo_root, policy, runner).map_err(PipelineError::integration)?;
    info!(
        copied = result.copied.len(),
        removed = result.removed_originals.len(),
        indexed = ?result.indexed_derived,
        repo = %repo_root.display(),
        "repository updated"
    );
    Ok(result)
}
