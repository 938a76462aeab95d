//! Repository-level signing of the derived packages.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::RepoSigning;
use crate::error::PipelineError;
use crate::package::RpmFileName;
use crate::process::{Cmd, Runner};

/// Marker `rpm -K` prints once a package carries a valid signature.
pub const SIGNED_MARKER: &str = "signatures OK";

/// Derived packages (`*-mok-*.rpm`) directly under `dir`, sorted.
pub fn derived_packages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading package dir '{}'", dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("reading directory entry in '{}'", dir.display()))?;
        let path = entry.path();
        let derived = RpmFileName::from_path(&path)
            .map(|p| p.is_derived() && !p.is_source())
            .unwrap_or(false);
        if path.is_file() && derived {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

pub fn rpmsign_cmd(signing: &RepoSigning, package: &Path) -> Cmd {
    Cmd::new("rpmsign")
        .arg("--addsign")
        .define("_gpg_name", &signing.identity)
        .define("_gpg_path", &signing.keyring.display().to_string())
        .arg_path(package)
}

fn sign_one(runner: &dyn Runner, signing: &RepoSigning, package: &Path) -> Result<()> {
    rpmsign_cmd(signing, package)
        .error_msg(&format!("signing '{}'", package.display()))
        .run_with(runner)?;

    let check = Cmd::new("rpm")
        .arg("-K")
        .arg_path(package)
        .error_msg(&format!("checking signature of '{}'", package.display()))
        .run_with(runner)?;
    if !check.stdout.contains(SIGNED_MARKER) {
        bail!(
            "signature not confirmed after signing: {}",
            check.combined().trim()
        );
    }
    Ok(())
}

/// Sign every derived package in `output_dir`.
///
/// # Arguments
///
/// * `output_dir` - Directory holding the built packages
/// * `signing` - GnuPG home and key identity handed to `rpmsign`
/// * `runner` - Executes `rpmsign` and the `rpm -K` re-check
///
/// # Returns
///
/// * `Ok(n)` with the number of packages signed; an empty directory signs nothing
/// * `Err(SignFailed)` naming the first package that failed to sign or re-check
pub fn sign(
    output_dir: &Path,
    signing: &RepoSigning,
    runner: &dyn Runner,
) -> Result<usize, PipelineError> {
    let packages = derived_packages(output_dir).map_err(|e| PipelineError::sign("*", e))?;
    if packages.is_empty() {
        info!(dir = %output_dir.display(), "no derived packages to sign");
        return Ok(0);
    }

    for package in &packages {
        let name = package
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        sign_one(runner, signing, package).map_err(|e| PipelineError::sign(&name, e))?;
        debug!(package = %name, "signed");
    }

    info!(
        count = packages.len(),
        identity = %signing.identity,
        "signed derived packages"
    );
    Ok(packages.len())
}
