//! Content-based package lookup.
//!
//! Packages are located by the files they install, not by their names: the
//! bootloader is whichever package ships the EFI loader path, kernels are
//! whatever ships a `/boot/vmlinuz-*` image. Name patterns are only used to
//! skip source packages and previously derived variants.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{query_identity, query_manifest, PackageDescriptor, RpmFileName};
use crate::process::Runner;

/// Whether manifest entry `path` satisfies `pattern`.
///
/// A trailing `*` turns the pattern into a prefix match; anything else must
/// match exactly.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix) && path.len() > prefix.len(),
        None => path == pattern,
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    manifest: Vec<String>,
}

impl Candidate {
    fn first_match(&self, pattern: &str) -> Option<&str> {
        self.manifest
            .iter()
            .find(|entry| pattern_matches(pattern, entry))
            .map(String::as_str)
    }
}

/// Manifests of every candidate package in a directory, queried once.
pub struct PackageLocator<'a> {
    runner: &'a dyn Runner,
    package_dir: PathBuf,
    candidates: Vec<Candidate>,
}

impl<'a> PackageLocator<'a> {
    /// Scan `package_dir` recursively and query the manifest of every candidate.
    ///
    /// Source packages and derived (`-mok`) packages are not candidates.
    /// Candidates are visited in sorted path order.
    pub fn scan(runner: &'a dyn Runner, package_dir: &Path) -> Result<Self> {
        let mut candidates = Vec::new();

        for entry in WalkDir::new(package_dir).sort_by_file_name() {
            let entry = entry.with_context(|| {
                format!("scanning package directory '{}'", package_dir.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(parsed) = RpmFileName::from_path(path) else {
                continue;
            };
            if parsed.is_source() {
                debug!(package = %path.display(), "skipping source package");
                continue;
            }
            if parsed.is_derived() {
                debug!(package = %path.display(), "skipping previously derived package");
                continue;
            }

            let manifest = query_manifest(runner, path)?;
            candidates.push(Candidate {
                path: path.to_path_buf(),
                manifest,
            });
        }

        debug!(
            dir = %package_dir.display(),
            count = candidates.len(),
            "indexed candidate packages"
        );

        Ok(Self {
            runner,
            package_dir: package_dir.to_path_buf(),
            candidates,
        })
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// First package providing `pattern`; later matches are logged and skipped.
    pub fn find_providing(&self, pattern: &str) -> Result<Option<PackageDescriptor>> {
        let mut matches = self
            .candidates
            .iter()
            .filter_map(|c| c.first_match(pattern).map(|hit| (c, hit)));

        let Some((chosen, hit)) = matches.next() else {
            return Ok(None);
        };
        for (skipped, skipped_hit) in matches {
            warn!(
                pattern,
                chosen = %chosen.path.display(),
                skipped = %skipped.path.display(),
                provides = skipped_hit,
                "multiple packages provide the same file; skipping candidate"
            );
        }

        query_identity(self.runner, &chosen.path, hit).map(Some)
    }

    /// Every package providing `pattern`, in scan order.
    pub fn find_all_providing(&self, pattern: &str) -> Result<Vec<PackageDescriptor>> {
        self.find_all_matching(pattern, |_| true)
    }

    /// Every package with a manifest entry matching `pattern` that `accept` also
    /// admits. The admitted entry becomes the descriptor's matched path.
    pub fn find_all_matching(
        &self,
        pattern: &str,
        accept: impl Fn(&str) -> bool,
    ) -> Result<Vec<PackageDescriptor>> {
        self.candidates
            .iter()
            .filter_map(|c| {
                c.manifest
                    .iter()
                    .find(|entry| pattern_matches(pattern, entry) && accept(entry))
                    .map(|hit| (c, hit.as_str()))
            })
            .map(|(c, hit)| query_identity(self.runner, &c.path, hit))
            .collect()
    }
}

/// One-shot lookup of the first package in `package_dir` providing `pattern`.
pub fn find_providing(
    runner: &dyn Runner,
    package_dir: &Path,
    pattern: &str,
) -> Result<Option<PackageDescriptor>> {
    PackageLocator::scan(runner, package_dir)?.find_providing(pattern)
}

/// One-shot lookup of every package in `package_dir` providing `pattern`.
pub fn find_all_providing(
    runner: &dyn Runner,
    package_dir: &Path,
    pattern: &str,
) -> Result<Vec<PackageDescriptor>> {
    PackageLocator::scan(runner, package_dir)?.find_all_providing(pattern)
}
