//! rpmbuild `_topdir` layout.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Sub-directories rpmbuild expects under its top directory.
pub const TOPDIR_SUBDIRS: [&str; 6] = ["BUILD", "BUILDROOT", "RPMS", "SOURCES", "SPECS", "SRPMS"];

/// Scratch areas shared between builds and emptied before each kernel build.
const SCRATCH_SUBDIRS: [&str; 2] = ["BUILD", "BUILDROOT"];

#[derive(Debug, Clone)]
pub struct BuildLayout {
    top: PathBuf,
}

impl BuildLayout {
    pub fn new(top: &Path) -> Self {
        Self {
            top: top.to_path_buf(),
        }
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    pub fn sources(&self) -> PathBuf {
        self.top.join("SOURCES")
    }

    pub fn rpms(&self) -> PathBuf {
        self.top.join("RPMS")
    }

    /// Create every sub-directory; existing content is kept.
    pub fn prepare(&self) -> Result<()> {
        for dir in TOPDIR_SUBDIRS {
            let path = self.top.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("creating build dir '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Empty `BUILD` and `BUILDROOT` so a build cannot see a previous build's files.
    pub fn reset_scratch(&self) -> Result<()> {
        for dir in SCRATCH_SUBDIRS {
            let path = self.top.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("clearing build scratch '{}'", path.display()))?;
            }
            fs::create_dir_all(&path)
                .with_context(|| format!("recreating build scratch '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Copy `file` into `SOURCES` under its own name.
    pub fn stage_source(&self, file: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .with_context(|| format!("source '{}' has no file name", file.display()))?;
        let dest = self.sources().join(name);
        fs::copy(file, &dest).with_context(|| {
            format!(
                "copying source '{}' to '{}'",
                file.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }

    /// Every `.rpm` under `RPMS`, sorted by path.
    pub fn built_packages(&self) -> Result<Vec<PathBuf>> {
        let rpms = self.rpms();
        let mut out = Vec::new();
        if !rpms.is_dir() {
            return Ok(out);
        }
        for entry in WalkDir::new(&rpms).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("scanning build output '{}'", rpms.display()))?;
            let is_rpm = entry
                .path()
                .extension()
                .map(|e| e == "rpm")
                .unwrap_or(false);
            if entry.file_type().is_file() && is_rpm {
                out.push(entry.into_path());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scratch_reset_keeps_outputs() {
        let tmp = TempDir::new().unwrap();
        let layout = BuildLayout::new(&tmp.path().join("rpmbuild"));
        layout.prepare().unwrap();
        for dir in TOPDIR_SUBDIRS {
            assert!(layout.top().join(dir).is_dir());
        }

        fs::write(layout.top().join("BUILD/stale"), "x").unwrap();
        fs::create_dir_all(layout.top().join("BUILDROOT/linux-mok/boot")).unwrap();
        fs::create_dir_all(layout.rpms().join("x86_64")).unwrap();
        fs::write(layout.rpms().join("x86_64/a-1-1.x86_64.rpm"), "").unwrap();

        layout.reset_scratch().unwrap();
        assert!(!layout.top().join("BUILD/stale").exists());
        assert_eq!(fs::read_dir(layout.top().join("BUILDROOT")).unwrap().count(), 0);
        assert_eq!(layout.built_packages().unwrap().len(), 1);
    }

    #[test]
    fn test_stage_source_copies_by_name() {
        let tmp = TempDir::new().unwrap();
        let layout = BuildLayout::new(tmp.path());
        layout.prepare().unwrap();
        let src = tmp.path().join("linux-6.1.159-7.ph5.x86_64.rpm");
        fs::write(&src, "payload").unwrap();

        let dest = layout.stage_source(&src).unwrap();
        assert_eq!(dest, layout.sources().join("linux-6.1.159-7.ph5.x86_64.rpm"));
        assert_eq!(fs::read_to_string(dest).unwrap(), "payload");
    }
}
