//! Binary package identity and queries.
//!
//! - [`locator`] - find packages by the files they provide
//! - [`templates`] - find build-definition templates by package name

pub mod locator;
pub mod templates;

pub use locator::{find_all_providing, find_providing, PackageLocator};
pub use templates::find_template;

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};

/// Suffix appended to a package name to form its derived variant.
pub const DERIVED_SUFFIX: &str = "-mok";

const IDENTITY_QUERYFORMAT: &str = "%{NAME}\\n%{VERSION}\\n%{RELEASE}\\n%{ARCH}\\n";

/// Identity of one binary package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub release: String,
    pub architecture: String,
    /// Build-definition template the package was built from, when one was found.
    pub spec_path: Option<PathBuf>,
    /// Manifest entry that satisfied the lookup (e.g. `/boot/vmlinuz-6.1.159-7.ph5-esx`).
    pub matched_path: String,
}

impl PackageDescriptor {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name of the derived package built from this one.
    pub fn derived_name(&self) -> String {
        format!("{}{}", self.name, DERIVED_SUFFIX)
    }

    /// Order by version, then release, the way rpm orders them.
    pub fn cmp_version_release(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
            .then_with(|| compare_versions(&self.release, &other.release))
    }

    /// Kernel release string of a kernel package, from its matched image path.
    pub fn kernel_release(&self) -> Option<&str> {
        self.matched_path
            .strip_prefix("/boot/vmlinuz-")
            .filter(|kver| !kver.is_empty() && !kver.contains('/'))
    }
}

/// Parsed `N-V-R.A.rpm` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmFileName {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl RpmFileName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".rpm")?;
        let (nvr, arch) = stem.rsplit_once('.')?;
        let (nv, release) = nvr.rsplit_once('-')?;
        let (name, version) = nv.rsplit_once('-')?;
        if name.is_empty() || version.is_empty() || release.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse)
    }

    pub fn is_source(&self) -> bool {
        self.arch == "src" || self.arch == "nosrc"
    }

    pub fn is_derived(&self) -> bool {
        self.name.ends_with(DERIVED_SUFFIX)
    }
}

/// Compare two version or release strings segment by segment.
///
/// Runs of digits compare numerically and beat runs of letters; separators
/// only delimit segments. With all shared segments equal, the string with
/// segments left over is newer.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        a = a.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        b = b.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        if a.is_empty() || b.is_empty() {
            return a.len().min(1).cmp(&b.len().min(1));
        }

        let (a_seg, a_rest) = split_segment(a);
        let (b_seg, b_rest) = split_segment(b);
        let a_numeric = a_seg.starts_with(|c: char| c.is_ascii_digit());
        let b_numeric = b_seg.starts_with(|c: char| c.is_ascii_digit());
        let ord = match (a_numeric, b_numeric) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => {
                let a_num = a_seg.trim_start_matches('0');
                let b_num = b_seg.trim_start_matches('0');
                a_num.len().cmp(&b_num.len()).then_with(|| a_num.cmp(b_num))
            }
            (false, false) => a_seg.cmp(b_seg),
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a = a_rest;
        b = b_rest;
    }
}

/// Leading run of digits or of letters, and the rest.
fn split_segment(s: &str) -> (&str, &str) {
    let numeric = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| {
            if numeric {
                !c.is_ascii_digit()
            } else {
                !c.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Query the file manifest of a package file.
pub fn query_manifest(runner: &dyn Runner, package: &Path) -> Result<Vec<String>> {
    let out = Cmd::new("rpm")
        .arg("-qlp")
        .arg_path(package)
        .error_msg(&format!("querying file list of '{}'", package.display()))
        .run_with(runner)?;

    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/'))
        .map(str::to_string)
        .collect())
}

/// Query name, version, release and architecture of a package file.
pub fn query_identity(
    runner: &dyn Runner,
    package: &Path,
    matched_path: &str,
) -> Result<PackageDescriptor> {
    let out = Cmd::new("rpm")
        .args(["-qp", "--queryformat", IDENTITY_QUERYFORMAT])
        .arg_path(package)
        .error_msg(&format!("querying identity of '{}'", package.display()))
        .run_with(runner)?;

    let fields: Vec<&str> = out.stdout.lines().map(str::trim).collect();
    let [name, version, release, arch] = fields.as_slice() else {
        bail!(
            "unexpected identity output for '{}': {:?}",
            package.display(),
            out.stdout.trim()
        );
    };
    if [name, version, release, arch].iter().any(|f| f.is_empty()) {
        bail!(
            "incomplete identity for '{}': {:?}",
            package.display(),
            out.stdout.trim()
        );
    }

    Ok(PackageDescriptor {
        path: package.to_path_buf(),
        name: name.to_string(),
        version: version.to_string(),
        release: release.to_string(),
        architecture: arch.to_string(),
        spec_path: None,
        matched_path: matched_path.to_string(),
    })
}
