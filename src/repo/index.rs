//! Read-back of regenerated repository metadata.
//!
//! `repodata/repomd.xml` names the primary metadata file; that file may be
//! plain, gzip or zstd compressed depending on the createrepo_c version.

use anyhow::{bail, Context, Result};
use roxmltree::Document;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::package::DERIVED_SUFFIX;

/// One package entry of the primary metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPackage {
    pub name: String,
    pub arch: String,
    pub version: String,
    pub release: String,
    /// Repository-relative location.
    pub location: String,
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryIndex {
    packages: Vec<IndexedPackage>,
}

impl RepositoryIndex {
    /// Load the primary metadata of the repository rooted at `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let repomd_path = root.join("repodata/repomd.xml");
        let repomd = fs::read_to_string(&repomd_path)
            .with_context(|| format!("reading '{}'", repomd_path.display()))?;
        let primary = root.join(primary_location(&repomd).with_context(|| {
            format!("locating primary metadata in '{}'", repomd_path.display())
        })?);

        let xml = read_maybe_compressed(&primary)?;
        let packages = parse_primary(&xml)
            .with_context(|| format!("parsing '{}'", primary.display()))?;
        Ok(Self { packages })
    }

    pub fn packages(&self) -> &[IndexedPackage] {
        &self.packages
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }

    /// Entries named `name`.
    pub fn find(&self, name: &str) -> Vec<&IndexedPackage> {
        self.packages.iter().filter(|p| p.name == name).collect()
    }

    /// Entries whose name carries the derived suffix.
    pub fn derived(&self) -> Vec<&IndexedPackage> {
        self.packages
            .iter()
            .filter(|p| p.name.ends_with(DERIVED_SUFFIX))
            .collect()
    }
}

fn primary_location(repomd: &str) -> Result<PathBuf> {
    let doc = Document::parse(repomd)?;
    for data in doc.descendants().filter(|n| n.has_tag_name("data")) {
        if data.attribute("type") != Some("primary") {
            continue;
        }
        let href = data
            .children()
            .find(|c| c.has_tag_name("location"))
            .and_then(|l| l.attribute("href"));
        if let Some(href) = href {
            return Ok(PathBuf::from(href));
        }
    }
    bail!("no primary data entry")
}

fn read_maybe_compressed(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mut xml = String::new();
    let read = match ext {
        "gz" => flate2::read::GzDecoder::new(file).read_to_string(&mut xml),
        "zst" => zstd::stream::Decoder::new(file)
            .with_context(|| format!("opening zstd stream '{}'", path.display()))?
            .read_to_string(&mut xml),
        _ => {
            let mut file = file;
            file.read_to_string(&mut xml)
        }
    };
    read.with_context(|| format!("reading '{}'", path.display()))?;
    Ok(xml)
}

fn parse_primary(xml: &str) -> Result<Vec<IndexedPackage>> {
    let doc = Document::parse(xml)?;
    let mut out = Vec::new();
    for pkg in doc.descendants().filter(|n| n.has_tag_name("package")) {
        let child = |tag: &str| pkg.children().find(|c| c.has_tag_name(tag));
        let text = |tag: &str| {
            child(tag)
                .and_then(|n| n.text())
                .map(|t| t.trim().to_string())
                .unwrap_or_default()
        };
        let name = text("name");
        if name.is_empty() {
            continue;
        }
        let version = child("version");
        out.push(IndexedPackage {
            name,
            arch: text("arch"),
            version: version
                .and_then(|v| v.attribute("ver"))
                .unwrap_or_default()
                .to_string(),
            release: version
                .and_then(|v| v.attribute("rel"))
                .unwrap_or_default()
                .to_string(),
            location: child("location")
                .and_then(|l| l.attribute("href"))
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(out)
}
