//! Shared preamble of every generated build definition.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::package::PackageDescriptor;

/// Metadata tags carried over from the distribution template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTags {
    pub license: String,
    pub url: String,
    pub vendor: String,
    pub distribution: String,
    pub group: String,
}

impl Default for TemplateTags {
    fn default() -> Self {
        Self {
            license: "Redistributable".to_string(),
            url: "https://github.com/vmware/photon".to_string(),
            vendor: "VMware, Inc.".to_string(),
            distribution: "Photon".to_string(),
            group: "System Environment/Base".to_string(),
        }
    }
}

impl TemplateTags {
    /// Read the tags from `template`, or defaults when there is none.
    pub fn read(template: Option<&Path>) -> Result<Self> {
        let Some(path) = template else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading template '{}'", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Only the preamble is inspected; sub-package sections stop the scan.
    pub fn parse(text: &str) -> Self {
        let mut tags = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('%') && !line.starts_with("%global") && !line.starts_with("%define") {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            // Macro-laden values cannot be expanded outside rpmbuild.
            if value.is_empty() || value.contains("%{") {
                continue;
            }
            let slot = match key.trim().to_ascii_lowercase().as_str() {
                "license" => &mut tags.license,
                "url" => &mut tags.url,
                "vendor" => &mut tags.vendor,
                "distribution" => &mut tags.distribution,
                "group" => &mut tags.group,
                _ => continue,
            };
            *slot = value.to_string();
        }
        tags
    }
}

/// Original release with a trailing dist tag stripped, re-tagged at build time.
pub fn derived_release(release: &str, dist_tag: &str) -> String {
    let base = release.strip_suffix(dist_tag).unwrap_or(release);
    format!("{base}%{{?dist}}")
}

/// Fail when any identity field a definition is rendered from is empty.
pub fn require_identity(desc: &PackageDescriptor) -> Result<()> {
    for (field, value) in [
        ("name", &desc.name),
        ("version", &desc.version),
        ("release", &desc.release),
        ("architecture", &desc.architecture),
    ] {
        if value.trim().is_empty() {
            bail!("package '{}' has an empty {}", desc.path.display(), field);
        }
    }
    if desc.path.file_name().is_none() {
        bail!("package path '{}' has no file name", desc.path.display());
    }
    Ok(())
}

/// Preamble fields of one derived package.
#[derive(Debug)]
pub struct Preamble<'a> {
    pub original: &'a PackageDescriptor,
    pub summary: String,
    pub tags: TemplateTags,
    pub dist_tag: &'a str,
    /// `SourceN:` entries in order; index 0 is always the original package.
    pub sources: Vec<String>,
    /// `%global` definitions emitted ahead of the preamble.
    pub globals: Vec<(&'static str, String)>,
}

impl Preamble<'_> {
    pub fn render(&self) -> String {
        let orig = self.original;
        let mut out = String::new();

        out.push_str("%global debug_package %{nil}\n");
        // Signed binaries must reach the payload untouched.
        out.push_str("%global __os_install_post %{nil}\n");
        for (name, value) in &self.globals {
            let _ = writeln!(out, "%global {name} {value}");
        }
        out.push('\n');

        let _ = writeln!(out, "Summary:        {}", self.summary);
        let _ = writeln!(out, "Name:           {}", orig.derived_name());
        let _ = writeln!(out, "Version:        {}", orig.version);
        let _ = writeln!(out, "Release:        {}", derived_release(&orig.release, self.dist_tag));
        out.push_str("Epoch:          1\n");
        let _ = writeln!(out, "License:        {}", self.tags.license);
        let _ = writeln!(out, "URL:            {}", self.tags.url);
        let _ = writeln!(out, "Group:          {}", self.tags.group);
        let _ = writeln!(out, "Vendor:         {}", self.tags.vendor);
        let _ = writeln!(out, "Distribution:   {}", self.tags.distribution);
        let _ = writeln!(out, "ExclusiveArch:  {}", orig.architecture);
        for (i, source) in self.sources.iter().enumerate() {
            let _ = writeln!(out, "Source{i}:        {source}");
        }
        let _ = writeln!(out, "Provides:       {} = 1:%{{version}}-%{{release}}", orig.name);
        let _ = writeln!(out, "Conflicts:      {}", orig.name);
        out.push_str("AutoReqProv:    no\n");
        out.push('\n');
        out
    }
}
