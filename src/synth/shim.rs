//! Verbatim shim repackaging.
//!
//! The first-stage loader is vendor-signed and must not be touched; it is
//! copied as-is together with MokManager and, when available, the DER form of
//! the MOK certificate for enrollment from disk.

use anyhow::Result;
use std::fmt::Write as _;

use super::template::{Preamble, TemplateTags};
use crate::config::BuildConfig;
use crate::efi::{EfiArch, EFI_BOOT_DIR};
use crate::package::PackageDescriptor;

/// Sources referenced by the shim definition, in `SourceN` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimSources {
    pub loader: PackageDescriptor,
    pub manager: Option<PackageDescriptor>,
    pub mok_der: Option<std::path::PathBuf>,
}

pub fn render(config: &BuildConfig, sources: &ShimSources, dist_tag: &str) -> Result<String> {
    let loader = &sources.loader;
    let arch = config.arch;
    let tags = TemplateTags::read(loader.spec_path.as_deref())?;

    let mut source_files = vec![loader.file_name()];
    let manager_index = sources.manager.as_ref().map(|m| {
        source_files.push(m.file_name());
        source_files.len() - 1
    });
    let der_index = sources.mok_der.as_ref().map(|p| {
        source_files.push(
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| config.mok_der_name.clone()),
        );
        source_files.len() - 1
    });

    let mut out = Preamble {
        original: loader,
        summary: format!("{} repackaged for Machine Owner Key enrollment", loader.name),
        tags,
        dist_tag,
        sources: source_files,
        globals: vec![("efidir", EFI_BOOT_DIR.to_string())],
    }
    .render();

    let _ = writeln!(out, "%description");
    let _ = writeln!(
        out,
        "Vendor-signed {} and {} from {}, unchanged.",
        arch.shim_image(),
        arch.mok_manager(),
        loader.name
    );
    out.push('\n');

    out.push_str("%prep\n");
    out.push_str("%setup -q -c -T\n");
    out.push_str("mkdir -p loader manager\n");
    out.push_str("(cd loader && rpm2cpio %{SOURCE0} | cpio -idmu --quiet)\n");
    if let Some(i) = manager_index {
        let _ = writeln!(out, "(cd manager && rpm2cpio %{{SOURCE{i}}} | cpio -idmu --quiet)");
    }
    out.push('\n');

    out.push_str("%install\n");
    out.push_str("install -d %{buildroot}%{efidir}\n");
    let loader_path = loader.matched_path.trim_start_matches('/');
    let _ = writeln!(
        out,
        "install -m 0644 loader/{loader_path} %{{buildroot}}%{{efidir}}/{}",
        arch.shim_image()
    );
    match &sources.manager {
        Some(manager) => {
            let _ = writeln!(
                out,
                "install -m 0644 manager/{} %{{buildroot}}%{{efidir}}/{}",
                manager.matched_path.trim_start_matches('/'),
                arch.mok_manager()
            );
        }
        None => {
            let bundled = EfiArch::efi_path(arch.mok_manager());
            let _ = writeln!(
                out,
                "[ -f loader{bundled} ] && install -m 0644 loader{bundled} %{{buildroot}}%{{efidir}}/{}",
                arch.mok_manager()
            );
        }
    }
    if let Some(i) = der_index {
        let _ = writeln!(
            out,
            "install -m 0644 %{{SOURCE{i}}} %{{buildroot}}%{{efidir}}/{}",
            config.mok_der_name
        );
    }
    out.push_str(
        "(cd %{buildroot} && find . -type f | sed 's|^\\.||' | sort) > shim-files.list\n\n",
    );

    out.push_str("%files -f shim-files.list\n");
    out.push_str("%defattr(-,root,root)\n");

    Ok(out)
}
