//! Signed bootloader image definition.

use anyhow::Result;
use std::fmt::Write as _;

use super::template::{Preamble, TemplateTags};
use super::token;
use crate::config::BuildConfig;
use crate::efi::EFI_BOOT_DIR;
use crate::package::PackageDescriptor;

/// Modules linked into the standalone image. The token gate needs
/// `search_label`, `chain` and `sleep`.
const GRUB_MODULES: &[&str] = &[
    "all_video",
    "boot",
    "chain",
    "configfile",
    "echo",
    "efi_gop",
    "ext2",
    "fat",
    "linux",
    "loadenv",
    "normal",
    "part_gpt",
    "part_msdos",
    "search",
    "search_fs_file",
    "search_label",
    "sleep",
    "test",
];

/// Name the image is also installed under for loaders expecting it.
const GRUB_ALIAS: &str = "grub.efi";

pub fn render(config: &BuildConfig, orig: &PackageDescriptor, dist_tag: &str) -> Result<String> {
    let tags = TemplateTags::read(orig.spec_path.as_deref())?;
    let arch = config.arch;
    let image = arch.grub_image();

    let mut out = Preamble {
        original: orig,
        summary: format!("{} signed with a Machine Owner Key", orig.name),
        tags: tags.clone(),
        dist_tag,
        sources: vec![orig.file_name()],
        globals: vec![
            ("efidir", EFI_BOOT_DIR.to_string()),
            ("grub_target", arch.grub_target().to_string()),
            ("mok_key", config.signing_key.display().to_string()),
            ("mok_cert", config.signing_cert.display().to_string()),
        ],
    }
    .render();

    let _ = writeln!(out, "%description");
    let _ = writeln!(
        out,
        "Standalone {image} rebuilt from {} with SBAT metadata and signed\n\
         with a locally controlled Machine Owner Key.",
        orig.name
    );
    out.push('\n');

    out.push_str("%prep\n");
    out.push_str("%setup -q -c -T\n");
    out.push_str("rpm2cpio %{SOURCE0} | cpio -idmu --quiet\n\n");

    out.push_str("%build\n");
    out.push_str("moddir=usr/lib/grub/%{grub_target}\n");
    out.push_str("[ -d \"$moddir\" ] || moddir=/usr/lib/grub/%{grub_target}\n");
    out.push_str("cat > grub.cfg <<'EOF'\n");
    out.push_str("search --no-floppy --file --set=root /boot/grub2/grub.cfg\n");
    out.push_str("set prefix=($root)/boot/grub2\n");
    out.push_str("configfile $prefix/grub.cfg\n");
    out.push_str("EOF\n");
    out.push_str("cat > sbat.csv <<EOF\n");
    out.push_str("sbat,1,SBAT Version,sbat,1,https://github.com/rhboot/shim/blob/main/SBAT.md\n");
    out.push_str("grub,3,Free Software Foundation,grub,%{version},https://www.gnu.org/software/grub/\n");
    let _ = writeln!(
        out,
        "grub.mok,1,{},%{{name}},%{{version}}-%{{release}},{}",
        tags.vendor.replace(',', " "),
        tags.url
    );
    out.push_str("EOF\n");
    let _ = writeln!(
        out,
        "grub2-mkimage -O %{{grub_target}} -d \"$moddir\" -c grub.cfg --sbat sbat.csv \\\n    -p /boot/grub2 -o grub-unsigned.efi {}",
        GRUB_MODULES.join(" ")
    );
    out.push_str(
        "sbsign --key %{mok_key} --cert %{mok_cert} --output grub-signed.efi grub-unsigned.efi\n\n",
    );

    out.push_str("%install\n");
    out.push_str("install -d %{buildroot}%{efidir}\n");
    let _ = writeln!(out, "install -m 0644 grub-signed.efi %{{buildroot}}%{{efidir}}/{image}");
    let _ = writeln!(out, "install -m 0644 grub-signed.efi %{{buildroot}}%{{efidir}}/{GRUB_ALIAS}");
    out.push('\n');

    if config.require_hardware_token {
        out.push_str("%post\n");
        out.push_str(&token::post_script(&config.token, image));
        out.push('\n');
        out.push_str("%postun\n");
        out.push_str(&token::postun_script());
        out.push('\n');
    }

    out.push_str("%files\n");
    out.push_str("%defattr(-,root,root)\n");
    let _ = writeln!(out, "%{{efidir}}/{image}");
    let _ = writeln!(out, "%{{efidir}}/{GRUB_ALIAS}");

    Ok(out)
}
