//! Firmware-facing boot file names per architecture.

use anyhow::{bail, Result};
use std::fmt;

/// Directory the firmware falls back to on removable and fresh installs.
pub const EFI_BOOT_DIR: &str = "/boot/efi/EFI/BOOT";

/// Prefix of installed kernel images; the remainder is the kernel release.
pub const KERNEL_IMAGE_PREFIX: &str = "/boot/vmlinuz-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfiArch {
    X64,
    Aa64,
}

impl EfiArch {
    /// Map an rpm architecture (`x86_64`, `aarch64`) to its EFI naming.
    pub fn from_rpm_arch(arch: &str) -> Result<Self> {
        match arch {
            "x86_64" => Ok(EfiArch::X64),
            "aarch64" => Ok(EfiArch::Aa64),
            other => bail!(
                "unsupported architecture '{}' (expected x86_64 or aarch64)",
                other
            ),
        }
    }

    pub fn rpm_arch(self) -> &'static str {
        match self {
            EfiArch::X64 => "x86_64",
            EfiArch::Aa64 => "aarch64",
        }
    }

    /// grub2-mkimage `-O` target.
    pub fn grub_target(self) -> &'static str {
        match self {
            EfiArch::X64 => "x86_64-efi",
            EfiArch::Aa64 => "arm64-efi",
        }
    }

    /// Second-stage loader the shim chain-loads.
    pub fn grub_image(self) -> &'static str {
        match self {
            EfiArch::X64 => "grubx64.efi",
            EfiArch::Aa64 => "grubaa64.efi",
        }
    }

    /// First-stage loader the firmware starts.
    pub fn shim_image(self) -> &'static str {
        match self {
            EfiArch::X64 => "bootx64.efi",
            EfiArch::Aa64 => "bootaa64.efi",
        }
    }

    /// Key-enrollment utility (MokManager).
    pub fn mok_manager(self) -> &'static str {
        match self {
            EfiArch::X64 => "mmx64.efi",
            EfiArch::Aa64 => "mmaa64.efi",
        }
    }

    pub fn efi_path(file: &str) -> String {
        format!("{}/{}", EFI_BOOT_DIR, file)
    }
}

impl fmt::Display for EfiArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rpm_arch())
    }
}
