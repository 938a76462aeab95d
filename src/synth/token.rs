//! Boot-time hardware token gate.
//!
//! The gate is prepended to the installed `grub.cfg` by the bootloader
//! package's `%post` and removed again by `%postun`. Without the token volume
//! the retry path chain-loads the bootloader image again: a `configfile`
//! reload would reuse the device list scanned at startup and never see a
//! volume inserted afterwards.

use std::fmt::Write as _;

use crate::config::TokenSettings;
use crate::efi::EFI_BOOT_DIR;

pub const GATE_BEGIN: &str = "### BEGIN mok-token-gate ###";
pub const GATE_END: &str = "### END mok-token-gate ###";

/// Installed bootloader configuration the gate is written into.
pub const GRUB_CFG: &str = "/boot/grub2/grub.cfg";

/// ESP-relative path of the image the retry path chain-loads.
fn esp_path(grub_image: &str) -> String {
    let dir = EFI_BOOT_DIR.trim_start_matches("/boot/efi");
    format!("{dir}/{grub_image}")
}

/// grub script fragment enforcing the token, delimited by the gate markers.
pub fn grub_gate(token: &TokenSettings, grub_image: &str) -> String {
    let image = esp_path(grub_image);
    let mut out = String::new();
    let _ = writeln!(out, "{GATE_BEGIN}");
    out.push_str("set mok_token_ok=0\n");
    let _ = writeln!(
        out,
        "if search --no-floppy --label {} --set=mok_token; then",
        token.label
    );
    let _ = writeln!(out, "  if [ -f (${{mok_token}})/{} ]; then", token.proof_file);
    out.push_str("    set mok_token_ok=1\n");
    out.push_str("  fi\n");
    out.push_str("fi\n");
    out.push_str("if [ \"${mok_token_ok}\" != \"1\" ]; then\n");
    let _ = writeln!(
        out,
        "  echo \"Insert the {} volume to continue booting.\"",
        token.label
    );
    out.push_str("  sleep 5\n");
    let _ = writeln!(out, "  search --no-floppy --file --set=mok_esp {image}");
    let _ = writeln!(out, "  chainloader (${{mok_esp}}){image}");
    out.push_str("  boot\n");
    out.push_str("fi\n");
    let _ = writeln!(out, "{GATE_END}");
    out
}

/// `%post` body: prepend the gate once.
pub fn post_script(token: &TokenSettings, grub_image: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "cfg={GRUB_CFG}");
    let _ = writeln!(
        out,
        "if [ -f \"$cfg\" ] && ! grep -qxF '{GATE_BEGIN}' \"$cfg\"; then"
    );
    out.push_str("  tmp=$(mktemp \"$cfg.XXXXXX\")\n");
    out.push_str("  cat > \"$tmp\" <<'MOK_TOKEN_GATE'\n");
    out.push_str(&grub_gate(token, grub_image));
    out.push_str("MOK_TOKEN_GATE\n");
    out.push_str("  cat \"$cfg\" >> \"$tmp\"\n");
    out.push_str("  chmod --reference=\"$cfg\" \"$tmp\"\n");
    out.push_str("  mv -f \"$tmp\" \"$cfg\"\n");
    out.push_str("fi\n");
    out
}

/// `%postun` body: drop the gate on final removal.
pub fn postun_script() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "if [ \"$1\" = 0 ] && [ -f {GRUB_CFG} ]; then");
    let _ = writeln!(
        out,
        "  sed -i '\\|^{GATE_BEGIN}$|,\\|^{GATE_END}$|d' {GRUB_CFG}"
    );
    out.push_str("fi\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_reloads_bootloader_not_config() {
        let gate = grub_gate(&TokenSettings::default(), "grubx64.efi");
        assert!(gate.starts_with(GATE_BEGIN));
        assert!(gate.trim_end().ends_with(GATE_END));
        assert!(gate.contains("search --no-floppy --label MOKTOKEN --set=mok_token"));
        assert!(gate.contains("(${mok_token})/mok-token.proof"));
        assert!(gate.contains("chainloader (${mok_esp})/EFI/BOOT/grubx64.efi\n  boot\n"));
        assert!(!gate.contains("configfile"));
    }

    #[test]
    fn test_post_is_guarded_by_marker() {
        let token = TokenSettings {
            label: "KEYDISK".into(),
            proof_file: "proof.bin".into(),
        };
        let post = post_script(&token, "grubaa64.efi");
        assert!(post.contains(&format!("grep -qxF '{GATE_BEGIN}'")));
        assert!(post.contains("--label KEYDISK"));
        assert!(post.contains("/EFI/BOOT/grubaa64.efi"));

        let postun = postun_script();
        assert!(postun.contains(GATE_BEGIN));
        assert!(postun.contains(GATE_END));
        assert!(postun.contains("\"$1\" = 0"));
    }
}
