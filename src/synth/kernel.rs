//! Signed kernel variant definitions, one per discovered kernel package.
//!
//! Extraction is restricted to the files named after this variant's kernel
//! release. Module trees are matched as `lib/modules/<kver>/*`; the trailing
//! separator keeps `6.1.159-7.ph5` from also pulling in `6.1.159-7.ph5-esx`.
//! cpio matches without `FNM_PATHNAME`, so that `*` also crosses directories
//! below the release directory.

use anyhow::{anyhow, Result};
use std::fmt::Write as _;

use super::template::{Preamble, TemplateTags};
use crate::config::BuildConfig;
use crate::package::PackageDescriptor;

/// Parameters added to `photon_cmdline` so slow removable media and early
/// console output work.
pub const EXTRA_CMDLINE: &str = "rootwait rootdelay=10 console=tty0 loglevel=7";

/// Default-kernel pointer repointed at the installed variant.
const PHOTON_CFG: &str = "/boot/photon.cfg";

/// Payload members extracted from the original package, relative to its root.
pub fn extraction_patterns() -> [&'static str; 5] {
    [
        "./boot/vmlinuz-%{kver}",
        "./boot/System.map-%{kver}",
        "./boot/config-%{kver}",
        "./boot/linux-%{kver}.cfg",
        "./lib/modules/%{kver}/*",
    ]
}

pub fn render(config: &BuildConfig, orig: &PackageDescriptor, dist_tag: &str) -> Result<String> {
    let kver = orig.kernel_release().ok_or_else(|| {
        anyhow!(
            "cannot derive kernel release from '{}' in '{}'",
            orig.matched_path,
            orig.file_name()
        )
    })?;
    let tags = TemplateTags::read(orig.spec_path.as_deref())?;
    let local_kernel = config.local_kernel_dir.join(orig.derived_name());

    let mut out = Preamble {
        original: orig,
        summary: format!("Kernel {kver} signed with a Machine Owner Key"),
        tags,
        dist_tag,
        sources: vec![orig.file_name()],
        globals: vec![
            ("kver", kver.to_string()),
            ("mok_key", config.signing_key.display().to_string()),
            ("mok_cert", config.signing_cert.display().to_string()),
            ("local_kernel", local_kernel.display().to_string()),
        ],
    }
    .render();

    let _ = writeln!(out, "%description");
    let _ = writeln!(
        out,
        "Kernel image, modules and initrd of {} ({kver}), with the image\n\
         signed by a locally controlled Machine Owner Key.",
        orig.name
    );
    out.push('\n');

    out.push_str("%prep\n");
    out.push_str("%setup -q -c -T\n");
    out.push_str("rpm2cpio %{SOURCE0} | cpio -idmu --quiet");
    for pattern in extraction_patterns() {
        let _ = write!(out, " \\\n    '{pattern}'");
    }
    out.push_str("\n\n");

    out.push_str("%build\n");
    out.push_str("modver=%{kver}\n");
    out.push_str("if [ -f %{local_kernel}/vmlinuz ]; then\n");
    out.push_str("  cp -f %{local_kernel}/vmlinuz boot/vmlinuz-%{kver}\n");
    out.push_str("  if [ -d %{local_kernel}/modules ]; then\n");
    out.push_str("    modver=$(ls -1 %{local_kernel}/modules | sort | head -n 1)\n");
    out.push_str("    rm -rf lib/modules/%{kver}\n");
    out.push_str("    mkdir -p lib/modules\n");
    out.push_str("    cp -a %{local_kernel}/modules/\"$modver\" lib/modules/\"$modver\"\n");
    out.push_str("  fi\n");
    out.push_str("fi\n");
    out.push_str("echo \"$modver\" > modver\n");
    out.push_str("depmod -b \"$PWD\" \"$modver\"\n");
    out.push_str(
        "dracut --force --no-hostonly --kver \"$modver\" --kmoddir \"$PWD/lib/modules/$modver\" \\\n    boot/initrd.img-%{kver}\n",
    );
    out.push_str("if [ -f boot/linux-%{kver}.cfg ]; then\n");
    let _ = writeln!(
        out,
        "  sed -i -e '/^photon_cmdline=/{{s/\\bquiet\\b//g;s/  */ /g;s/ *$/ {EXTRA_CMDLINE}/}}' boot/linux-%{{kver}}.cfg"
    );
    out.push_str("fi\n");
    out.push_str(
        "sbsign --key %{mok_key} --cert %{mok_cert} --output boot/vmlinuz-%{kver}.signed boot/vmlinuz-%{kver}\n",
    );
    out.push_str("mv -f boot/vmlinuz-%{kver}.signed boot/vmlinuz-%{kver}\n\n");

    out.push_str("%install\n");
    out.push_str("install -d %{buildroot}/boot %{buildroot}/lib/modules\n");
    out.push_str("cp -a boot/. %{buildroot}/boot/\n");
    out.push_str("cp -a lib/modules/. %{buildroot}/lib/modules/\n");
    out.push_str("install -m 0644 modver %{buildroot}/boot/.%{name}.modver\n");
    out.push_str(
        "(cd %{buildroot} && find . \\( -type f -o -type l \\) | sed 's|^\\.||' | sort) > kernel-files.list\n",
    );
    // module directories are owned by the package, not only the files in them
    out.push_str(
        "(cd %{buildroot} && find ./lib/modules -mindepth 1 -type d | sed 's|^\\.|%dir |' | sort) >> kernel-files.list\n\n",
    );

    out.push_str("%post\n");
    out.push_str("modver=$(cat /boot/.%{name}.modver 2>/dev/null || echo %{kver})\n");
    out.push_str("if [ \"$modver\" != \"%{kver}\" ]; then\n");
    out.push_str("  [ -e /lib/modules/%{kver} ] || ln -s \"$modver\" /lib/modules/%{kver}\n");
    out.push_str(
        "  [ -e /boot/initrd.img-\"$modver\" ] || ln -s initrd.img-%{kver} /boot/initrd.img-\"$modver\"\n",
    );
    out.push_str("fi\n");
    let _ = writeln!(out, "ln -sf linux-%{{kver}}.cfg {PHOTON_CFG}");
    out.push('\n');

    out.push_str("%postun\n");
    out.push_str("if [ \"$1\" = 0 ]; then\n");
    out.push_str("  [ -L /lib/modules/%{kver} ] && rm -f /lib/modules/%{kver}\n");
    out.push_str("  for link in /boot/initrd.img-*; do\n");
    out.push_str(
        "    [ -L \"$link\" ] && [ \"$(readlink \"$link\")\" = initrd.img-%{kver} ] && rm -f \"$link\"\n",
    );
    out.push_str("  done\n");
    let _ = writeln!(
        out,
        "  [ \"$(readlink {PHOTON_CFG})\" = linux-%{{kver}}.cfg ] && rm -f {PHOTON_CFG}"
    );
    out.push_str("fi\n");
    out.push_str("exit 0\n\n");

    out.push_str("%files -f kernel-files.list\n");
    out.push_str("%defattr(-,root,root)\n");

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cpio_member_matches, fixture_config, FakeRepo};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn kernel(name: &str, kver: &str) -> PackageDescriptor {
        PackageDescriptor {
            path: PathBuf::from(format!("/r/{name}-6.1.159-7.ph5.x86_64.rpm")),
            name: name.into(),
            version: "6.1.159".into(),
            release: "7.ph5".into(),
            architecture: "x86_64".into(),
            spec_path: None,
            matched_path: format!("/boot/vmlinuz-{kver}"),
        }
    }

    #[test]
    fn test_extraction_is_scoped_to_variant() {
        let tmp = TempDir::new().unwrap();
        let config = fixture_config(tmp.path(), &FakeRepo::new());
        let base = render(&config, &kernel("linux", "6.1.159-7.ph5"), ".ph5").unwrap();
        let esx = render(&config, &kernel("linux-esx", "6.1.159-7.ph5-esx"), ".ph5").unwrap();

        assert!(base.contains("%global kver 6.1.159-7.ph5\n"));
        assert!(esx.contains("%global kver 6.1.159-7.ph5-esx\n"));
        assert!(base.contains("'./lib/modules/%{kver}/*'"));
        assert!(!base.contains("'./boot/vmlinuz-%{kver}*'"));
        assert!(!base.contains("esx"));
        assert!(base.contains(&format!(
            "%global local_kernel {}",
            config.local_kernel_dir.join("linux-mok").display()
        )));
    }

    #[test]
    fn test_boot_parameters_and_signing() {
        let tmp = TempDir::new().unwrap();
        let config = fixture_config(tmp.path(), &FakeRepo::new());
        let text = render(&config, &kernel("linux", "6.1.159-7.ph5"), ".ph5").unwrap();

        assert!(text.contains(EXTRA_CMDLINE));
        assert!(text.contains("s/\\bquiet\\b//g"));
        assert!(text.contains("depmod -b"));
        assert!(text.contains("dracut --force"));
        assert!(text.contains("--output boot/vmlinuz-%{kver}.signed"));
        assert!(text.contains("%files -f kernel-files.list"));
        assert!(text.contains(
            "find ./lib/modules -mindepth 1 -type d | sed 's|^\\.|%dir |' | sort) >> kernel-files.list"
        ));
        assert!(text.contains("ln -sf linux-%{kver}.cfg /boot/photon.cfg"));
    }

    fn expanded(kver: &str) -> Vec<String> {
        extraction_patterns()
            .iter()
            .map(|p| p.replace("%{kver}", kver))
            .collect()
    }

    fn extracted<'a>(kver: &str, manifest: &[&'a str]) -> Vec<&'a str> {
        let patterns = expanded(kver);
        manifest
            .iter()
            .copied()
            .filter(|path| {
                let member = format!(".{path}");
                patterns.iter().any(|p| cpio_member_matches(p, &member))
            })
            .collect()
    }

    #[test]
    fn test_patterns_never_reach_sibling_variant_files() {
        let base = "6.1.159-7.ph5";
        let esx = "6.1.159-7.ph5-esx";
        let base_files = [
            "/boot/System.map-6.1.159-7.ph5",
            "/boot/config-6.1.159-7.ph5",
            "/boot/linux-6.1.159-7.ph5.cfg",
            "/boot/vmlinuz-6.1.159-7.ph5",
            "/lib/modules/6.1.159-7.ph5/modules.dep",
            "/lib/modules/6.1.159-7.ph5/kernel/drivers/usb/storage/uas.ko.xz",
        ];
        let esx_files = [
            "/boot/System.map-6.1.159-7.ph5-esx",
            "/boot/config-6.1.159-7.ph5-esx",
            "/boot/linux-6.1.159-7.ph5-esx.cfg",
            "/boot/vmlinuz-6.1.159-7.ph5-esx",
            "/lib/modules/6.1.159-7.ph5-esx/modules.dep",
            "/lib/modules/6.1.159-7.ph5-esx/kernel/fs/vfat.ko.xz",
        ];

        assert!(extracted(base, &esx_files).is_empty());
        assert!(extracted(esx, &base_files).is_empty());
        assert_eq!(extracted(base, &base_files), base_files);
        assert_eq!(extracted(esx, &esx_files), esx_files);
    }

    #[test]
    fn test_loose_patterns_would_reach_sibling_files() {
        // the same check over trailing-wildcard patterns finds the sibling
        let member = "./lib/modules/6.1.159-7.ph5-esx/modules.dep";
        assert!(cpio_member_matches("./lib/modules/6.1.159-7.ph5*", member));
        assert!(cpio_member_matches(
            "./boot/vmlinuz-6.1.159-7.ph5*",
            "./boot/vmlinuz-6.1.159-7.ph5-esx"
        ));
        assert!(!cpio_member_matches("./lib/modules/6.1.159-7.ph5/*", member));
    }

    #[test]
    fn test_unknown_kernel_release_fails() {
        let tmp = TempDir::new().unwrap();
        let config = fixture_config(tmp.path(), &FakeRepo::new());
        let mut k = kernel("linux", "x");
        k.matched_path = "/boot/vmlinuz-".into();
        assert!(render(&config, &k, ".ph5").is_err());
    }
}
