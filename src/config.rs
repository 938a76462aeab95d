//! Pipeline configuration.
//!
//! A [`BuildConfig`] is assembled once per run from the entry-point inputs
//! (release directory, ISO directory, MOK key pair, flags) and an optional
//! TOML file carrying the less common knobs. It is passed by reference into
//! every stage and never mutated afterwards.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::efi::EfiArch;

/// Sub-directory of the release directory holding the distribution packages.
pub const SOURCE_PACKAGE_SUBDIR: &str = "RPMS";
/// Sub-directory of the release directory holding the build-definition templates.
pub const SOURCE_SPEC_SUBDIR: &str = "SPECS";

const DEFAULT_DIST_PREFIX: &str = "ph";
const DEFAULT_MAX_KERNEL_VARIANTS: usize = 8;
const DEFAULT_TOKEN_LABEL: &str = "MOKTOKEN";
const DEFAULT_TOKEN_PROOF_FILE: &str = "mok-token.proof";
const DEFAULT_MOK_DER_NAME: &str = "MOK.der";

/// What to do when a built package fails signature validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Log and continue to integration.
    #[default]
    Warn,
    /// Abort the run.
    Fatal,
}

/// How derived packages are placed next to the originals in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationPolicy {
    /// Keep the originals; both variants stay installable.
    #[default]
    Coexist,
    /// Remove original package files that a derived package stands in for.
    ReplaceOriginals,
}

/// Removable-volume gate embedded into the bootloader package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSettings {
    /// Filesystem label of the token volume.
    pub label: String,
    /// File that must exist at the root of the token volume.
    pub proof_file: String,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            label: DEFAULT_TOKEN_LABEL.to_string(),
            proof_file: DEFAULT_TOKEN_PROOF_FILE.to_string(),
        }
    }
}

/// Repository-level signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoSigning {
    /// GnuPG home holding the signing key.
    pub keyring: PathBuf,
    /// Key identity passed as `_gpg_name`.
    pub identity: String,
}

/// Entry-point inputs of one run.
#[derive(Debug, Clone)]
pub struct RunInputs {
    /// Release directory containing `RPMS/` and `SPECS/`; its name is the release.
    pub release_dir: PathBuf,
    /// Extracted ISO / repository root the derived packages are published into.
    pub iso_dir: PathBuf,
    pub signing_key: PathBuf,
    pub signing_cert: PathBuf,
    pub verbose: bool,
    pub require_hardware_token: bool,
    /// Defaults to `<release_dir>/mok-work`.
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub work_dir: PathBuf,
    /// Generated build definitions.
    pub spec_dir: PathBuf,
    /// rpmbuild `_topdir`.
    pub build_dir: PathBuf,
    /// Built derived packages before publication.
    pub output_dir: PathBuf,
    pub source_package_dir: PathBuf,
    pub source_spec_dir: PathBuf,
    pub signing_key: PathBuf,
    pub signing_cert: PathBuf,
    pub release: String,
    pub key_storage_dir: PathBuf,
    pub verbose: bool,
    pub require_hardware_token: bool,

    /// Architecture of the boot packages being derived.
    pub arch: EfiArch,
    /// Repository root; integration is skipped when `None`.
    pub repository_dir: Option<PathBuf>,
    pub dist_prefix: String,
    pub max_kernel_variants: usize,
    /// Release → newer kernel series tried before an unfiltered scan.
    pub kernel_series: BTreeMap<String, String>,
    pub token: TokenSettings,
    pub validation_policy: ValidationPolicy,
    pub integration_policy: IntegrationPolicy,
    pub repo_signing: Option<RepoSigning>,
    /// Certificate the vendor-signed shim binaries are checked against.
    pub shim_vendor_cert: Option<PathBuf>,
    /// Root of locally built kernels, one sub-directory per derived kernel package.
    pub local_kernel_dir: PathBuf,
    /// DER form of the MOK certificate shipped for enrollment, looked up in `key_storage_dir`.
    pub mok_der_name: String,
}

/// Optional TOML overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    release: Option<String>,
    arch: Option<String>,
    work_dir: Option<PathBuf>,
    key_storage_dir: Option<PathBuf>,
    repository_dir: Option<PathBuf>,
    dist_prefix: Option<String>,
    max_kernel_variants: Option<usize>,
    kernel_series: Option<BTreeMap<String, String>>,
    token_label: Option<String>,
    token_proof_file: Option<String>,
    validation_policy: Option<ValidationPolicy>,
    integration_policy: Option<IntegrationPolicy>,
    repo_signing: Option<RepoSigning>,
    shim_vendor_cert: Option<PathBuf>,
    local_kernel_dir: Option<PathBuf>,
    mok_der_name: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }
}

fn default_kernel_series() -> BTreeMap<String, String> {
    BTreeMap::from([("5.0".to_string(), "6.12".to_string())])
}

impl BuildConfig {
    /// Build the run configuration from entry-point inputs.
    pub fn from_inputs(inputs: RunInputs, overrides: Option<ConfigFile>) -> Result<Self> {
        let file = overrides.unwrap_or_default();

        let release = match file.release {
            Some(r) => r,
            None => inputs
                .release_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "cannot derive release from '{}'; set `release` in the config file",
                        inputs.release_dir.display()
                    )
                })?,
        };
        if release.trim().is_empty() {
            bail!("release must not be empty");
        }

        for (what, path) in [
            ("signing key", &inputs.signing_key),
            ("signing certificate", &inputs.signing_cert),
        ] {
            if !path.is_file() {
                bail!("{} not found: {}", what, path.display());
            }
        }

        let source_package_dir = inputs.release_dir.join(SOURCE_PACKAGE_SUBDIR);
        let source_spec_dir = inputs.release_dir.join(SOURCE_SPEC_SUBDIR);
        if !source_package_dir.is_dir() {
            bail!(
                "source package directory not found: {}",
                source_package_dir.display()
            );
        }

        let work_dir = file
            .work_dir
            .or(inputs.work_dir)
            .unwrap_or_else(|| inputs.release_dir.join("mok-work"));

        let key_storage_dir = match file.key_storage_dir {
            Some(dir) => dir,
            None => inputs
                .signing_key
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let max_kernel_variants = file
            .max_kernel_variants
            .unwrap_or(DEFAULT_MAX_KERNEL_VARIANTS);
        if max_kernel_variants == 0 {
            bail!("max_kernel_variants must be at least 1");
        }

        let arch = EfiArch::from_rpm_arch(file.arch.as_deref().unwrap_or(std::env::consts::ARCH))?;

        let defaults = TokenSettings::default();
        let token = TokenSettings {
            label: file.token_label.unwrap_or(defaults.label),
            proof_file: file.token_proof_file.unwrap_or(defaults.proof_file),
        };

        Ok(Self {
            spec_dir: work_dir.join("SPECS"),
            build_dir: work_dir.join("rpmbuild"),
            output_dir: work_dir.join("output"),
            local_kernel_dir: file
                .local_kernel_dir
                .unwrap_or_else(|| work_dir.join("local-kernel")),
            work_dir,
            source_package_dir,
            source_spec_dir,
            signing_key: inputs.signing_key,
            signing_cert: inputs.signing_cert,
            release,
            key_storage_dir,
            verbose: inputs.verbose,
            require_hardware_token: inputs.require_hardware_token,
            arch,
            repository_dir: Some(file.repository_dir.unwrap_or(inputs.iso_dir)),
            dist_prefix: file
                .dist_prefix
                .unwrap_or_else(|| DEFAULT_DIST_PREFIX.to_string()),
            max_kernel_variants,
            kernel_series: file.kernel_series.unwrap_or_else(default_kernel_series),
            token,
            validation_policy: file.validation_policy.unwrap_or_default(),
            integration_policy: file.integration_policy.unwrap_or_default(),
            repo_signing: file.repo_signing,
            shim_vendor_cert: file.shim_vendor_cert,
            mok_der_name: file
                .mok_der_name
                .unwrap_or_else(|| DEFAULT_MOK_DER_NAME.to_string()),
        })
    }

    /// Release-derived dist tag, e.g. `5.0` → `.ph5`.
    pub fn dist_tag(&self) -> String {
        dist_tag(&self.dist_prefix, &self.release)
    }

    /// Newer kernel series to prefer for this release, if the release has several.
    pub fn preferred_kernel_series(&self) -> Option<&str> {
        self.kernel_series.get(&self.release).map(String::as_str)
    }

    /// Exclusive lock held for the duration of a run.
    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join(".lock")
    }
}

pub fn dist_tag(prefix: &str, release: &str) -> String {
    let first = release.chars().next().map(String::from).unwrap_or_default();
    format!(".{}{}", prefix, first)
}
