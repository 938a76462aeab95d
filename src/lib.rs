//! Derive MOK-signed boot packages from a release and publish them next to
//! the originals.
//!
//! A run takes the release's bootloader image, kernel flavors and shim loader,
//! writes a `-mok` build definition for each, builds them with `rpmbuild`,
//! checks every boot binary against the MOK certificate and regenerates the
//! repository metadata with the derived packages added.
//!
//! # Architecture
//!
//! ```text
//! preflight ── host tools, key material, work dir
//!     │
//! discovery ── package::locator (rpm -qlp / -qp) + package::templates
//!     │
//! synth ────── shim, bootloader (+ token gate), one spec per kernel flavor
//!     │
//! build ────── rpmbuild into a private topdir, copy to output/
//!     │
//! validate ─── rpm -K, rpm2cpio | cpio, sbverify
//!     │
//! sign ─────── rpmsign (optional)
//!     │
//! repo ─────── copy into RPMS/, createrepo_c, read back repodata
//! ```
//!
//! Every external command goes through [`process::Runner`], so the whole
//! pipeline runs against a scripted host in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use mok_repackager::config::{BuildConfig, RunInputs};
//! use mok_repackager::process::HostRunner;
//!
//! let config = BuildConfig::from_inputs(inputs, None)?;
//! let report = mok_repackager::run(&config, &HostRunner)?;
//! println!("{} packages built", report.built.len());
//! ```

pub mod build;
pub mod config;
pub mod discovery;
pub mod efi;
pub mod error;
pub mod package;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod repo;
pub mod sign;
pub mod synth;
pub mod validate;

#[cfg(test)]
mod testing;

pub use config::BuildConfig;
pub use error::PipelineError;
pub use pipeline::{run, PipelineReport};
