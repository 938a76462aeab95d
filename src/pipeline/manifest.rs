//! Per-run record written to `<work_dir>/run-manifest.json`.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::synth::GeneratedSpec;
use crate::validate::ValidationResult;

pub const MANIFEST_FILE: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecRecord {
    pub file: String,
    pub kind: String,
    pub original: String,
    pub sha256: String,
}

impl SpecRecord {
    pub fn of(spec: &GeneratedSpec) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(spec.contents.as_bytes());
        Self {
            file: spec.file_name(),
            kind: spec.kind.to_string(),
            original: spec.original.clone(),
            sha256: format!("{:x}", hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub run_id: String,
    pub release: String,
    pub dist_tag: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub specs: Vec<SpecRecord>,
    pub built: Vec<String>,
    pub validation: Vec<ValidationResult>,
    pub signed: usize,
    pub integrated: Vec<String>,
    pub removed_originals: Vec<String>,
}

impl RunManifest {
    pub fn start(release: &str, dist_tag: &str) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            run_id: run_id(now),
            release: release.to_string(),
            dist_tag: dist_tag.to_string(),
            started_at: timestamp(now)?,
            finished_at: None,
            status: RunStatus::Running,
            failed_stage: None,
            error: None,
            specs: Vec::new(),
            built: Vec::new(),
            validation: Vec::new(),
            signed: 0,
            integrated: Vec::new(),
            removed_originals: Vec::new(),
        })
    }

    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.status = status;
        self.finished_at = Some(timestamp(OffsetDateTime::now_utc())?);
        Ok(())
    }

    pub fn write(&self, work_dir: &Path) -> Result<()> {
        write_json_atomic(&work_dir.join(MANIFEST_FILE), self)
    }
}

fn timestamp(at: OffsetDateTime) -> Result<String> {
    at.format(&Rfc3339).context("formatting timestamp")
}

fn run_id(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z-{}",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        std::process::id()
    )
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
