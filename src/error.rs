//! Pipeline failure taxonomy.
//!
//! Stage internals work with `anyhow` and attach context as they go. At each
//! stage boundary the chain is flattened into one [`PipelineError`] variant, so
//! the tool output captured deep inside a helper still reaches the operator.

use std::fmt;
use thiserror::Error;

/// Pipeline stage, used to tag errors and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    Discovery,
    Synthesis,
    Build,
    Validation,
    Signing,
    Integration,
}

impl Stage {
    pub fn tag(self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Discovery => "discovery",
            Stage::Synthesis => "synthesis",
            Stage::Build => "build",
            Stage::Validation => "validation",
            Stage::Signing => "signing",
            Stage::Integration => "integration",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Host tools missing or the workspace cannot be claimed.
    #[error("[preflight] {message}")]
    PreflightFailed { message: String },

    /// A required package was not found, or the package tool could not be queried.
    #[error("[discovery] {message}")]
    DiscoveryFailed { message: String },

    #[error("[synthesis] cannot generate '{spec}': {message}")]
    SpecGenerationFailed { spec: String, message: String },

    #[error("[build] rpmbuild failed for '{spec}' (exit {}):\n{output_tail}", display_code(.code))]
    BuildFailed {
        spec: String,
        code: Option<i32>,
        output_tail: String,
    },

    /// The builder was never started, or its products could not be collected.
    #[error("[build] cannot build '{spec}', rpmbuild did not run to completion: {message}")]
    BuildSetupFailed { spec: String, message: String },

    #[error("[signing] '{package}': {message}")]
    SignFailed { package: String, message: String },

    #[error("[validation] {failed} package(s) failed signature validation; first: {first}")]
    ValidationFailed { failed: usize, first: String },

    #[error("[integration] {message}")]
    IntegrationFailed { message: String },
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::PreflightFailed { .. } => Stage::Preflight,
            PipelineError::DiscoveryFailed { .. } => Stage::Discovery,
            PipelineError::SpecGenerationFailed { .. } => Stage::Synthesis,
            PipelineError::BuildFailed { .. } | PipelineError::BuildSetupFailed { .. } => {
                Stage::Build
            }
            PipelineError::SignFailed { .. } => Stage::Signing,
            PipelineError::ValidationFailed { .. } => Stage::Validation,
            PipelineError::IntegrationFailed { .. } => Stage::Integration,
        }
    }

    /// Process exit status for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self.stage() {
            Stage::Preflight => 10,
            Stage::Discovery => 11,
            Stage::Synthesis => 12,
            Stage::Build => 13,
            Stage::Signing => 14,
            Stage::Validation => 15,
            Stage::Integration => 16,
        }
    }

    pub(crate) fn preflight(err: anyhow::Error) -> Self {
        PipelineError::PreflightFailed {
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn discovery(err: anyhow::Error) -> Self {
        PipelineError::DiscoveryFailed {
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn spec(spec: &str, err: anyhow::Error) -> Self {
        PipelineError::SpecGenerationFailed {
            spec: spec.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn build_setup(spec: &str, err: anyhow::Error) -> Self {
        PipelineError::BuildSetupFailed {
            spec: spec.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn sign(package: &str, err: anyhow::Error) -> Self {
        PipelineError::SignFailed {
            package: package.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn integration(err: anyhow::Error) -> Self {
        PipelineError::IntegrationFailed {
            message: format!("{err:#}"),
        }
    }
}
