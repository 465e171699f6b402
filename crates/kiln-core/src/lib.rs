//! Build orchestration for Kiln.
//!
//! This crate ties the definition parser, bundles, and runtime together into
//! `Build`: one `Stage` per definition, run strictly in order, with SCI-F
//! apps materialized into each stage, cross-stage `%files from` copies,
//! metadata insertion, and the final assembler. It also provides the stage
//! state machine, the scoped umask/signal guards, and `BuildConfig`.

pub mod apps;
pub mod build;
pub mod concurrency;
pub mod config;
pub mod lifecycle;
pub mod metadata;
pub mod stage;

pub use apps::{App, Apps};
pub use build::{Build, BuildRequest, BuildSummary};
pub use concurrency::{install_signal_handler, shutdown_requested, BuildLock, UmaskGuard};
pub use config::BuildConfig;
pub use lifecycle::{validate_transition, StageState};
pub use metadata::{insert_metadata, merge_labels};
pub use stage::Stage;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("definition error: {0}")]
    Definition(#[from] kiln_schema::DefinitionError),
    #[error("bundle error: {0}")]
    Bundle(#[from] kiln_bundle::BundleError),
    #[error("runtime error: {0}")]
    Runtime(#[from] kiln_runtime::RuntimeError),
    #[error("invalid build: {0}")]
    Validation(String),
    #[error("stage '{referenced_by}' copies files from unknown stage '{stage}'")]
    StageNotFound { stage: String, referenced_by: String },
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("build interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors raised before any stage touched the filesystem.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::StageNotFound { .. }
                | Self::Bundle(kiln_bundle::BundleError::InvalidSections(_))
                | Self::Runtime(
                    kiln_runtime::RuntimeError::CacheRequired(_)
                        | kiln_runtime::RuntimeError::NoExecMount(_)
                        | kiln_runtime::RuntimeError::UnknownBootstrap(_)
                        | kiln_runtime::RuntimeError::EncryptionUnsupported(_)
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_not_found_names_both_stages() {
        let e = CoreError::StageNotFound {
            stage: "devel".to_owned(),
            referenced_by: "final".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("'devel'"));
        assert!(msg.contains("'final'"));
        assert!(e.is_validation());
    }

    #[test]
    fn script_failure_is_not_validation() {
        let e = CoreError::Runtime(kiln_runtime::RuntimeError::ScriptFailed {
            section: "post".to_owned(),
            code: Some(1),
        });
        assert!(!e.is_validation());
    }
}
