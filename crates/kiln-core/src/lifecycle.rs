use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of one stage through the build sequence.
///
/// States are totally ordered; a stage only ever moves forward. Phases that
/// are disabled by the section filter still advance past their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    Created,
    Fetched,
    Packed,
    AppsMaterialized,
    FilesFromStages,
    SetupRun,
    FilesFromHost,
    PostRun,
    MetadataInserted,
    Tested,
    Assembled,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Created => "created",
            StageState::Fetched => "fetched",
            StageState::Packed => "packed",
            StageState::AppsMaterialized => "apps-materialized",
            StageState::FilesFromStages => "files-copied-from-other-stages",
            StageState::SetupRun => "setup-run",
            StageState::FilesFromHost => "files-copied-from-host",
            StageState::PostRun => "post-run",
            StageState::MetadataInserted => "metadata-inserted",
            StageState::Tested => "tested",
            StageState::Assembled => "assembled",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: StageState, to: StageState) -> Result<(), CoreError> {
    if to > from {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(StageState::Created, StageState::Fetched).is_ok());
        assert!(validate_transition(StageState::Fetched, StageState::Packed).is_ok());
        assert!(validate_transition(StageState::PostRun, StageState::MetadataInserted).is_ok());
        // skipping forward over disabled phases
        assert!(validate_transition(StageState::Packed, StageState::PostRun).is_ok());
        assert!(validate_transition(StageState::Tested, StageState::Assembled).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(StageState::Fetched, StageState::Created).is_err());
        assert!(validate_transition(StageState::PostRun, StageState::SetupRun).is_err());
        assert!(validate_transition(StageState::Packed, StageState::Packed).is_err());
        assert!(validate_transition(StageState::Assembled, StageState::Created).is_err());
    }

    #[test]
    fn display_names_match_sequence() {
        assert_eq!(StageState::FilesFromStages.to_string(), "files-copied-from-other-stages");
        assert_eq!(StageState::Assembled.to_string(), "assembled");
    }
}
