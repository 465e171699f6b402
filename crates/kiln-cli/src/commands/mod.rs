pub mod build;
pub mod completions;
pub mod doctor;
pub mod parse;

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_DEFINITION_ERROR: u8 = 2;
pub const EXIT_VALIDATION_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Color a check or build status word for terminal output.
pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "pass" | "built" => Style::new().green().apply_to(status).to_string(),
        "fail" => Style::new().red().bold().apply_to(status).to_string(),
        "warn" => Style::new().yellow().apply_to(status).to_string(),
        "info" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Render a core error with the prefix `main` maps to an exit code.
pub fn core_error_message(e: &kiln_core::CoreError) -> String {
    match e {
        kiln_core::CoreError::Definition(inner) => format!("definition error: {inner}"),
        e if e.is_validation() => format!("validation error: {e}"),
        e => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_status_keeps_word() {
        for status in ["pass", "fail", "warn", "info", "built"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_DEFINITION_ERROR);
        assert_ne!(EXIT_DEFINITION_ERROR, EXIT_VALIDATION_ERROR);
    }

    #[test]
    fn core_errors_carry_exit_prefix() {
        let stage = kiln_core::CoreError::StageNotFound {
            stage: "a".to_owned(),
            referenced_by: "b".to_owned(),
        };
        assert!(core_error_message(&stage).starts_with("validation error:"));
        let def = kiln_core::CoreError::Definition(kiln_schema::DefinitionError::Empty);
        assert!(core_error_message(&def).starts_with("definition error:"));
        let other = kiln_core::CoreError::Interrupted;
        assert_eq!(core_error_message(&other), "build interrupted");
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn spinner_fail_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
