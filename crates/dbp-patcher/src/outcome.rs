use serde::Serialize;

use crate::runner::CommandResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub message: String,
    /// Set by the marker protocol or the exit code. Capture commands leave it `true`; their
    /// result is read from `raw_stdout`.
    pub failed: bool,
    pub raw_stdout: Option<String>,
}

impl ProcessOutcome {
    pub fn from_marker(result: CommandResult, (message, failed): (String, bool)) -> Self {
        Self {
            exit_code: result.exit_code,
            message,
            failed,
            raw_stdout: None,
        }
    }

    pub fn from_exit_code(result: CommandResult) -> Self {
        Self {
            exit_code: result.exit_code,
            message: String::new(),
            failed: !result.success(),
            raw_stdout: None,
        }
    }

    pub fn from_capture(result: CommandResult, stdout: String) -> Self {
        Self {
            exit_code: result.exit_code,
            message: String::new(),
            failed: true,
            raw_stdout: Some(stdout),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PatchResult {
    pub new_file_name: String,
    pub message: String,
    pub failed: bool,
}

impl PatchResult {
    pub fn new(new_file_name: String, outcome: &ProcessOutcome) -> Self {
        Self {
            new_file_name,
            message: outcome.message.clone(),
            failed: outcome.failed,
        }
    }
}
