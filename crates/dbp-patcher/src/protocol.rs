//! Output conventions of the patcher scripts.
//!
//! `patchfile.py` reports its outcome on stderr with a line containing `EXITFAIL:<msg>` or
//! `EXITSUCCESS:<msg>`. Other commands print a plain result on stdout, which is captured whole.

use crate::runner::{CommandListener, OutputStream};

pub const FAIL_MARKER: &str = "EXITFAIL:";
pub const SUCCESS_MARKER: &str = "EXITSUCCESS:";

/// The last marker line seen wins.
#[derive(Debug, Default)]
pub struct MarkerParser {
    last: Option<(String, bool)>,
}

impl MarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<(String, bool)> {
        let parsed = if line.contains(FAIL_MARKER) {
            Some((line.replace(FAIL_MARKER, ""), true))
        } else if line.contains(SUCCESS_MARKER) {
            Some((line.replace(SUCCESS_MARKER, ""), false))
        } else {
            None
        };
        if let Some(status) = parsed.as_ref() {
            self.last = Some(status.clone());
        }
        parsed
    }

    pub fn status(&self) -> Option<(&str, bool)> {
        self.last
            .as_ref()
            .map(|(message, failed)| (message.as_str(), *failed))
    }

    pub fn finish(self) -> (String, bool) {
        self.last.unwrap_or_else(|| (String::new(), true))
    }
}

#[derive(Debug, Default)]
pub struct FullOutputCapture {
    output: String,
}

impl FullOutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }
}

impl CommandListener for FullOutputCapture {
    fn on_new_output_line(&mut self, line: &str, stream: OutputStream) {
        if stream == OutputStream::Stdout {
            self.output.push_str(line);
            self.output.push('\n');
        }
    }
}
