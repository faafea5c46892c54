use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::error::{PatcherError, Result};

const LINE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every line is delivered exactly once. Lines keep their order within a stream; stdout and
/// stderr may interleave arbitrarily.
pub trait CommandListener: Send {
    fn on_new_output_line(&mut self, line: &str, stream: OutputStream);

    fn on_command_completion(&mut self, _result: &CommandResult) {}
}

#[derive(Debug, Default)]
pub struct NullListener;

impl CommandListener for NullListener {
    fn on_new_output_line(&mut self, _line: &str, _stream: OutputStream) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandResult {
    /// Process exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug)]
struct LogLine {
    stream: OutputStream,
    line: String,
}

pub struct CommandRunner;

impl CommandRunner {
    /// Must be called from within a tokio runtime.
    pub fn start<'a>(
        spec: &CommandSpec,
        listener: &'a mut dyn CommandListener,
    ) -> Result<RunningCommand<'a>> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(PatcherError::Spawn {
                program: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        let program =
            resolve_program(program, &spec.cwd).map_err(|source| PatcherError::Spawn {
                program: PathBuf::from(program),
                source,
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = spec.env.as_ref() {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        debug!(
            "Running {} (cwd {})",
            spec.argv.join(" "),
            spec.cwd.display()
        );
        let mut child = cmd.spawn().map_err(|source| PatcherError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (line_tx, line_rx) = mpsc::channel::<LogLine>(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, OutputStream::Stderr, line_tx));
        }

        Ok(RunningCommand {
            child,
            lines: line_rx,
            listener,
            program,
            log_stdout: spec.log_stdout,
        })
    }
}

pub struct RunningCommand<'a> {
    child: Child,
    lines: mpsc::Receiver<LogLine>,
    listener: &'a mut dyn CommandListener,
    program: PathBuf,
    log_stdout: bool,
}

impl RunningCommand<'_> {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Flipping `cancel` to `true` aborts the wait with [`PatcherError::Cancelled`]; the
    /// process is killed on a best-effort basis.
    pub async fn join(mut self, cancel: Option<&watch::Receiver<bool>>) -> Result<CommandResult> {
        if cancel.is_some_and(|rx| *rx.borrow()) {
            let _ = self.child.kill().await;
            return Err(PatcherError::Cancelled);
        }
        let mut cancel_rx = cancel.cloned();
        let mut status = None;
        let mut lines_done = false;

        let status = loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => {
                    warn!("Cancellation requested; stopping {}", self.program.display());
                    let _ = self.child.kill().await;
                    return Err(PatcherError::Cancelled);
                }
                line = self.lines.recv(), if !lines_done => {
                    match line {
                        Some(line) => self.deliver(line),
                        None => lines_done = true,
                    }
                }
                result = self.child.wait(), if status.is_none() => {
                    status = Some(result);
                }
            }
            if lines_done {
                if let Some(status) = status.take() {
                    break status;
                }
            }
        };
        let status = status.map_err(|err| {
            PatcherError::io(format!("failed to wait for {}", self.program.display()), err)
        })?;

        let result = CommandResult {
            exit_code: status.code().unwrap_or(-1),
        };
        info!(
            "{} exited with code {}",
            self.program.display(),
            result.exit_code
        );
        self.listener.on_command_completion(&result);
        Ok(result)
    }

    pub async fn wait_for_command(
        self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Option<CommandResult> {
        let program = self.program.clone();
        match self.join(cancel).await {
            Ok(result) => Some(result),
            Err(err) => {
                warn!("Waiting for {} failed: {err}", program.display());
                None
            }
        }
    }

    fn deliver(&mut self, line: LogLine) {
        if line.stream == OutputStream::Stderr || self.log_stdout {
            debug!("[{}] {}", line.stream, line.line);
        }
        self.listener.on_new_output_line(&line.line, line.stream);
    }
}

/// Relative programs with a directory component live under the working directory. The result
/// is absolute because the child resolves it after changing into `cwd`.
fn resolve_program(program: &str, cwd: &Path) -> std::io::Result<PathBuf> {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        std::path::absolute(cwd.join(path))
    } else {
        Ok(path.to_path_buf())
    }
}

async fn read_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(LogLine { stream, line }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("Failed to read {stream}: {err}");
                break;
            }
        }
    }
}

async fn wait_cancelled(cancel_rx: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel_rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
