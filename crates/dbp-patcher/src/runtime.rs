use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::archive::{ArchiveCache, CachedInstallation};
use crate::assets::{AssetSource, DirAssetSource};
use crate::command::{CommandSpecBuilder, InvocationRequest, PatchFileRequest, SupportCheckRequest};
use crate::config::PatcherConfig;
use crate::error::{PatcherError, Result};
use crate::fsops::{FileOps, LocalFileOps};
use crate::info::PatcherInfo;
use crate::outcome::{PatchResult, ProcessOutcome};
use crate::protocol::{FullOutputCapture, MarkerParser};
use crate::runner::{
    CommandListener, CommandResult, CommandRunner, NullListener, OutputStream, RunningCommand,
};

const SUPPORTED_TOKEN: &str = "supported";

#[derive(Default)]
struct RuntimeState {
    installation: Option<CachedInstallation>,
    info: Option<Arc<PatcherInfo>>,
}

/// Every operation, extraction included, holds the one lock for its whole duration.
pub struct PatcherRuntime {
    cache: ArchiveCache,
    commands: CommandSpecBuilder,
    state: Mutex<RuntimeState>,
}

impl PatcherRuntime {
    pub fn new(
        config: PatcherConfig,
        assets: Arc<dyn AssetSource>,
        fs: Arc<dyn FileOps>,
    ) -> Self {
        let commands = CommandSpecBuilder::new(&config);
        Self {
            cache: ArchiveCache::new(config, assets, fs),
            commands,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn with_defaults(config: PatcherConfig) -> Self {
        let assets = Arc::new(DirAssetSource::new(config.assets_dir.clone()));
        Self::new(config, assets, Arc::new(LocalFileOps))
    }

    pub async fn ensure_installed(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<CachedInstallation> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state, cancel).await
    }

    pub async fn installation(&self) -> Option<CachedInstallation> {
        self.state.lock().await.installation.clone()
    }

    /// On-disk state without taking the lock or extracting.
    pub fn probe_installation(&self) -> CachedInstallation {
        self.cache.installation()
    }

    /// A run that never reports an outcome comes back as failed with an empty message.
    pub async fn patch_file(
        &self,
        request: &PatchFileRequest,
        listener: &mut dyn CommandListener,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<PatchResult> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state, cancel).await?;

        let spec = self
            .commands
            .build(&InvocationRequest::PatchFile(request.clone()));
        let mut output = PatchOutputListener {
            parser: MarkerParser::new(),
            inner: listener,
        };
        let label = command_label("patch", &request.filename);
        let result = run(&label, CommandRunner::start(&spec, &mut output), cancel).await?;

        let outcome = ProcessOutcome::from_marker(result, output.parser.finish());
        let patched = PatchResult::new(request.new_file_name(), &outcome);
        info!(
            "Patching {} finished: failed={} message={:?}",
            request.filename, patched.failed, patched.message
        );
        Ok(patched)
    }

    pub async fn is_file_supported(
        &self,
        request: &SupportCheckRequest,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state, cancel).await?;

        let spec = self
            .commands
            .build(&InvocationRequest::CheckSupport(request.clone()));
        let mut capture = FullOutputCapture::new();
        let label = command_label("support check", &request.filename);
        let result = run(&label, CommandRunner::start(&spec, &mut capture), cancel).await?;

        let outcome = ProcessOutcome::from_capture(result, capture.into_output());
        let supported = outcome
            .raw_stdout
            .as_deref()
            .is_some_and(|out| out.starts_with(SUPPORTED_TOKEN));
        info!("{} supported: {supported}", request.filename);
        Ok(supported)
    }

    /// Patcher metadata. Queried once; later calls return the first result.
    pub async fn patcher_info(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<Arc<PatcherInfo>> {
        let mut state = self.state.lock().await;
        if let Some(info) = state.info.as_ref() {
            return Ok(Arc::clone(info));
        }
        self.ensure_locked(&mut state, cancel).await?;

        let spec = self.commands.build(&InvocationRequest::QueryMetadata);
        let mut capture = FullOutputCapture::new();
        let result = run(
            "metadata query",
            CommandRunner::start(&spec, &mut capture),
            cancel,
        )
        .await?;

        let outcome = ProcessOutcome::from_capture(result, capture.into_output());
        let payload = outcome.raw_stdout.unwrap_or_default();
        let info = PatcherInfo::from_json(&payload)
            .map(Arc::new)
            .map_err(|err| {
                warn!(
                    "Metadata query (exit code {}) returned unparsable output: {err}",
                    outcome.exit_code
                );
                PatcherError::from(err)
            })?;
        state.info = Some(Arc::clone(&info));
        Ok(info)
    }

    pub async fn update_syncdaemon(
        &self,
        boot_image: &str,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state, cancel).await?;

        let spec = self.commands.build(&InvocationRequest::UpdateDaemon {
            boot_image: boot_image.to_string(),
        });
        let mut listener = NullListener;
        let running = CommandRunner::start(&spec, &mut listener).inspect_err(|err| {
            warn!("Failed to start sync daemon update: {err}");
        })?;
        let updated = match running.wait_for_command(cancel).await {
            Some(result) => !ProcessOutcome::from_exit_code(result).failed,
            None => false,
        };
        info!("Sync daemon update for {boot_image}: success={updated}");
        Ok(updated)
    }

    async fn ensure_locked(
        &self,
        state: &mut RuntimeState,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<CachedInstallation> {
        let installation = self.cache.ensure_installed(cancel).await?;
        state.installation = Some(installation.clone());
        Ok(installation)
    }
}

struct PatchOutputListener<'a> {
    parser: MarkerParser,
    inner: &'a mut dyn CommandListener,
}

impl CommandListener for PatchOutputListener<'_> {
    fn on_new_output_line(&mut self, line: &str, stream: OutputStream) {
        if stream == OutputStream::Stderr {
            self.parser.feed(line);
        }
        self.inner.on_new_output_line(line, stream);
    }

    fn on_command_completion(&mut self, result: &CommandResult) {
        self.inner.on_command_completion(result);
    }
}

async fn run(
    label: &str,
    started: Result<RunningCommand<'_>>,
    cancel: Option<&watch::Receiver<bool>>,
) -> Result<CommandResult> {
    let outcome = match started {
        Ok(running) => running.join(cancel).await,
        Err(err) => Err(err),
    };
    outcome.inspect_err(|err| match err {
        PatcherError::Cancelled => info!("{label} cancelled"),
        _ => warn!("{label} failed: {err}"),
    })
}

fn command_label(kind: &str, filename: &str) -> String {
    format!("{kind} of {filename}")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::command::{BootImageSpec, PatchSelection, UnsupportedOptions};

    #[derive(Default)]
    struct Recorder {
        lines: Vec<(String, OutputStream)>,
        completed: bool,
    }

    impl CommandListener for Recorder {
        fn on_new_output_line(&mut self, line: &str, stream: OutputStream) {
            self.lines.push((line.to_string(), stream));
        }

        fn on_command_completion(&mut self, _result: &CommandResult) {
            self.completed = true;
        }
    }

    impl Recorder {
        fn stdout(&self) -> Vec<&str> {
            self.lines
                .iter()
                .filter(|(_, s)| *s == OutputStream::Stdout)
                .map(|(l, _)| l.as_str())
                .collect()
        }
    }

    struct Fixture {
        _temp: TempDir,
        config: PatcherConfig,
    }

    impl Fixture {
        /// A runtime whose toolchain is already "extracted" and whose interpreter is a
        /// shell script running `body`.
        fn with_interpreter(body: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let config = PatcherConfig {
                app_version: "2.0.0".into(),
                cache_dir: temp.path().join("cache"),
                files_dir: temp.path().join("files"),
                assets_dir: temp.path().join("assets"),
                ..PatcherConfig::default()
            };
            let interpreter = config.install_dir().join(&config.interpreter);
            fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
            fs::write(&interpreter, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&interpreter, fs::Permissions::from_mode(0o755)).unwrap();
            Self {
                _temp: temp,
                config,
            }
        }

        fn runtime(&self) -> PatcherRuntime {
            PatcherRuntime::with_defaults(self.config.clone())
        }

        fn interpreter(&self) -> PathBuf {
            self.config.install_dir().join(&self.config.interpreter)
        }
    }

    fn rom() -> PatchFileRequest {
        PatchFileRequest::supported("rom.zip", "hammerhead", "dual")
    }

    #[tokio::test]
    async fn patch_reports_last_marker() {
        let fx = Fixture::with_interpreter(
            r#"echo "Loading patchinfo"
echo "EXITFAIL:bad device" >&2
echo "EXITSUCCESS:ok" >&2"#,
        );
        let mut recorder = Recorder::default();

        let result = fx
            .runtime()
            .patch_file(&rom(), &mut recorder, None)
            .await
            .unwrap();

        assert_eq!(
            result,
            PatchResult {
                new_file_name: "rom_dual.zip".into(),
                message: "ok".into(),
                failed: false,
            }
        );
        assert_eq!(recorder.stdout(), vec!["Loading patchinfo"]);
        assert_eq!(recorder.lines.len(), 3);
        assert!(recorder.completed);
    }

    #[tokio::test]
    async fn patch_without_marker_fails() {
        let fx = Fixture::with_interpreter("echo working; exit 0");
        let mut recorder = Recorder::default();

        let result = fx
            .runtime()
            .patch_file(&rom(), &mut recorder, None)
            .await
            .unwrap();

        assert!(result.failed);
        assert_eq!(result.message, "");
        assert_eq!(result.new_file_name, "rom_dual.zip");
    }

    #[tokio::test]
    async fn stdout_markers_are_ignored() {
        let fx = Fixture::with_interpreter(
            r#"echo "EXITSUCCESS:fake"
echo "still working" >&2"#,
        );
        let mut recorder = Recorder::default();

        let result = fx
            .runtime()
            .patch_file(&rom(), &mut recorder, None)
            .await
            .unwrap();

        assert!(result.failed);
        assert_eq!(result.message, "");
        assert_eq!(recorder.stdout(), vec!["EXITSUCCESS:fake"]);
    }

    #[tokio::test]
    async fn patch_passes_arguments_and_explicit_env() {
        let fx = Fixture::with_interpreter(
            r#"echo "$*"
echo "tmp=$TMPDIR unbuffered=$PYTHONUNBUFFERED home=${HOME:-unset}"
echo "EXITSUCCESS:" >&2"#,
        );
        let request = PatchFileRequest {
            unsupported: Some(UnsupportedOptions {
                selection: PatchSelection::Manual {
                    autopatcher: None,
                    patch: None,
                    boot_image: BootImageSpec::NoBootImage,
                },
                device_check: false,
            }),
            ..rom()
        };
        let mut recorder = Recorder::default();

        let result = fx
            .runtime()
            .patch_file(&request, &mut recorder, None)
            .await
            .unwrap();

        assert!(!result.failed);
        let expected_env = format!(
            "tmp={} unbuffered=true home=unset",
            fx.config.cache_dir.display()
        );
        assert_eq!(
            recorder.stdout(),
            vec![
                "-B scripts/patchfile.py --noquestions rom.zip --device hammerhead \
                 --partconfig dual --unsupported --nobootimage --nodevicecheck",
                expected_env.as_str(),
            ]
        );
    }

    #[tokio::test]
    async fn patch_without_toolchain_is_setup_error() {
        let temp = TempDir::new().unwrap();
        let runtime = PatcherRuntime::with_defaults(PatcherConfig {
            cache_dir: temp.path().join("cache"),
            files_dir: temp.path().join("files"),
            assets_dir: temp.path().join("assets"),
            ..PatcherConfig::default()
        });
        let mut recorder = Recorder::default();

        let err = runtime
            .patch_file(&rom(), &mut recorder, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PatcherError::Setup(_)));
        assert!(recorder.lines.is_empty());
        assert_eq!(runtime.installation().await, None);
    }

    #[tokio::test]
    async fn cancelled_patch_has_no_result() {
        let fx = Fixture::with_interpreter("while :; do :; done");
        let (_cancel_tx, cancel_rx) = watch::channel(true);
        let mut recorder = Recorder::default();

        let err = fx
            .runtime()
            .patch_file(&rom(), &mut recorder, Some(&cancel_rx))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn support_check_reads_stdout_prefix() {
        let fx = Fixture::with_interpreter(
            r#"if [ "$3" = "--is-supported" ] && [ "$4" = "good.zip" ]; then
  echo "supported"
else
  echo "unsupported"
fi"#,
        );
        let runtime = fx.runtime();
        let request = |filename: &str| SupportCheckRequest {
            filename: filename.into(),
            device: "hammerhead".into(),
            partconfig: "dual".into(),
        };

        assert!(runtime
            .is_file_supported(&request("good.zip"), None)
            .await
            .unwrap());
        assert!(!runtime
            .is_file_supported(&request("other.zip"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn metadata_is_queried_once() {
        let fx = Fixture::with_interpreter(
            r#"echo '{"version": "2.0.0", "autopatchers": ["Standard", "Jflte"]}'"#,
        );
        let runtime = fx.runtime();

        let first = runtime.patcher_info(None).await.unwrap();
        assert_eq!(first.version, "2.0.0");
        assert_eq!(first.autopatchers, vec!["Standard", "Jflte"]);

        fs::remove_file(fx.interpreter()).unwrap();
        let second = runtime.patcher_info(None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unparsable_metadata_is_not_cached() {
        let fx = Fixture::with_interpreter("echo 'Traceback (most recent call last):'");
        let runtime = fx.runtime();

        let err = runtime.patcher_info(None).await.unwrap_err();
        assert!(matches!(err, PatcherError::Metadata(_)));
        assert!(runtime.state.lock().await.info.is_none());
    }

    #[tokio::test]
    async fn syncdaemon_update_uses_exit_code() {
        let fx = Fixture::with_interpreter(r#"[ "$3" = "ok.img" ]"#);
        let runtime = fx.runtime();

        assert!(runtime.update_syncdaemon("ok.img", None).await.unwrap());
        assert!(!runtime.update_syncdaemon("bad.img", None).await.unwrap());

        let (_cancel_tx, cancel_rx) = watch::channel(true);
        assert!(!runtime
            .update_syncdaemon("ok.img", Some(&cancel_rx))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_overlap() {
        let fx = Fixture::with_interpreter(
            r#"export PATH=/usr/bin:/bin
if [ -e busy.lock ]; then
  echo "EXITFAIL:overlap" >&2
  exit 1
fi
: > busy.lock
sleep 0.2
rm -f busy.lock
echo "EXITSUCCESS:done" >&2"#,
        );
        let runtime = Arc::new(fx.runtime());

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let runtime = Arc::clone(&runtime);
            tasks.push(tokio::spawn(async move {
                let mut listener = NullListener;
                runtime.patch_file(&rom(), &mut listener, None).await
            }));
        }

        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert!(!result.failed, "overlapping run: {}", result.message);
            assert_eq!(result.message, "done");
        }
    }
}
