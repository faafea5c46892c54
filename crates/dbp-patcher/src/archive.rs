use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assets::AssetSource;
use crate::command::CommandSpec;
use crate::config::PatcherConfig;
use crate::error::{PatcherError, Result};
use crate::fsops::FileOps;
use crate::hashing::sha256_file;
use crate::provenance::{read_provenance, write_provenance, Provenance};
use crate::runner::{CommandListener, CommandRunner, OutputStream};

const INTERPRETER_MODE: u32 = 0o755;
const TEMP_MARKER: &str = "tmp";
const TAR_TAIL_LINES: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedInstallation {
    pub archive_file: PathBuf,
    pub install_dir: PathBuf,
    pub present: bool,
}

impl CachedInstallation {
    pub fn provenance(&self) -> Option<Provenance> {
        if !self.present {
            return None;
        }
        match read_provenance(&self.install_dir) {
            Ok(prov) => Some(prov),
            Err(err) => {
                warn!(
                    "Failed to read provenance in {}: {err}",
                    self.install_dir.display()
                );
                None
            }
        }
    }
}

pub struct ArchiveCache {
    config: PatcherConfig,
    assets: Arc<dyn AssetSource>,
    fs: Arc<dyn FileOps>,
}

impl ArchiveCache {
    pub fn new(config: PatcherConfig, assets: Arc<dyn AssetSource>, fs: Arc<dyn FileOps>) -> Self {
        Self { config, assets, fs }
    }

    pub fn installation(&self) -> CachedInstallation {
        let install_dir = self.config.install_dir();
        CachedInstallation {
            archive_file: self.config.archive_path(),
            present: install_dir.is_dir(),
            install_dir,
        }
    }

    pub async fn ensure_installed(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<CachedInstallation> {
        self.clean_scratch();
        self.clean_temp_entries();

        let installation = self.installation();
        if installation.present {
            return Ok(installation);
        }

        info!(
            "Extracting patcher {} into {}",
            self.config.version(),
            installation.install_dir.display()
        );
        if let Err(err) = self.extract(&installation, cancel).await {
            warn!("Patcher extraction failed: {err}");
            return Err(err);
        }

        let installation = self.installation();
        if !installation.present {
            return Err(PatcherError::Setup(format!(
                "{} missing after extraction",
                installation.install_dir.display()
            )));
        }
        Ok(installation)
    }

    fn clean_scratch(&self) {
        for path in list_dir(&self.config.cache_dir) {
            self.delete(&path);
        }
    }

    /// Removes `*tmp*` entries from the files root and one level inside each of its
    /// directories. Leftover staging directories sit at the top level.
    fn clean_temp_entries(&self) {
        for dir in list_dir(&self.config.files_dir) {
            if is_temp(&dir) {
                self.delete(&dir);
                continue;
            }
            if !dir.is_dir() {
                continue;
            }
            for entry in list_dir(&dir) {
                if is_temp(&entry) {
                    self.delete(&entry);
                }
            }
        }
    }

    async fn extract(
        &self,
        installation: &CachedInstallation,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<()> {
        let archive = &installation.archive_file;
        let archive_name = self.config.archive_file_name();
        self.assets
            .extract_asset(&archive_name, archive)
            .map_err(|e| PatcherError::Setup(format!("failed to extract {archive_name}: {e}")))?;

        // Only one version may live in the files root.
        for path in list_dir(&self.config.files_dir) {
            self.delete(&path);
        }

        let staging = self
            .config
            .files_dir
            .join(format!("{TEMP_MARKER}-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)
            .map_err(|e| PatcherError::Setup(format!("failed to create staging dir: {e}")))?;

        let result = self.unpack(archive, &staging, installation, cancel).await;
        if result.is_err() {
            self.delete(&staging);
            return result;
        }

        if let Err(err) = fs::remove_file(archive) {
            warn!("Failed to delete {}: {err}", archive.display());
        }
        Ok(())
    }

    async fn unpack(
        &self,
        archive: &Path,
        staging: &Path,
        installation: &CachedInstallation,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<()> {
        let spec = tar_command(&self.config.tar_binary, archive, staging)?;
        let mut tail = TailListener::default();
        let result = CommandRunner::start(&spec, &mut tail)?.join(cancel).await?;
        if !result.success() {
            return Err(PatcherError::Setup(format!(
                "tar exited with code {}: {}",
                result.exit_code,
                tail.joined()
            )));
        }

        let dir_name = self.config.version().dir_name(&self.config.dir_template);
        let extracted = staging.join(&dir_name);
        if !extracted.is_dir() {
            return Err(PatcherError::Setup(format!(
                "archive does not contain {dir_name}"
            )));
        }

        let interpreter = extracted.join(&self.config.interpreter);
        self.fs
            .chmod(&interpreter, INTERPRETER_MODE, false)
            .map_err(|e| {
                PatcherError::Setup(format!(
                    "failed to make {} executable: {e}",
                    interpreter.display()
                ))
            })?;

        let prov = self.provenance_for(archive);
        if let Err(err) = write_provenance(&extracted, &prov) {
            warn!("Failed to write provenance: {err}");
        }

        fs::rename(&extracted, &installation.install_dir)
            .map_err(|e| PatcherError::Setup(format!("failed to finalize install: {e}")))?;
        self.delete(staging);
        Ok(())
    }

    fn provenance_for(&self, archive: &Path) -> Provenance {
        let sha256 = sha256_file(archive).unwrap_or_else(|err| {
            warn!("Failed to hash {}: {err}", archive.display());
            String::new()
        });
        Provenance {
            version: self.config.version().to_string(),
            archive_name: self.config.archive_file_name(),
            sha256,
            archive_size_bytes: fs::metadata(archive).map(|m| m.len()).unwrap_or(0),
            installed_at_unix_millis: dbp_util::now_millis(),
        }
    }

    fn delete(&self, path: &Path) {
        if let Err(err) = self.fs.recursive_delete(path) {
            warn!("Failed to delete {}: {err}", path.display());
        }
    }
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().contains(TEMP_MARKER))
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => Vec::new(),
    }
}

fn tar_command(tar: &str, archive: &Path, dest: &Path) -> Result<CommandSpec> {
    let name = archive.to_string_lossy();
    let mut argv = vec![tar.to_string(), "-x".to_string()];
    if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        argv.push("-J".into());
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        argv.push("-z".into());
    } else if !name.ends_with(".tar") {
        return Err(PatcherError::Setup(format!(
            "unsupported archive format: {name} (expected .tar.xz, .tar.gz or .tar)"
        )));
    }
    argv.push("-f".into());
    argv.push(archive.to_string_lossy().into_owned());
    argv.push("-C".into());
    argv.push(dest.to_string_lossy().into_owned());

    Ok(CommandSpec {
        argv,
        env: None,
        cwd: dest.to_path_buf(),
        log_stdout: false,
    })
}

#[derive(Default)]
struct TailListener {
    recent: VecDeque<String>,
}

impl TailListener {
    fn joined(&self) -> String {
        self.recent
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl CommandListener for TailListener {
    fn on_new_output_line(&mut self, line: &str, _stream: OutputStream) {
        if self.recent.len() >= TAR_TAIL_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line.to_string());
    }
}
