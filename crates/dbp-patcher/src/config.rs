use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::version::{ToolchainVersion, DEFAULT_ARCHIVE_TEMPLATE, DEFAULT_DIR_TEMPLATE};

const CONFIG_FILE: &str = "patcher-config.json";

pub const APP_VERSION_ENV: &str = "DBP_APP_VERSION";
pub const CACHE_DIR_ENV: &str = "DBP_CACHE_DIR";
pub const FILES_DIR_ENV: &str = "DBP_FILES_DIR";
pub const ASSETS_DIR_ENV: &str = "DBP_ASSETS_DIR";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    pub app_version: String,
    /// Scratch directory. Cleared completely before every extraction check.
    pub cache_dir: PathBuf,
    pub files_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub archive_template: String,
    pub dir_template: String,
    /// Interpreter path relative to the installation directory.
    pub interpreter: String,
    pub no_bytecode_flag: String,
    pub patch_script: String,
    pub metadata_script: String,
    pub daemon_update_script: String,
    pub tar_binary: String,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        let data_dir = dbp_util::data_dir();
        Self {
            app_version: env_or(APP_VERSION_ENV, env!("CARGO_PKG_VERSION")),
            cache_dir: env_path_or(CACHE_DIR_ENV, data_dir.join("cache")),
            files_dir: env_path_or(FILES_DIR_ENV, data_dir.join("files")),
            assets_dir: env_path_or(ASSETS_DIR_ENV, data_dir.join("assets")),
            archive_template: DEFAULT_ARCHIVE_TEMPLATE.into(),
            dir_template: DEFAULT_DIR_TEMPLATE.into(),
            interpreter: "pythonportable/bin/python3".into(),
            no_bytecode_flag: "-B".into(),
            patch_script: "scripts/patchfile.py".into(),
            metadata_script: "scripts/jsondump.py".into(),
            daemon_update_script: "scripts/updatesyncdaemon.py".into(),
            tar_binary: "tar".into(),
        }
    }
}

impl PatcherConfig {
    /// Environment variables win over values from the file.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let mut cfg = PatcherConfig::default();
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PatcherConfig>(&data) {
                Ok(file_cfg) => cfg.merge_file(file_cfg),
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
            }
        }
        cfg
    }

    pub fn save(&self) -> io::Result<()> {
        dbp_util::write_json_atomic(&config_path(), self)
    }

    pub fn version(&self) -> ToolchainVersion {
        ToolchainVersion::from_app_version(&self.app_version)
    }

    pub fn archive_file_name(&self) -> String {
        self.version().archive_file_name(&self.archive_template)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.cache_dir.join(self.archive_file_name())
    }

    pub fn install_dir(&self) -> PathBuf {
        self.files_dir.join(self.version().dir_name(&self.dir_template))
    }

    fn merge_file(&mut self, file_cfg: PatcherConfig) {
        if std::env::var(APP_VERSION_ENV).is_err() && !file_cfg.app_version.is_empty() {
            self.app_version = file_cfg.app_version;
        }
        if std::env::var(CACHE_DIR_ENV).is_err() && !file_cfg.cache_dir.as_os_str().is_empty() {
            self.cache_dir = file_cfg.cache_dir;
        }
        if std::env::var(FILES_DIR_ENV).is_err() && !file_cfg.files_dir.as_os_str().is_empty() {
            self.files_dir = file_cfg.files_dir;
        }
        if std::env::var(ASSETS_DIR_ENV).is_err() && !file_cfg.assets_dir.as_os_str().is_empty()
        {
            self.assets_dir = file_cfg.assets_dir;
        }
        merge_string(&mut self.archive_template, file_cfg.archive_template);
        merge_string(&mut self.dir_template, file_cfg.dir_template);
        merge_string(&mut self.interpreter, file_cfg.interpreter);
        merge_string(&mut self.no_bytecode_flag, file_cfg.no_bytecode_flag);
        merge_string(&mut self.patch_script, file_cfg.patch_script);
        merge_string(&mut self.metadata_script, file_cfg.metadata_script);
        merge_string(&mut self.daemon_update_script, file_cfg.daemon_update_script);
        merge_string(&mut self.tar_binary, file_cfg.tar_binary);
    }
}

fn config_path() -> PathBuf {
    dbp_util::state_file_path(CONFIG_FILE)
}

fn merge_string(target: &mut String, value: String) {
    if !value.trim().is_empty() {
        *target = value;
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path_or(key: &str, default: PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => dbp_util::expand_user(&value),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_values_fill_unset_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"{ "archive_template": "Toolchain-{version}.tar.gz", "tar_binary": "" }"#,
        )
        .unwrap();

        let cfg = PatcherConfig::load_from(&path);
        assert_eq!(cfg.archive_template, "Toolchain-{version}.tar.gz");
        assert_eq!(cfg.tar_binary, "tar");
        assert_eq!(cfg.interpreter, "pythonportable/bin/python3");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        let cfg = PatcherConfig::load_from(&path);
        assert_eq!(cfg.archive_template, DEFAULT_ARCHIVE_TEMPLATE);
    }

    #[test]
    fn paths_are_versioned() {
        let cfg = PatcherConfig {
            app_version: "8.0.0-beta3".into(),
            cache_dir: PathBuf::from("/data/cache"),
            files_dir: PathBuf::from("/data/files"),
            ..PatcherConfig::default()
        };
        assert_eq!(
            cfg.archive_path(),
            PathBuf::from("/data/cache/DualBootPatcherAndroid-8.0.0.tar.xz")
        );
        assert_eq!(
            cfg.install_dir(),
            PathBuf::from("/data/files/DualBootPatcherAndroid-8.0.0")
        );
    }
}
