use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

pub const DATA_DIR_ENV: &str = "DBP_DATA_DIR";

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return expand_user(&dir);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/dbp")
    } else {
        PathBuf::from("/tmp/dbp")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn write_json_atomic_creates_parents_and_leaves_no_tmp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/sample.json");
        let value = Sample {
            name: "hammerhead".into(),
            count: 3,
        };

        write_json_atomic(&path, &value).unwrap();

        let parsed: Sample = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, value);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn expand_user_leaves_plain_paths_alone() {
        assert_eq!(expand_user("/opt/dbp"), PathBuf::from("/opt/dbp"));
        assert_eq!(expand_user("relative/dir"), PathBuf::from("relative/dir"));
    }
}
