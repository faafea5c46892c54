use std::{fs, io, path::Path};

/// `attempt_root` is a hint; implementations without a privileged context ignore it.
pub trait FileOps: Send + Sync {
    fn recursive_delete(&self, path: &Path) -> io::Result<()>;
    fn chmod(&self, path: &Path, mode: u32, attempt_root: bool) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileOps;

impl FileOps for LocalFileOps {
    fn recursive_delete(&self, path: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    #[cfg(unix)]
    fn chmod(&self, path: &Path, mode: u32, _attempt_root: bool) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn chmod(&self, _path: &Path, _mode: u32, _attempt_root: bool) -> io::Result<()> {
        Ok(())
    }
}
