use std::{
    fs, io,
    path::{Path, PathBuf},
};

use uuid::Uuid;

pub trait AssetSource: Send + Sync {
    fn extract_asset(&self, name: &str, dest: &Path) -> io::Result<()>;
}

#[derive(Clone, Debug)]
pub struct DirAssetSource {
    root: PathBuf,
}

impl DirAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirAssetSource {
    fn extract_asset(&self, name: &str, dest: &Path) -> io::Result<()> {
        let src = self.root.join(name);
        if !src.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("asset not found: {}", src.display()),
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::copy(&src, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, dest)
    }
}
