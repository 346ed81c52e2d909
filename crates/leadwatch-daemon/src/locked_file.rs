use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// An open file holding an advisory lock until dropped.
pub struct LockedFile {
    pub file: File,
}

impl LockedFile {
    pub fn exclusive(path: &Path, options: &OpenOptions) -> io::Result<Self> {
        let file = open_with_parent(path, options)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    pub fn shared(path: &Path, options: &OpenOptions) -> io::Result<Self> {
        let file = open_with_parent(path, options)?;
        file.lock_shared()?;
        Ok(Self { file })
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_with_parent(path: &Path, options: &OpenOptions) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    options.open(path)
}
