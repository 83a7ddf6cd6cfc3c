use std::path::{Path, PathBuf};

use crate::eid::Eid;

/// Flat key -> bytes file storage.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn list(&self) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    fn path(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(ident))
    }

    /// Write through a uniquely named temp file and rename it into place, so
    /// readers never observe a half-written file.
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let temp_path = self.base_dir.join(format!(".{}-{ident}.tmp", Eid::new()));

        if let Err(err) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, self.path(ident)).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path(ident))
    }

    fn list(&self) -> Vec<String> {
        std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if path.is_file() {
                            path.file_name()
                                .and_then(|name| name.to_str())
                                .filter(|name| !name.starts_with('.'))
                                .map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendLocal::new(dir.path().join("nested")).unwrap();

        assert!(!backend.exists("notes.json"));
        backend.write("notes.json", b"[]").unwrap();
        assert!(backend.exists("notes.json"));
        assert_eq!(backend.read("notes.json").unwrap(), b"[]");

        backend.write("notes.json", b"[1]").unwrap();
        assert_eq!(backend.read("notes.json").unwrap(), b"[1]");

        backend.delete("notes.json").unwrap();
        assert!(!backend.exists("notes.json"));
    }

    #[test]
    fn test_list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendLocal::new(dir.path()).unwrap();

        backend.write("a.json", b"{}").unwrap();
        backend.write("b.bin", b"").unwrap();
        std::fs::write(dir.path().join(".pending.tmp"), b"x").unwrap();

        let mut files = backend.list();
        files.sort();
        assert_eq!(files, vec!["a.json".to_string(), "b.bin".to_string()]);
    }
}
