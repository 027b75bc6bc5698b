use std::fs;
use std::io::Read;
use std::path::{Component, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Result, ZbackError};
use crate::storage::{Backend, ObjectInfo};

/// `file://` destination backed by `std::fs`.
///
/// Uploads write to a dotted temp name and rename into place, so a replayed
/// upload of the same key is idempotent and a crash never leaves a
/// half-written object under its final name.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root = PathBuf::from(root);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: fs::canonicalize(&root)?,
        })
    }

    /// Reject keys that could escape the destination root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ZbackError::InvalidInput("unsafe object key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(ZbackError::InvalidInput(format!(
                "unsafe object key: '{key}'"
            )));
        }
        for component in std::path::Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(ZbackError::InvalidInput(format!(
                    "unsafe object key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &std::path::Path, out: &mut Vec<ObjectInfo>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                let meta = entry.metadata()?;
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    // Skip in-progress uploads.
                    if key.rsplit('/').next().is_some_and(|n| n.starts_with('.')) {
                        continue;
                    }
                    out.push(ObjectInfo {
                        key,
                        size: meta.len(),
                        modified: DateTime::<Utc>::from(meta.modified()?),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        _len: u64,
        _content_md5: Option<&[u8; 16]>,
    ) -> Result<()> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ZbackError::InvalidInput(format!("unsafe object key: '{key}'")))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| ZbackError::InvalidInput(format!("unsafe object key: '{key}'")))?;
        let tmp = parent.join(format!(".{}.part", file_name.to_string_lossy()));

        let mut file = fs::File::create(&tmp)?;
        if let Err(e) = std::io::copy(reader, &mut file).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn download(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ZbackError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // A prefix may name a directory or a partial object name; walk the
        // deepest existing directory and filter.
        let mut out = Vec::new();
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        let walk_root = if dir.is_dir() {
            dir
        } else {
            match dir.parent() {
                Some(parent) if parent.starts_with(&self.root) && parent.is_dir() => {
                    parent.to_path_buf()
                }
                _ => return Ok(out),
            }
        };
        self.list_recursive(&walk_root, &mut out)?;
        out.retain(|o| o.key.starts_with(prefix));
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.resolve(key)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn max_parallel_uploads(&self) -> usize {
        2
    }
}

#[cfg(test)]
impl LocalBackend {
    fn put_for_test(&self, key: &str, data: &[u8]) {
        let mut cursor = std::io::Cursor::new(data);
        self.upload(key, &mut cursor, data.len() as u64, None).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("a/../../etc").is_err());
        assert!(LocalBackend::validate_key("a\\b").is_err());
        assert!(LocalBackend::validate_key("").is_err());
        assert!(LocalBackend::validate_key("tank/data|a|b|0.gz").is_ok());
    }

    #[test]
    fn upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put_for_test("prefix/obj", b"hello volume");

        let mut read_back = Vec::new();
        backend
            .download("prefix/obj")
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, b"hello volume");
    }

    #[test]
    fn download_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        let err = match backend.download("nope") {
            Err(err) => err,
            Ok(_) => panic!("expected download of missing key to fail"),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn upload_is_idempotent_for_replayed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put_for_test("obj", b"first attempt");
        backend.put_for_test("obj", b"second attempt");

        let mut read_back = Vec::new();
        backend
            .download("obj")
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, b"second attempt");
    }

    #[test]
    fn list_filters_by_prefix_and_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put_for_test("tank/data|a|b|0.gz", b"v0");
        backend.put_for_test("tank/data|a|b|1.gz", b"v1");
        backend.put_for_test("tank/other|a|b|0.gz", b"x");
        std::fs::write(dir.path().join("tank").join(".stray.part"), b"junk").unwrap();

        let listed = backend.list("tank/data").unwrap();
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["tank/data|a|b|0.gz", "tank/data|a|b|1.gz"]);
        assert_eq!(listed[0].size, 2);
    }

    #[test]
    fn delete_tolerates_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put_for_test("obj", b"data");
        backend
            .delete(&["obj".to_string(), "missing".to_string()])
            .unwrap();
        assert!(backend.list("").unwrap().is_empty());
    }
}
