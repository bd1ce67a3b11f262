use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON-file key/value store.
///
/// Keys are slash-separated paths (`tasks/<id>`,
/// `topic-events/<topic>/<id>`); values are JSON documents. Writes go
/// through a temp file plus rename so a single key is always atomic, and a
/// store-wide writer lock keeps one writer per key. Readers see consistent
/// point-in-time values.
pub struct FsStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<FsStore> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create store dir {}", root.display()))?;
        Ok(FsStore {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock().expect("store write lock");
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // '#' is outside the id alphabet, so scratch files can never
        // collide with a real key.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("empty store key")?
            .to_string();
        let tmp = path.with_file_name(format!("{file_name}#tmp"));
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("commit store key {key}"))?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read store key {key}")),
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("decode store key {key}"))?;
        Ok(Some(value))
    }

    /// Remove one key; false when it did not exist.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("store write lock");
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete store key {key}")),
        }
    }

    /// Keys directly under a prefix directory, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("list store prefix {prefix}")),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.contains('#') {
                        continue;
                    }
                    keys.push(name.to_string());
                }
            } else if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove an entire prefix subtree; cleanup for anonymous topics and
    /// deleted tasks is an O(prefix) scan.
    pub fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("store write lock");
        let dir = self.path_for(prefix);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete store prefix {prefix}")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: i64,
        s: String,
    }

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let rec = Rec {
            n: 7,
            s: "x".into(),
        };
        store.put("tasks/t1", &rec).unwrap();
        assert_eq!(store.get::<Rec>("tasks/t1").unwrap(), Some(rec));
        assert_eq!(store.get::<Rec>("tasks/missing").unwrap(), None);
    }

    #[test]
    fn overwrite_is_atomic_replace() {
        let (_dir, store) = store();
        store.put("k", &Rec { n: 1, s: "a".into() }).unwrap();
        store.put("k", &Rec { n: 2, s: "b".into() }).unwrap();
        assert_eq!(store.get::<Rec>("k").unwrap().unwrap().n, 2);
    }

    #[test]
    fn list_returns_sorted_keys() {
        let (_dir, store) = store();
        store.put("tasks/b", &1).unwrap();
        store.put("tasks/a", &2).unwrap();
        store.put("templates/x", &3).unwrap();
        assert_eq!(store.list("tasks").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn delete_prefix_removes_subtree() {
        let (_dir, store) = store();
        store.put("topic-events/main:t:alert2/a", &1).unwrap();
        store.put("topic-events/main:t:alert2/b", &2).unwrap();
        store.put("topic-events/ops/c", &3).unwrap();
        store.delete_prefix("topic-events/main:t:alert2").unwrap();
        assert!(
            store
                .get::<i32>("topic-events/main:t:alert2/a")
                .unwrap()
                .is_none()
        );
        assert_eq!(store.get::<i32>("topic-events/ops/c").unwrap(), Some(3));
    }

    #[test]
    fn delete_reports_existence() {
        let (_dir, store) = store();
        store.put("k", &1).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn keys_with_colons_are_valid() {
        let (_dir, store) = store();
        store.put("topics/main:task:alert3", &1).unwrap();
        assert_eq!(store.list("topics").unwrap(), vec!["main:task:alert3"]);
    }
}
