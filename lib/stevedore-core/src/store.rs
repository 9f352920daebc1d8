//! The Route Store: persists route descriptors as one
//! pretty-printed `{id}.json` file per route in a configured
//! directory, so routes configured through the Control API survive a
//! restart.

use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tokio::fs;

use crate::error::{DecodeSnafu, IoSnafu, StoreError};
use crate::route::RouteDescriptor;

/// A directory of `{id}.json` route descriptor files.
pub struct RouteStore {
    dir: PathBuf,
}

impl RouteStore {
    /// Does not create `dir`; call [`RouteStore::ensure_dir`] first if
    /// the directory may not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RouteStore { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await.context(IoSnafu {
            path: self.dir.display().to_string(),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes a route's descriptor, replacing any prior record for the
    /// same id. Writes to a temp file in the same directory and
    /// renames over the destination so a reader never observes a
    /// partially-written file.
    pub async fn put(&self, descriptor: &RouteDescriptor) -> Result<(), StoreError> {
        let id = descriptor
            .id
            .as_deref()
            .expect("route descriptor written to the store must carry an id");
        let dest = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.json.tmp"));

        let body = serde_json::to_vec_pretty(descriptor).expect("route descriptor always serializes");
        fs::write(&tmp, &body).await.context(IoSnafu {
            path: tmp.display().to_string(),
        })?;
        fs::rename(&tmp, &dest).await.context(IoSnafu {
            path: dest.display().to_string(),
        })?;
        Ok(())
    }

    /// Removes a route's on-disk record, if present. Removing a record
    /// that doesn't exist is not an error.
    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(IoSnafu {
                path: self.path_for(id).display().to_string(),
            }),
        }
    }

    /// Loads every well-formed `{id}.json` record in the store
    /// directory. A record that fails to decode is logged and skipped
    /// rather than aborting the whole load, so one corrupt file cannot
    /// take down startup.
    pub async fn load_all(&self) -> Result<Vec<RouteDescriptor>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).context(IoSnafu {
                    path: self.dir.display().to_string(),
                })
            }
        };

        let mut descriptors = Vec::new();
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.dir.display().to_string(),
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if is_tmp_file(&path) {
                continue;
            }
            match load_one(&path).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "store: skipping unreadable route record");
                }
            }
        }
        Ok(descriptors)
    }
}

fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp"))
}

async fn load_one(path: &Path) -> Result<RouteDescriptor, StoreError> {
    let body = fs::read(path).await.context(IoSnafu {
        path: path.display().to_string(),
    })?;
    serde_json::from_slice(&body).context(DecodeSnafu {
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> RouteDescriptor {
        RouteDescriptor {
            id: Some(id.to_string()),
            filter_id: None,
            filter_name: None,
            filter_sources: None,
            filter_labels: None,
            adapter: "raw".to_string(),
            address: "127.0.0.1:1234".to_string(),
            options: None,
        }
    }

    #[tokio::test]
    async fn put_then_load_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        store.put(&descriptor("aaa111222333")).await.unwrap();
        store.put(&descriptor("bbb444555666")).await.unwrap();

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.as_deref(), Some("aaa111222333"));
        assert_eq!(loaded[1].id.as_deref(), Some("bbb444555666"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        store.ensure_dir().await.unwrap();
        store.put(&descriptor("aaa111222333")).await.unwrap();
        store.remove("aaa111222333").await.unwrap();
        store.remove("aaa111222333").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_all_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        store.ensure_dir().await.unwrap();
        store.put(&descriptor("aaa111222333")).await.unwrap();
        tokio::fs::write(dir.path().join("corrupt.json"), b"not json")
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn load_all_on_missing_dir_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path().join("does-not-exist"));
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
