// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The container datastore.
//!
//! A JSON document mapping container handle to record, shared between
//! the CNI plug-in (the writer) and the policy converger (a reader).
//! Next to the data file live two sidecars:
//!
//! * `<path>_version`: a decimal counter bumped by every write. Readers
//!   compare it against the version of their cached copy and only
//!   reload the document when it moved.
//! * `<path>_lock`: the target of the cross-process `flock`.
//!
//! Writers always take the lock, re-read, mutate, and replace both files
//! by write-temp-then-rename.

use crate::filelock::FileLock;
use crate::filelock::FileLockError;
use nix::unistd::Gid;
use nix::unistd::Group;
use nix::unistd::Uid;
use nix::unistd::User;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use thiserror::Error;
use trellis_api::ContainerRecord;
use trellis_api::Metadata;

pub type Containers = BTreeMap<String, ContainerRecord>;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("container {0} already exists")]
    Duplicate(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("{op} {path}: {source}")]
    Io { op: &'static str, path: PathBuf, source: std::io::Error },

    #[error("corrupt datastore file {path}: {msg}")]
    Corrupt { path: PathBuf, msg: String },

    #[error("datastore version regressed from {cached} to {found}")]
    VersionRegressed { cached: u64, found: u64 },

    #[error("lock: {0}")]
    Lock(#[from] FileLockError),

    #[error("datastore owner: {0}")]
    Owner(String),

    #[error("datastore task failed: {0}")]
    Task(String),
}

impl DatastoreError {
    /// Integrity failures need a human; everything else may clear up
    /// on the next attempt.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::VersionRegressed { .. })
    }
}

#[derive(Debug, Default)]
struct Cache {
    version: Option<u64>,
    data: Containers,
}

#[derive(Debug)]
pub struct Store {
    data_path: PathBuf,
    version_path: PathBuf,
    lock: FileLock,
    owner: Option<(Uid, Gid)>,
    cache: RwLock<Cache>,
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let data_path = path.into();
        Self {
            version_path: sidecar(&data_path, "_version"),
            lock: FileLock::new(sidecar(&data_path, "_lock")),
            data_path,
            owner: None,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Chown every file written to `user:group`, so unprivileged
    /// readers can follow along.
    pub fn with_owner(mut self, user: &str, group: &str) -> Result<Self, DatastoreError> {
        let uid = User::from_name(user)
            .map_err(|e| DatastoreError::Owner(format!("lookup user {user}: {e}")))?
            .ok_or_else(|| DatastoreError::Owner(format!("no such user: {user}")))?
            .uid;
        let gid = Group::from_name(group)
            .map_err(|e| DatastoreError::Owner(format!("lookup group {group}: {e}")))?
            .ok_or_else(|| DatastoreError::Owner(format!("no such group: {group}")))?
            .gid;
        self.owner = Some((uid, gid));
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    pub fn version_path(&self) -> &Path {
        &self.version_path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Record a new container.
    pub fn add(
        &self,
        handle: &str,
        ip: Ipv4Addr,
        metadata: Metadata,
    ) -> Result<(), DatastoreError> {
        self.mutate(|data| {
            if data.contains_key(handle) {
                return Err(DatastoreError::Duplicate(handle.to_string()));
            }
            let rec = ContainerRecord { handle: handle.to_string(), ip, metadata };
            data.insert(handle.to_string(), rec);
            Ok(())
        })
    }

    pub fn update(
        &self,
        handle: &str,
        ip: Ipv4Addr,
        metadata: Metadata,
    ) -> Result<(), DatastoreError> {
        self.mutate(|data| {
            let Some(rec) = data.get_mut(handle) else {
                return Err(DatastoreError::NotFound(handle.to_string()));
            };
            rec.ip = ip;
            rec.metadata = metadata;
            Ok(())
        })
    }

    /// Remove a container, returning what was recorded for it.
    pub fn delete(&self, handle: &str) -> Result<ContainerRecord, DatastoreError> {
        self.mutate(|data| {
            data.remove(handle).ok_or_else(|| DatastoreError::NotFound(handle.to_string()))
        })
    }

    /// A consistent snapshot of every container.
    pub fn read_all(&self) -> Result<Containers, DatastoreError> {
        let on_disk = self.load_version()?;
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            match cache.version {
                Some(v) if v == on_disk => return Ok(cache.data.clone()),
                Some(v) if on_disk < v => {
                    return Err(DatastoreError::VersionRegressed { cached: v, found: on_disk });
                }
                _ => {}
            }
        }

        let _guard = self.lock.lock_blocking()?;
        let version = self.load_version()?;
        let data = self.load_data()?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.version = Some(version);
        cache.data = data.clone();
        Ok(data)
    }

    /// [`Store::read_all`] off the async runtime's worker threads.
    pub async fn read_all_async(self: &Arc<Self>) -> Result<Containers, DatastoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.read_all())
            .await
            .map_err(|e| DatastoreError::Task(e.to_string()))?
    }

    /// The version currently recorded on disk. A missing sidecar means
    /// nothing was ever written.
    pub fn version(&self) -> Result<u64, DatastoreError> {
        self.load_version()
    }

    fn mutate<F, R>(&self, f: F) -> Result<R, DatastoreError>
    where
        F: FnOnce(&mut Containers) -> Result<R, DatastoreError>,
    {
        let _guard = self.lock.lock_blocking()?;
        let version = self.load_version()?;
        let mut data = self.load_data()?;
        let res = f(&mut data)?;

        let body = serde_json::to_vec(&data).map_err(|e| DatastoreError::Corrupt {
            path: self.data_path.clone(),
            msg: e.to_string(),
        })?;
        self.replace(&self.data_path, &body)?;
        let next = version + 1;
        self.replace(&self.version_path, next.to_string().as_bytes())?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.version = Some(next);
        cache.data = data;
        Ok(res)
    }

    fn load_version(&self) -> Result<u64, DatastoreError> {
        match fs::read_to_string(&self.version_path) {
            Ok(s) if s.trim().is_empty() => Ok(0),
            Ok(s) => s.trim().parse().map_err(|_| DatastoreError::Corrupt {
                path: self.version_path.clone(),
                msg: format!("bad version: {:?}", s.trim()),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(source) => Err(DatastoreError::Io {
                op: "read",
                path: self.version_path.clone(),
                source,
            }),
        }
    }

    fn load_data(&self) -> Result<Containers, DatastoreError> {
        let raw = match fs::read(&self.data_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Containers::new()),
            Err(source) => {
                return Err(DatastoreError::Io {
                    op: "read",
                    path: self.data_path.clone(),
                    source,
                });
            }
        };

        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Containers::new());
        }

        serde_json::from_slice(&raw).map_err(|e| DatastoreError::Corrupt {
            path: self.data_path.clone(),
            msg: e.to_string(),
        })
    }

    fn replace(&self, path: &Path, body: &[u8]) -> Result<(), DatastoreError> {
        let tmp = sidecar(path, ".tmp");
        let io = |op, source| DatastoreError::Io { op, path: path.to_path_buf(), source };

        let mut f = fs::File::create(&tmp).map_err(|e| io("create", e))?;
        f.write_all(body).map_err(|e| io("write", e))?;
        f.sync_all().map_err(|e| io("sync", e))?;
        drop(f);

        if let Some((uid, gid)) = self.owner {
            nix::unistd::chown(&tmp, Some(uid), Some(gid))
                .map_err(|e| io("chown", std::io::Error::from(e)))?;
        }

        fs::rename(&tmp, path).map_err(|e| io("rename", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use trellis_api::META_POLICY_GROUP_ID;

    fn meta(app: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert(META_POLICY_GROUP_ID.to_string(), app.into());
        m
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn sidecar_paths() {
        let s = Store::new("/var/vcap/data/container-metadata/store.json");
        assert_eq!(
            s.version_path(),
            Path::new("/var/vcap/data/container-metadata/store.json_version")
        );
        assert_eq!(
            s.lock_path(),
            Path::new("/var/vcap/data/container-metadata/store.json_lock")
        );
    }

    #[test]
    fn add_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::new(dir.path().join("store.json"));
        assert!(s.read_all().unwrap().is_empty());
        assert_eq!(s.version().unwrap(), 0);

        s.add("h1", ip("10.255.7.2"), meta("app-a")).unwrap();
        let err = s.add("h1", ip("10.255.7.3"), meta("app-a")).unwrap_err();
        assert!(matches!(err, DatastoreError::Duplicate(h) if h == "h1"));

        s.update("h1", ip("10.255.7.9"), meta("app-b")).unwrap();
        let all = s.read_all().unwrap();
        assert_eq!(all["h1"].ip, ip("10.255.7.9"));
        assert_eq!(all["h1"].policy_group_id(), Some("app-b"));

        let err = s.update("nope", ip("10.255.7.9"), Metadata::new()).unwrap_err();
        assert!(matches!(err, DatastoreError::NotFound(_)));

        let rec = s.delete("h1").unwrap();
        assert_eq!(rec.handle, "h1");
        assert!(matches!(s.delete("h1").unwrap_err(), DatastoreError::NotFound(_)));
        assert_eq!(s.version().unwrap(), 3);
    }

    #[test]
    fn add_then_delete_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let s = Store::new(&path);
        s.add("b-handle", ip("10.255.7.3"), meta("app-b")).unwrap();
        s.add("a-handle", ip("10.255.7.2"), meta("app-a")).unwrap();
        let before = fs::read(&path).unwrap();
        let v0 = s.version().unwrap();

        s.add("c-handle", ip("10.255.7.4"), meta("app-c")).unwrap();
        s.delete("c-handle").unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(s.version().unwrap(), v0 + 2);
    }

    #[test]
    fn reader_sees_other_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let writer = Store::new(&path);
        let reader = Store::new(&path);

        writer.add("h1", ip("10.255.7.2"), Metadata::new()).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 1);
        writer.add("h2", ip("10.255.7.3"), Metadata::new()).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 2);
    }

    #[test]
    fn cached_read_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let s = Store::new(&path);
        s.add("h1", ip("10.255.7.2"), Metadata::new()).unwrap();
        assert_eq!(s.read_all().unwrap().len(), 1);

        // Clobber the document without touching the version: the cache
        // must still answer.
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(s.read_all().unwrap().len(), 1);

        // Once the version moves the corruption is noticed.
        fs::write(s.version_path(), b"7").unwrap();
        let err = s.read_all().unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn version_regression_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::new(dir.path().join("store.json"));
        s.add("h1", ip("10.255.7.2"), Metadata::new()).unwrap();
        s.add("h2", ip("10.255.7.3"), Metadata::new()).unwrap();
        fs::write(s.version_path(), b"1").unwrap();
        let err = s.read_all().unwrap_err();
        assert!(matches!(err, DatastoreError::VersionRegressed { cached: 2, found: 1 }));
    }

    #[test]
    fn document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let s = Store::new(&path);
        s.add("h1", ip("10.255.7.2"), meta("app-a")).unwrap();
        let v: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "h1": {
                    "handle": "h1",
                    "ip": "10.255.7.2",
                    "metadata": {"policy_group_id": "app-a"},
                }
            })
        );
    }

    #[tokio::test]
    async fn async_read() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(Store::new(dir.path().join("store.json")));
        s.add("h1", ip("10.255.7.2"), Metadata::new()).unwrap();
        assert_eq!(s.read_all_async().await.unwrap().len(), 1);
    }
}
