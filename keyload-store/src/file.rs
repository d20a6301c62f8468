use std::collections::HashMap;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Write as _};
use std::os::fd::AsRawFd as _;
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keyload_core::{PersistentStore, StoreError};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

/// Store backed by a single JSON object on disk.
///
/// Every call re-reads the file, so separate processes sharing the file see
/// each other's writes.  Mutations hold an exclusive `flock` on a sibling
/// `<file>.lock` for the whole read-modify-write, so writers in other
/// processes are serialised too.  Each write goes to a uniquely named
/// temporary sibling created with mode 0600 and is renamed over the
/// original, so a crash never leaves a half-written document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `apply` on the current document under the cross-process lock.
    ///
    /// `apply` returns whether it changed anything; unchanged documents are
    /// not rewritten.
    async fn update<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<String, Value>) -> bool + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || update_locked(&path, apply))
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("store update task failed: {e}")))?
    }
}

fn update_locked<F>(path: &Path, apply: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut HashMap<String, Value>) -> bool,
{
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;

    let _lock = lock_exclusive(&lock_path(path))?;

    let mut data = match std::fs::read(path) {
        Ok(content) => parse_document(path, &content)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => return Err(e.into()),
    };
    if !apply(&mut data) {
        return Ok(());
    }

    let object: serde_json::Map<String, Value> = data.into_iter().collect();
    let content = serde_json::to_vec_pretty(&Value::Object(object))?;

    let mut tmp = private_temp_file(dir, path)?;
    tmp.write_all(&content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), bytes = content.len(), "saved store");
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_os_string();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// Take an exclusive `flock` on `path`; released when the file is dropped.
fn lock_exclusive(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;

    loop {
        // SAFETY: the descriptor is owned by `file` and open for the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(file);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A fresh `.<name>.XXXXXX.tmp` next to `path`, created with mode 0600.
fn private_temp_file(dir: &Path, path: &Path) -> io::Result<NamedTempFile> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .permissions(Permissions::from_mode(0o600))
        .tempfile_in(dir)
}

fn parse_document(path: &Path, content: &[u8]) -> Result<HashMap<String, Value>, StoreError> {
    match serde_json::from_slice::<Value>(content)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(StoreError::Corrupt(format!(
            "{} holds a JSON {}, expected an object",
            path.display(),
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError> {
        self.update(move |data| {
            data.extend(entries);
            true
        })
        .await
    }

    async fn get(&self) -> Result<HashMap<String, Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(content) => parse_document(&self.path, &content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let keys = keys.to_vec();
        self.update(move |data| {
            let before = data.len();
            for key in &keys {
                data.remove(key);
            }
            data.len() != before
        })
        .await
    }
}
