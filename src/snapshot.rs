//! Snapshot store (component B): atomic load/save of per-(TaskID, CommandID)
//! JSON blobs, with path-traversal protection and per-path serialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("path traversal attempt in task id {task_id:?} / command id {command_id:?}")]
    PathTraversal { task_id: String, command_id: String },

    #[error("failed to encode snapshot as JSON: {0}")]
    JsonEncode(#[source] serde_json::Error),

    #[error("failed to decode snapshot JSON: {0}")]
    JsonDecode(#[source] serde_json::Error),

    #[error("snapshot I/O error: {0}")]
    Io(#[source] std::io::Error),
}

type SnapshotResult<T> = Result<T, SnapshotError>;

/// Per-file mutual exclusion so concurrent Load/Save on the same key
/// serialize while different keys proceed in parallel.
#[derive(Default)]
struct PathLocks {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("path lock map poisoned");
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct SnapshotStore {
    base_dir: PathBuf,
    app_name: String,
    locks: PathLocks,
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && !id.contains("..") && !id.contains('/') && !id.contains('\\')
}

/// Flatten a CamelCase/PascalCase/already-snake identifier to kebab-case,
/// matching the `<app>-task-<snake(TaskID)>-<snake(CommandID)>.json` layout.
fn kebab(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 4);
    for (i, c) in id.chars().enumerate() {
        if c.is_uppercase() {
            if i != 0 {
                out.push('-');
            }
            out.extend(c.to_lowercase());
        } else if c == '_' || c == ' ' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

impl SnapshotStore {
    /// Creates the base directory if missing and sweeps any leftover temp
    /// files from a previous, interrupted run (best effort).
    pub async fn new(base_dir: impl Into<PathBuf>, app_name: impl Into<String>) -> SnapshotResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(SnapshotError::Io)?;

        let store = Self {
            base_dir,
            app_name: app_name.into(),
            locks: PathLocks::default(),
        };
        store.sweep_temp_files().await;
        Ok(store)
    }

    async fn sweep_temp_files(&self) {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to scan snapshot dir for leftover temp files");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("task-result-") && name.ends_with(".tmp") {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(file = %name, error = %e, "failed to remove leftover temp file");
                }
            }
        }
    }

    fn resolve_path(&self, task_id: &str, command_id: &str) -> SnapshotResult<PathBuf> {
        if !is_safe_id(task_id) || !is_safe_id(command_id) {
            return Err(SnapshotError::PathTraversal {
                task_id: task_id.to_string(),
                command_id: command_id.to_string(),
            });
        }

        let filename = format!(
            "{}-task-{}-{}.json",
            self.app_name,
            kebab(task_id),
            kebab(command_id)
        );
        let joined = self.base_dir.join(&filename);

        // Defense in depth: even though the IDs above are scrubbed, confirm
        // the joined path still lives under base_dir.
        if !joined.starts_with(&self.base_dir) {
            return Err(SnapshotError::PathTraversal {
                task_id: task_id.to_string(),
                command_id: command_id.to_string(),
            });
        }

        Ok(joined)
    }

    /// Deserializes JSON into `T`. If the file does not exist, returns
    /// `Ok(None)` and the caller keeps whatever its `NewSnapshot()` factory
    /// produced.
    pub async fn load<T: DeserializeOwned>(
        &self,
        task_id: &str,
        command_id: &str,
    ) -> SnapshotResult<Option<T>> {
        let path = self.resolve_path(task_id, command_id)?;
        let guard = self.locks.lock_for(&path);
        let _permit = guard.lock().await;

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(SnapshotError::JsonDecode)?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::Io(e)),
        }
    }

    /// Atomically writes `value` as JSON under the path derived from the IDs:
    /// write to a sibling temp file, fsync, remove any existing target,
    /// rename temp -> target.
    pub async fn save<T: Serialize + Sync>(
        &self,
        task_id: &str,
        command_id: &str,
        value: &T,
    ) -> SnapshotResult<()> {
        let path = self.resolve_path(task_id, command_id)?;
        let guard = self.locks.lock_for(&path);
        let _permit = guard.lock().await;

        let bytes = serde_json::to_vec_pretty(value).map_err(SnapshotError::JsonEncode)?;

        let tmp_name = format!("task-result-{}.tmp", InstanceIdLike::random_suffix());
        let tmp_path = self.base_dir.join(tmp_name);

        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(SnapshotError::Io)?;
            use tokio::io::AsyncWriteExt;
            file.write_all(&bytes).await.map_err(SnapshotError::Io)?;
            file.sync_all().await.map_err(SnapshotError::Io)?;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SnapshotError::Io(e)),
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(SnapshotError::Io)?;

        Ok(())
    }
}

/// Small local helper so `SnapshotStore` doesn't need a dependency on the
/// `id` module's process-wide counter just to name temp files uniquely.
struct InstanceIdLike;
impl InstanceIdLike {
    fn random_suffix() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        format!("{pid:x}-{nanos:x}")
    }
}
