//! Proxy configuration files on disk.
//!
//! Files live in the `available` directory and are enabled by a symlink of
//! the same name in the `enabled` directory. Writes go through a temp file
//! plus rename so the proxy never reads a half-written file. Every write made
//! since the last validated reload is remembered with the content it replaced,
//! so a failed validation can put the previous configuration back.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use vitrine_reconcile::ConfigDigest;

use super::RoutingError;

/// Name of the platform file.
pub const PLATFORM_FILE: &str = "platform.conf";

/// File name for a tenant's domain file.
pub fn tenant_file(base_id: &str) -> String {
    format!("{base_id}.conf")
}

/// What a write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Content changed. `previous` is the replaced content, if any.
    Written { previous: Option<String> },
    /// Content and enablement already matched.
    Unchanged,
}

impl FileChange {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Writes made since the last validated reload: file name to replaced content.
pub type Staged = BTreeMap<String, Option<String>>;

/// Managed proxy configuration directories.
pub struct ConfigFiles {
    available_dir: PathBuf,
    enabled_dir: PathBuf,
    write_lock: AsyncMutex<()>,
    staged: Mutex<Staged>,
}

impl ConfigFiles {
    pub fn new(available_dir: impl Into<PathBuf>, enabled_dir: impl Into<PathBuf>) -> Self {
        Self {
            available_dir: available_dir.into(),
            enabled_dir: enabled_dir.into(),
            write_lock: AsyncMutex::new(()),
            staged: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn available_dir(&self) -> &Path {
        &self.available_dir
    }

    pub fn enabled_dir(&self) -> &Path {
        &self.enabled_dir
    }

    fn staged(&self) -> MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write and enable `name`. No-op when content and link already match.
    pub async fn write(&self, name: &str, content: &str) -> Result<FileChange, RoutingError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.read_file(name).await?;
        let unchanged = previous
            .as_deref()
            .is_some_and(|p| ConfigDigest::of(p.as_bytes()) == ConfigDigest::of(content.as_bytes()));
        if unchanged && self.is_enabled(name).await {
            debug!(file = name, "Config unchanged");
            return Ok(FileChange::Unchanged);
        }

        self.write_and_link(name, content).await?;
        self.staged()
            .entry(name.to_string())
            .or_insert_with(|| previous.clone());

        info!(file = name, "Wrote proxy config");
        Ok(FileChange::Written { previous })
    }

    /// Disable and delete `name`. Returns false when nothing existed.
    pub async fn remove(&self, name: &str) -> Result<bool, RoutingError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.unlink_and_delete(name).await?;
        self.staged().remove(name);
        if removed {
            info!(file = name, "Removed proxy config");
        }
        Ok(removed)
    }

    /// Current content of `name` in the available directory.
    pub async fn read(&self, name: &str) -> Result<Option<String>, RoutingError> {
        self.read_file(name).await
    }

    /// Entry names in the available directory.
    pub async fn list_available(&self) -> Result<Vec<String>, RoutingError> {
        list_dir(&self.available_dir).await
    }

    /// Entry names in the enabled directory.
    pub async fn list_enabled(&self) -> Result<Vec<String>, RoutingError> {
        list_dir(&self.enabled_dir).await
    }

    /// Take the writes staged since the last call.
    pub fn take_staged(&self) -> Staged {
        std::mem::take(&mut *self.staged())
    }

    /// Whether any write is waiting for a reload.
    pub fn has_staged(&self) -> bool {
        !self.staged().is_empty()
    }

    /// Put writes back into the staged set (the reload could not run).
    pub fn restage(&self, staged: Staged) {
        let mut current = self.staged();
        for (name, previous) in staged {
            // An older snapshot of the same file is the one to keep.
            current.insert(name, previous);
        }
    }

    /// Restore staged files to their previous content; files that did not
    /// exist before are removed.
    pub async fn rollback(&self, staged: Staged) -> Result<(), RoutingError> {
        let _guard = self.write_lock.lock().await;
        for (name, previous) in staged {
            match previous {
                Some(content) => {
                    self.write_and_link(&name, &content).await?;
                    warn!(file = %name, "Rolled back proxy config to previous content");
                }
                None => {
                    self.unlink_and_delete(&name).await?;
                    warn!(file = %name, "Rolled back new proxy config");
                }
            }
        }
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Option<String>, RoutingError> {
        let path = self.available_dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RoutingError::Io { path, source }),
        }
    }

    async fn is_enabled(&self, name: &str) -> bool {
        let link = self.enabled_dir.join(name);
        match tokio::fs::read_link(&link).await {
            Ok(target) => target == self.available_dir.join(name),
            Err(_) => false,
        }
    }

    async fn write_and_link(&self, name: &str, content: &str) -> Result<(), RoutingError> {
        for dir in [&self.available_dir, &self.enabled_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| RoutingError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        let path = self.available_dir.join(name);
        let tmp_path = self.available_dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|source| RoutingError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| RoutingError::Io {
                path: path.clone(),
                source,
            })?;

        // Replace any stale link before pointing it at the new file.
        let link = self.enabled_dir.join(name);
        remove_if_exists(&link).await?;
        tokio::fs::symlink(&path, &link)
            .await
            .map_err(|source| RoutingError::Io { path: link, source })
    }

    async fn unlink_and_delete(&self, name: &str) -> Result<bool, RoutingError> {
        let unlinked = remove_if_exists(&self.enabled_dir.join(name)).await?;
        let deleted = remove_if_exists(&self.available_dir.join(name)).await?;
        Ok(unlinked || deleted)
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, RoutingError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(RoutingError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<String>, RoutingError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RoutingError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| RoutingError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(root: &Path) -> ConfigFiles {
        ConfigFiles::new(root.join("available"), root.join("enabled"))
    }

    #[tokio::test]
    async fn test_write_creates_file_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());

        let change = files.write("1a2b3c4d.conf", "upstream a {}\n").await.unwrap();
        assert_eq!(change, FileChange::Written { previous: None });

        let link = dir.path().join("enabled/1a2b3c4d.conf");
        assert_eq!(
            tokio::fs::read_link(&link).await.unwrap(),
            dir.path().join("available/1a2b3c4d.conf")
        );
        assert_eq!(tokio::fs::read_to_string(&link).await.unwrap(), "upstream a {}\n");
    }

    #[tokio::test]
    async fn test_same_content_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());

        files.write(PLATFORM_FILE, "a").await.unwrap();
        assert_eq!(files.write(PLATFORM_FILE, "a").await.unwrap(), FileChange::Unchanged);
        assert_eq!(
            files.write(PLATFORM_FILE, "b").await.unwrap(),
            FileChange::Written {
                previous: Some("a".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_missing_link_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());

        files.write(PLATFORM_FILE, "a").await.unwrap();
        tokio::fs::remove_file(dir.path().join("enabled").join(PLATFORM_FILE))
            .await
            .unwrap();

        assert!(files.write(PLATFORM_FILE, "a").await.unwrap().changed());
        assert_eq!(files.list_enabled().await.unwrap(), vec![PLATFORM_FILE]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());

        assert!(!files.remove("gone.conf").await.unwrap());
        files.write("gone.conf", "x").await.unwrap();
        assert!(files.remove("gone.conf").await.unwrap());
        assert!(files.list_available().await.unwrap().is_empty());
        assert!(files.list_enabled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_and_removes_new() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());

        files.write(PLATFORM_FILE, "good").await.unwrap();
        files.take_staged();

        files.write(PLATFORM_FILE, "bad").await.unwrap();
        files.write(PLATFORM_FILE, "worse").await.unwrap();
        files.write("new.conf", "bad").await.unwrap();

        let staged = files.take_staged();
        assert_eq!(staged.get(PLATFORM_FILE), Some(&Some("good".to_string())));
        assert_eq!(staged.get("new.conf"), Some(&None));

        files.rollback(staged).await.unwrap();
        assert_eq!(files.read(PLATFORM_FILE).await.unwrap().as_deref(), Some("good"));
        assert!(files.read("new.conf").await.unwrap().is_none());
        assert_eq!(files.list_enabled().await.unwrap(), vec![PLATFORM_FILE]);
        assert!(files.take_staged().is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(files(dir.path()).list_available().await.unwrap().is_empty());
    }
}
