//! Durable disk tier: a single-writer byte store keyed by hash.
//!
//! The store owns one directory and one worker task. Saves and deletes are
//! enqueued as intents carrying a completion channel and are executed
//! strictly in order by the worker, which also drives the journal:
//!
//! - save: encode → journal `ADD` → write + fsync → journal `ADDACK`
//! - delete: journal `DELETE` → remove file (missing file is success)
//!
//! `ADDACK` is only ever written after the object's bytes are durable, so a
//! crash mid-save leaves a file recovery will recognize as invalid and purge.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::entry::{self, CachedResponse};
use crate::journal::Journal;

struct SaveRequest {
    key: String,
    response: CachedResponse,
    done: oneshot::Sender<Result<()>>,
}

struct DeleteRequest {
    key: String,
    done: oneshot::Sender<()>,
}

/// Handle to the disk store worker. Cheap to clone.
#[derive(Clone)]
pub struct DiskStore {
    save_tx: mpsc::Sender<SaveRequest>,
    delete_tx: mpsc::Sender<DeleteRequest>,
    root: PathBuf,
    journal: Journal,
}

impl DiskStore {
    /// Creates the store root if absent and spawns the worker task.
    pub async fn open(root: impl AsRef<Path>, journal: Journal) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating disk cache root {}", root.display()))?;

        let (save_tx, mut save_rx) = mpsc::channel::<SaveRequest>(32);
        let (delete_tx, mut delete_rx) = mpsc::channel::<DeleteRequest>(32);

        let worker_root = root.clone();
        let worker_journal = journal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(req) = save_rx.recv() => {
                        run_save(&worker_root, &worker_journal, req).await;
                    }
                    Some(req) = delete_rx.recv() => {
                        run_delete(&worker_root, &worker_journal, req).await;
                    }
                    else => break,
                }
            }
        });

        Ok(Self { save_tx, delete_tx, root, journal })
    }

    /// Persists `response` under `key`, completing once the bytes are durable
    /// and the `ADDACK` has been journaled.
    pub async fn save(&self, key: &str, response: CachedResponse) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let request = SaveRequest { key: key.to_owned(), response, done };
        self.save_tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("disk worker is gone"))?;
        rx.await.context("disk worker dropped save intent")?
    }

    /// Removes the object for `key`. Completes once the `DELETE` record and
    /// the file removal are done; a missing file counts as success.
    pub async fn delete(&self, key: &str) {
        let (done, rx) = oneshot::channel();
        let request = DeleteRequest { key: key.to_owned(), done };
        if self.delete_tx.send(request).await.is_err() {
            warn!("disk worker is gone, dropping delete for {key}");
            return;
        }
        let _ = rx.await;
    }

    /// Startup drain: enumerates the store, purges files the journal does not
    /// acknowledge, and emits every valid entry on `out`.
    pub async fn read_all(&self, out: mpsc::Sender<(String, CachedResponse)>) -> Result<()> {
        let valid = self.journal.recovered_state().await?;
        let mut dir = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading disk cache root {}", self.root.display()))?;

        while let Some(file) = dir.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            if !valid.get(&name).copied().unwrap_or(false) {
                debug!("purging unacknowledged file {name}");
                if let Err(err) = fs::remove_file(file.path()).await {
                    warn!("failed to purge {name}: {err}");
                }
                continue;
            }
            let bytes = fs::read(file.path()).await?;
            match entry::decode(&bytes) {
                Ok(response) => {
                    debug!("restored entry {name}");
                    if out.send((name, response)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("purging undecodable file {name}: {err}");
                    if let Err(err) = fs::remove_file(file.path()).await {
                        warn!("failed to purge {name}: {err}");
                    }
                }
            }
        }
        Ok(())
    }
}

async fn run_save(root: &Path, journal: &Journal, request: SaveRequest) {
    let SaveRequest { key, response, done } = request;
    let result = write_object(root, journal, &key, &response).await;
    match &result {
        Ok(()) => {
            journal.add_ack(&key).await;
            debug!("saved entry to disk, key {key}");
        }
        Err(err) => warn!("disk save failed for {key}: {err}"),
    }
    let _ = done.send(result);
}

async fn write_object(
    root: &Path,
    journal: &Journal,
    key: &str,
    response: &CachedResponse,
) -> Result<()> {
    let blob = entry::encode(response)?;
    journal.add(key).await;
    let path = root.join(key);
    let mut file = File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(&blob).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

async fn run_delete(root: &Path, journal: &Journal, request: DeleteRequest) {
    journal.delete(&request.key).await;
    debug!("deleting entry from disk, key {}", request.key);
    match fs::remove_file(root.join(&request.key)).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("disk delete failed for {}: {err}", request.key),
    }
    let _ = request.done.send(());
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;

    use super::*;
    use crate::key;

    fn response(body: &'static [u8]) -> CachedResponse {
        CachedResponse {
            body: Bytes::from_static(body),
            content_type: "text/plain".to_string(),
            expires_at: SystemTime::now() + Duration::from_secs(60),
        }
    }

    async fn open_store(dir: &Path) -> DiskStore {
        let journal = Journal::open(dir.join("journal.log")).await.unwrap();
        DiskStore::open(dir.join("diskcache"), journal).await.unwrap()
    }

    async fn drain(store: &DiskStore) -> Vec<(String, CachedResponse)> {
        let (tx, mut rx) = mpsc::channel(16);
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.read_all(tx).await })
        };
        let mut entries = Vec::new();
        while let Some(entry) = rx.recv().await {
            entries.push(entry);
        }
        reader.await.unwrap().unwrap();
        entries
    }

    #[tokio::test]
    async fn save_is_restored_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let hashed = key::hash("a.test/x");

        store.save(&hashed, response(b"payload")).await.unwrap();

        let entries = drain(&store).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, hashed);
        assert_eq!(entries[0].1.body, Bytes::from_static(b"payload"));

        let journal = tokio::fs::read_to_string(dir.path().join("journal.log"))
            .await
            .unwrap();
        assert_eq!(journal, format!("ADD {hashed}\nADDACK {hashed}\n"));
    }

    #[tokio::test]
    async fn file_without_ack_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let hashed = key::hash("a.test/x");

        // Simulate a crash between ADD and ADDACK: the file landed but the
        // acknowledgement never did.
        tokio::fs::write(dir.path().join("journal.log"), format!("ADD {hashed}\n"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("diskcache")).await.unwrap();
        let orphan = dir.path().join("diskcache").join(&hashed);
        tokio::fs::write(&orphan, entry::encode(&response(b"x")).unwrap())
            .await
            .unwrap();

        let store = open_store(dir.path()).await;
        assert!(drain(&store).await.is_empty());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn deleted_entry_does_not_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let hashed = key::hash("a.test/x");

        store.save(&hashed, response(b"payload")).await.unwrap();
        store.delete(&hashed).await;

        assert!(drain(&store).await.is_empty());
        assert!(!dir.path().join("diskcache").join(&hashed).exists());
    }

    #[tokio::test]
    async fn delete_of_missing_key_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.delete("no-such-key").await;
        store.delete("no-such-key").await;
    }
}
