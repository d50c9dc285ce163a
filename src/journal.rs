//! Append-only journal recording the lifecycle of disk objects.
//!
//! Every disk object passes through three events: `ADD` when a save begins,
//! `ADDACK` once its bytes are durable, and `DELETE` when it is removed.
//! Records are plain `ACTION KEY` text lines. A single writer task owns the
//! file handle; callers enqueue records over a channel and are acknowledged
//! only after the line has been written and flushed, so per-key event order
//! in the file matches the order intents were issued.
//!
//! On startup [`recover`] replays the journal into a `key → acked` map: an
//! object on disk is valid exactly when its last event is `ADDACK`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Journal actions, serialized as the first word of each record line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    AddAck,
    Delete,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Add => "ADD",
            Action::AddAck => "ADDACK",
            Action::Delete => "DELETE",
        }
    }
}

struct Record {
    action: Action,
    key: String,
    ack: oneshot::Sender<()>,
}

/// Handle to the journal writer task. Cheap to clone.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<Record>,
    path: PathBuf,
}

impl Journal {
    /// Opens the journal file for append (creating it if absent) and spawns
    /// the writer task. Returns once the file is open.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal {}", path.display()))?;

        let (tx, mut rx) = mpsc::channel::<Record>(32);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = format!("{} {}\n", record.action.as_str(), record.key);
                let write = async {
                    file.write_all(line.as_bytes()).await?;
                    file.flush().await
                };
                if let Err(err) = write.await {
                    warn!("journal write failed, dropping record: {err}");
                }
                let _ = record.ack.send(());
            }
        });

        Ok(Self { tx, path })
    }

    /// Records `ADD key`: a save for `key` has started.
    pub async fn add(&self, key: &str) {
        self.append(Action::Add, key).await;
    }

    /// Records `ADDACK key`: the bytes for `key` are durable.
    pub async fn add_ack(&self, key: &str) {
        self.append(Action::AddAck, key).await;
    }

    /// Records `DELETE key`: the object for `key` is being removed.
    pub async fn delete(&self, key: &str) {
        self.append(Action::Delete, key).await;
    }

    async fn append(&self, action: Action, key: &str) {
        let (ack, done) = oneshot::channel();
        let record = Record { action, key: key.to_owned(), ack };
        if self.tx.send(record).await.is_err() {
            warn!("journal writer is gone, dropping {} {key}", action.as_str());
            return;
        }
        let _ = done.await;
    }

    /// Reads the journal file and replays it into the recovered validity map.
    pub async fn recovered_state(&self) -> Result<HashMap<String, bool>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading journal {}", self.path.display()))?;
        Ok(recover(&contents))
    }
}

/// Replays journal text into a `key → acked` map.
///
/// `ADD` marks a key unacked, `ADDACK` marks it acked, `DELETE` removes it.
/// Malformed lines are skipped.
pub fn recover(contents: &str) -> HashMap<String, bool> {
    let mut entries = HashMap::new();
    for line in contents.lines() {
        let Some((action, key)) = line.split_once(' ') else {
            continue;
        };
        match action {
            "ADD" => {
                entries.insert(key.to_owned(), false);
            }
            "ADDACK" => {
                entries.insert(key.to_owned(), true);
            }
            "DELETE" => {
                entries.remove(key);
            }
            _ => {}
        }
    }
    entries
}
