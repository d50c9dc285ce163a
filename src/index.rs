//! Inverted index mapping hashed keys back to origin URLs.
//!
//! Rewritten HTML references resources as `http://<proxy>/<hash>`; when such
//! a request arrives the proxy needs the original URL to fetch upstream.
//! This index is that reverse mapping. It is owned by a single task,
//! initialized from an append-only text file (`hashed original` per line),
//! and is monotone: once a hashed key is recorded its origin never changes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::key;

/// A `hashed → original` pair recorded by the index.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub original: String,
    pub hashed: String,
}

struct Put {
    mapping: Mapping,
    ack: oneshot::Sender<()>,
}

struct Lookup {
    hashed: String,
    reply: oneshot::Sender<Option<String>>,
}

/// Handle to the index owner task. Cheap to clone.
#[derive(Clone)]
pub struct InvertedIndex {
    put_tx: mpsc::Sender<Put>,
    get_tx: mpsc::Sender<Lookup>,
}

impl InvertedIndex {
    /// Loads the mapping file (creating it if absent) and spawns the owner
    /// task. Returns once the existing mappings are in memory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    if let Some((hashed, original)) = line.split_once(' ') {
                        entries.insert(hashed.to_owned(), original.to_owned());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading index {}", path.display()));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening index {}", path.display()))?;

        let (put_tx, mut put_rx) = mpsc::channel::<Put>(32);
        let (get_tx, mut get_rx) = mpsc::channel::<Lookup>(32);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(put) = put_rx.recv() => {
                        let Put { mapping, ack } = put;
                        if !entries.contains_key(&mapping.hashed) {
                            let line = format!("{} {}\n", mapping.hashed, mapping.original);
                            let write = async {
                                file.write_all(line.as_bytes()).await?;
                                file.flush().await
                            };
                            if let Err(err) = write.await {
                                warn!("index append failed for {}: {err}", mapping.hashed);
                            }
                            entries.insert(mapping.hashed, mapping.original);
                        }
                        let _ = ack.send(());
                    }
                    Some(lookup) = get_rx.recv() => {
                        let _ = lookup.reply.send(entries.get(&lookup.hashed).cloned());
                    }
                    else => break,
                }
            }
        });

        Ok(Self { put_tx, get_tx })
    }

    /// Records a mapping, returning once the owner has applied it. Ignored
    /// if the hashed key is already present.
    pub async fn put(&self, mapping: Mapping) {
        let (ack, done) = oneshot::channel();
        if self.put_tx.send(Put { mapping, ack }).await.is_err() {
            warn!("index owner is gone, dropping mapping");
            return;
        }
        let _ = done.await;
    }

    /// Looks up the origin URL for a hashed key. A leading `http://` on the
    /// argument is stripped before lookup.
    pub async fn get(&self, hashed: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let lookup = Lookup { hashed: key::strip_http(hashed).to_owned(), reply };
        self.get_tx.send(lookup).await.ok()?;
        rx.await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let index = InvertedIndex::open(dir.path().join("mmap")).await.unwrap();

        let hashed = key::hash("a.test/i.png");
        index
            .put(Mapping { original: "http://a.test/i.png".into(), hashed: hashed.clone() })
            .await;

        assert_eq!(index.get(&hashed).await.as_deref(), Some("http://a.test/i.png"));
        assert_eq!(index.get("unknown").await, None);
    }

    #[tokio::test]
    async fn first_mapping_wins() {
        let dir = tempfile::tempdir().unwrap();
        let index = InvertedIndex::open(dir.path().join("mmap")).await.unwrap();

        let hashed = key::hash("a.test/i.png");
        index
            .put(Mapping { original: "http://a.test/i.png".into(), hashed: hashed.clone() })
            .await;
        index
            .put(Mapping { original: "http://evil.test/other".into(), hashed: hashed.clone() })
            .await;

        assert_eq!(index.get(&hashed).await.as_deref(), Some("http://a.test/i.png"));
    }

    #[tokio::test]
    async fn get_strips_scheme_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let index = InvertedIndex::open(dir.path().join("mmap")).await.unwrap();

        index
            .put(Mapping { original: "http://a.test/x".into(), hashed: "abc123".into() })
            .await;

        assert_eq!(index.get("http://abc123").await.as_deref(), Some("http://a.test/x"));
    }

    #[tokio::test]
    async fn mappings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mmap");
        let hashed = key::hash("a.test/i.png");
        {
            let index = InvertedIndex::open(&path).await.unwrap();
            index
                .put(Mapping { original: "http://a.test/i.png".into(), hashed: hashed.clone() })
                .await;
        }
        let index = InvertedIndex::open(&path).await.unwrap();
        assert_eq!(index.get(&hashed).await.as_deref(), Some("http://a.test/i.png"));
    }
}
