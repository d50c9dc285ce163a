use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use webcache::cache::WebCache;
use webcache::config::Config;
use webcache::disk::DiskStore;
use webcache::index::InvertedIndex;
use webcache::journal::Journal;
use webcache::logging;
use webcache::proxy::{self, Proxy};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let config = Config::from_args(env::args().skip(1))?;

    let journal = Journal::open(config.cache_root.join("journal.log")).await?;
    let disk = DiskStore::open(config.cache_root.join("diskcache"), journal).await?;
    let index = InvertedIndex::open(config.cache_root.join("mmap")).await?;
    let cache = Arc::new(WebCache::new(
        config.policy.build(),
        config.max_capacity,
        config.expiration,
    ));

    // Warm start: restore every journal-acknowledged disk object.
    let (tx, mut rx) = mpsc::channel(16);
    let reader = {
        let disk = disk.clone();
        tokio::spawn(async move { disk.read_all(tx).await })
    };
    while let Some((key, response)) = rx.recv().await {
        cache.initialize(&key, response);
    }
    reader.await.context("disk read task panicked")??;
    cache.log_capacity();

    let client = proxy::build_client()?;
    let proxy = Arc::new(Proxy::new(
        cache,
        disk,
        index,
        client,
        config.proxy_addr.to_string(),
    ));

    info!("Starting HTTP proxy server with {} policy", config.policy);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    proxy::serve(listener, proxy).await
}
