//! The proxy surface: accept loop, GET pipeline, and passthrough.
//!
//! GET requests flow through the cache: proxied paths are resolved back to
//! their origin URL through the inverted index, the memory cache is
//! consulted, and misses fetch the origin under a single-flight guard. HTML
//! responses are rewritten and their resources prefetched before the
//! response is returned. Any other method is forwarded verbatim to its
//! target and never cached.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::{Lookup, WebCache};
use crate::disk::DiskStore;
use crate::entry::CachedResponse;
use crate::index::{InvertedIndex, Mapping};
use crate::key;
use crate::rewrite;
use crate::singleflight::SingleFlight;

type Response = hyper::Response<Full<Bytes>>;

/// The shared result of one origin fetch, cloned out to coalesced waiters.
#[derive(Clone)]
struct Fetched {
    body: Bytes,
    content_type: String,
}

type FetchResult = std::result::Result<Fetched, Arc<anyhow::Error>>;

/// Shared proxy state wired into every connection task.
pub struct Proxy {
    cache: Arc<WebCache>,
    disk: DiskStore,
    index: InvertedIndex,
    client: reqwest::Client,
    proxy_addr: String,
    proxied_prefix: String,
    flights: SingleFlight<FetchResult>,
}

/// Builds the outbound client: 10 s connect timeout, 90 s idle pool.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .build()
        .context("building outbound http client")
}

impl Proxy {
    pub fn new(
        cache: Arc<WebCache>,
        disk: DiskStore,
        index: InvertedIndex,
        client: reqwest::Client,
        proxy_addr: String,
    ) -> Self {
        let proxied_prefix = format!("http://{proxy_addr}/");
        Self {
            cache,
            disk,
            index,
            client,
            proxy_addr,
            proxied_prefix,
            flights: SingleFlight::new(),
        }
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response {
        if req.method() == Method::GET {
            self.handle_get(req).await
        } else {
            self.forward(req).await
        }
    }

    async fn handle_get(self: Arc<Self>, req: Request<Incoming>) -> Response {
        let raw = req.uri().to_string();
        let raw = self.strip_proxied_prefix(&raw).to_owned();
        info!("GET Request - {raw}");

        // A proxied path carries a hashed key; recover the origin URL.
        let url = match self.index.get(&raw).await {
            Some(origin) => {
                info!("Proxied GET for {raw} resolved to {origin}");
                origin
            }
            None => raw,
        };

        match self.cache.get(&url) {
            Lookup::Hit(entry) => {
                info!("HIT - {url}");
                ok_response(&entry.content_type, entry.body)
            }
            Lookup::Miss | Lookup::Expired => {
                info!("Requesting {url} from origin");
                let fetched = {
                    let this = self.clone();
                    let target = url.clone();
                    self.flights
                        .run(&url, move || async move {
                            this.fetch_and_cache(target).await.map_err(Arc::new)
                        })
                        .await
                };
                match fetched {
                    Ok(fetched) => ok_response(&fetched.content_type, fetched.body),
                    Err(err) => {
                        warn!("origin fetch failed for {url}: {err:#}");
                        service_unavailable(&format!("{err}"))
                    }
                }
            }
        }
    }

    /// Fetches `url` from the origin, rewriting HTML and running the
    /// admission sequence before the result is returned.
    async fn fetch_and_cache(self: Arc<Self>, url: String) -> Result<Fetched> {
        let response = self.client.get(&url).send().await.context("requesting origin")?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let body = if content_type.starts_with("text/html") {
            let raw = response.bytes().await.context("reading origin body")?;
            self.clone().rewrite_and_prefetch(&raw).await?
        } else {
            response.bytes().await.context("reading origin body")?
        };

        self.index
            .put(Mapping { original: url.clone(), hashed: key::hash(&url) })
            .await;
        self.admit(&url, body.clone(), content_type.clone()).await;
        Ok(Fetched { body, content_type })
    }

    /// Rewrites an HTML body and waits for every scheduled prefetch before
    /// returning the rewritten bytes.
    async fn rewrite_and_prefetch(self: Arc<Self>, raw: &[u8]) -> Result<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(self.clone().prefetch_all(rx));
        let rewritten = rewrite::rewrite_html(raw, &self.proxy_addr, tx)?;
        drain.await.context("prefetch drain panicked")?;
        Ok(Bytes::from(rewritten))
    }

    /// Fans out one prefetch task per resource URL and waits for all of them.
    async fn prefetch_all(self: Arc<Self>, mut resources: mpsc::UnboundedReceiver<String>) {
        let mut tasks = JoinSet::new();
        while let Some(resource) = resources.recv().await {
            let this = self.clone();
            tasks.spawn(async move { this.prefetch(resource).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Prefetches one rewritten resource through the standard admission
    /// sequence so it is cached before the browser asks for it.
    async fn prefetch(self: Arc<Self>, resource: String) {
        self.index
            .put(Mapping { original: resource.clone(), hashed: key::hash(&resource) })
            .await;
        if let Lookup::Hit(_) = self.cache.get(&resource) {
            return;
        }
        info!("Requesting resource {resource} from origin");
        // No coalescing here: a resource pointing back at the page being
        // rewritten would wait on the very flight that is waiting on us.
        if let Err(err) = self.clone().fetch_resource(resource.clone()).await {
            warn!("prefetch failed for {resource}: {err:#}");
        }
    }

    /// Fetches a non-HTML resource and admits it. No rewriting.
    async fn fetch_resource(self: Arc<Self>, url: String) -> Result<Fetched> {
        let response = self.client.get(&url).send().await.context("requesting origin")?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response.bytes().await.context("reading origin body")?;
        self.admit(&url, body.clone(), content_type.clone()).await;
        Ok(Fetched { body, content_type })
    }

    /// The admission sequence: plan, commit evictions disk-first, then save
    /// and install the new entry.
    async fn admit(&self, url: &str, body: Bytes, content_type: String) {
        let length = body.len() as u64;
        let (to_delete, should_cache) = self.cache.find_eviction_entries(url, length);

        for hashed in &to_delete {
            self.disk.delete(hashed).await;
            self.cache.delete(hashed);
        }

        if !should_cache {
            return;
        }

        let response = CachedResponse {
            body,
            content_type,
            expires_at: SystemTime::now() + self.cache.expiration(),
        };
        match self.disk.save(&key::hash(url), response.clone()).await {
            Ok(()) => self.cache.set(url, response),
            Err(err) => {
                warn!("Error saving {url} to disk: {err:#}");
                self.cache.release_pending(length);
            }
        }
    }

    /// Forwards a non-GET request to its target, copying status and headers
    /// back verbatim. Nothing is cached.
    async fn forward(self: Arc<Self>, req: Request<Incoming>) -> Response {
        match self.proxy_request(req).await {
            Ok(response) => response,
            Err(err) => {
                warn!("passthrough failed: {err:#}");
                service_unavailable(&format!("{err}"))
            }
        }
    }

    async fn proxy_request(&self, req: Request<Incoming>) -> Result<Response> {
        let (parts, body) = req.into_parts();
        let bytes = body.collect().await.context("reading request body")?.to_bytes();

        let upstream = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(bytes.to_vec())
            .send()
            .await
            .context("forwarding request")?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await.context("reading upstream body")?;

        let mut response = hyper::Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Strips the rewritten-URL prefix from an inbound request target:
    /// `http://<proxy-addr>/<rest>` and `/<rest>` both yield `<rest>`.
    fn strip_proxied_prefix<'a>(&self, raw: &'a str) -> &'a str {
        if let Some(rest) = raw.strip_prefix(&self.proxied_prefix) {
            rest
        } else if let Some(rest) = raw.strip_prefix('/') {
            rest
        } else {
            raw
        }
    }
}

fn ok_response(content_type: &str, body: Bytes) -> Response {
    let mut response = hyper::Response::new(Full::new(body));
    if !content_type.is_empty() {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    response
}

fn service_unavailable(message: &str) -> Response {
    let mut response = hyper::Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

/// Accept loop: one spawned task per connection, HTTP/1.1 with keep-alive.
pub async fn serve(listener: TcpListener, proxy: Arc<Proxy>) -> Result<()> {
    info!("Serving listening on {}", listener.local_addr()?);
    loop {
        let (stream, _addr) = listener.accept().await.context("accepting connection")?;
        let io = TokioIo::new(stream);
        let proxy = proxy.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.handle(req).await) }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            if let Err(err) = http.serve_connection(io, svc).await {
                warn!("error serving connection: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::journal::Journal;
    use crate::policy::PolicyKind;

    async fn proxy_at(dir: &Path) -> Arc<Proxy> {
        let journal = Journal::open(dir.join("journal.log")).await.unwrap();
        let disk = DiskStore::open(dir.join("diskcache"), journal).await.unwrap();
        let index = InvertedIndex::open(dir.join("mmap")).await.unwrap();
        let cache = Arc::new(WebCache::new(
            PolicyKind::Lru.build(),
            1_000_000,
            Duration::from_secs(60),
        ));
        Arc::new(Proxy::new(
            cache,
            disk,
            index,
            build_client().unwrap(),
            "127.0.0.1:9000".to_owned(),
        ))
    }

    #[tokio::test]
    async fn strip_proxied_prefix_variants() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_at(dir.path()).await;
        assert_eq!(proxy.strip_proxied_prefix("http://127.0.0.1:9000/abc"), "abc");
        assert_eq!(proxy.strip_proxied_prefix("/abc"), "abc");
        assert_eq!(proxy.strip_proxied_prefix("http://a.test/x"), "http://a.test/x");
    }

    #[tokio::test]
    async fn admission_pipeline_persists_entry() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_at(dir.path()).await;

        proxy
            .admit("http://a.test/x", Bytes::from_static(b"payload"), "text/plain".into())
            .await;

        assert!(matches!(proxy.cache.get("http://a.test/x"), Lookup::Hit(_)));
        let hashed = key::hash("http://a.test/x");
        assert!(dir.path().join("diskcache").join(&hashed).exists());
        let journal = tokio::fs::read_to_string(dir.path().join("journal.log"))
            .await
            .unwrap();
        assert!(journal.contains(&format!("ADDACK {hashed}")));
    }

    #[tokio::test]
    async fn oversize_admission_serves_but_does_not_cache() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.log")).await.unwrap();
        let disk = DiskStore::open(dir.path().join("diskcache"), journal).await.unwrap();
        let index = InvertedIndex::open(dir.path().join("mmap")).await.unwrap();
        let cache = Arc::new(WebCache::new(PolicyKind::Lru.build(), 4, Duration::from_secs(60)));
        let proxy = Arc::new(Proxy::new(
            cache,
            disk,
            index,
            build_client().unwrap(),
            "127.0.0.1:9000".to_owned(),
        ));

        proxy
            .admit("http://a.test/big", Bytes::from_static(b"too large"), "text/plain".into())
            .await;

        assert!(matches!(proxy.cache.get("http://a.test/big"), Lookup::Miss));
        let mut dir_iter = tokio::fs::read_dir(dir.path().join("diskcache")).await.unwrap();
        assert!(dir_iter.next_entry().await.unwrap().is_none());
    }

    #[test]
    fn ok_response_sets_content_type() {
        let response = ok_response("text/html", Bytes::from_static(b"<html>"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
    }

    #[test]
    fn ok_response_skips_empty_content_type() {
        let response = ok_response("", Bytes::new());
        assert!(!response.headers().contains_key(CONTENT_TYPE));
    }
}
