//! Request coalescing: at most one in-flight fetch per key.
//!
//! Concurrent requests for the same cold URL would otherwise each reach the
//! origin. The first caller for a key becomes the leader and installs a
//! shared future; every caller that arrives while it is in flight awaits the
//! same future and receives a clone of the single result. The table is keyed
//! by the pre-hash URL, so identical requests merge before they ever reach
//! the cache.

use std::collections::HashMap;
use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

/// Coalesces concurrent calls per key onto one shared future.
pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    /// Runs `make()` for `key`, unless a flight for `key` is already in
    /// progress, in which case its result is shared instead.
    ///
    /// The leader removes the slot once the flight completes; callers that
    /// arrive after that start a fresh flight.
    pub async fn run<F, Fut>(&self, url_key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(url_key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let flight = make().boxed().shared();
                    inflight.insert(url_key.to_owned(), flight.clone());
                    (flight, true)
                }
            }
        };

        let result = flight.await;
        if leader {
            self.inflight.lock().remove(url_key);
        }
        result
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights = Arc::new(SingleFlight::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |flights: Arc<SingleFlight<usize>>, calls: Arc<AtomicUsize>| async move {
            flights
                .run("http://a.test/x", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    42
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(flights.clone(), calls.clone()),
            run(flights.clone(), calls.clone()),
        );
        assert_eq!((a, b), (42, 42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flights = SingleFlight::<&'static str>::new();
        let a = flights.run("http://a.test/x", || async { "a" }).await;
        let b = flights.run("http://a.test/y", || async { "b" }).await;
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn completed_flight_is_not_reused() {
        let flights = SingleFlight::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            flights
                .run("http://a.test/x", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    7
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
