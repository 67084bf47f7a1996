//! Single-flight registry.
//!
//! Overlapping requests for the same scope join one in-flight future and
//! all receive its output, instead of each starting its own run. Runs are
//! spawned onto the tokio runtime, so a run keeps going after every caller
//! has stopped waiting for it. The entry is cleared when the run completes
//! or panics, so the next request after that starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

/// A shareable in-flight run. Resolves to `None` if the run panicked or
/// its task was aborted.
pub type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

struct Inner<T> {
    /// scope -> (generation, run)
    flights: Mutex<HashMap<String, (u64, Flight<T>)>>,
    next_generation: AtomicU64,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, Flight<T>)>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` only if it still holds the run started as `generation`.
    fn finish(&self, key: &str, generation: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|(g, _)| *g == generation) {
            flights.remove(key);
        }
    }
}

/// Clears a flight's entry when its task ends, including by panic.
struct FinishGuard<T> {
    inner: Arc<Inner<T>>,
    scope: String,
    generation: u64,
}

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        self.inner.finish(&self.scope, self.generation);
    }
}

/// Start-or-join registry keyed by scope.
pub struct SingleFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                flights: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the run in flight for `key`, or start one with `make`.
    ///
    /// `make` is only called when no run is in flight. A new run is spawned
    /// immediately and completes even if the returned future is dropped.
    /// Must be called from within a tokio runtime.
    pub fn run<F, Fut>(&self, key: &str, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut flights = self.inner.lock();
        if let Some((_, flight)) = flights.get(key) {
            debug!("Joining in-flight run for scope {key}");
            return flight.clone();
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = FinishGuard {
            inner: Arc::clone(&self.inner),
            scope: key.to_string(),
            generation,
        };
        let run = make();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run.await
        });
        let flight = async move {
            match handle.await {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!("In-flight run ended without a result: {e}");
                    None
                }
            }
        }
        .boxed()
        .shared();

        flights.insert(key.to_string(), (generation, flight.clone()));
        flight
    }

    /// Whether a run is in flight for `key`.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Number of scopes with a run in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
