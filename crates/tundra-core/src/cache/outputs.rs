//! Process-wide-per-run dependency output cache.
//!
//! Keyed by the dependency's canonical directory. The first caller for a key
//! transitions the entry to computing and runs the fetch; every concurrent
//! caller parks on the same cell, so the engine's `output -json` is invoked at
//! most once per dependency per run. The runner publishes outputs directly
//! after a successful apply, which wins over any later fetch.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

/// Resolution of one dependency's outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Outputs {
    Ready(JsonValue),
    /// No state yet (never applied) or unparseable engine output. The caller
    /// decides whether mocks substitute.
    Unavailable,
}

impl Outputs {
    pub fn ready(self) -> Option<JsonValue> {
        match self {
            Outputs::Ready(v) => Some(v),
            Outputs::Unavailable => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputsCache {
    entries: Mutex<HashMap<PathBuf, Arc<OnceCell<Outputs>>>>,
}

impl OutputsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, unit: &Path) -> Arc<OnceCell<Outputs>> {
        self.entries
            .lock()
            .expect("outputs cache lock")
            .entry(unit.to_path_buf())
            .or_default()
            .clone()
    }

    /// Record outputs produced by this run's own engine invocation. A no-op
    /// when an earlier fetch already resolved the entry.
    pub fn publish(&self, unit: &Path, outputs: Outputs) {
        let _ = self.entry(unit).set(outputs);
    }

    /// Get the outputs, running `fetch` under the keyed single-writer
    /// sentinel if nobody resolved this unit yet. Blocks until the answer is
    /// known.
    pub async fn get_or_fetch<F, Fut>(&self, unit: &Path, fetch: F) -> Outputs
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outputs>,
    {
        let cell = self.entry(unit);
        cell.get_or_init(fetch).await.clone()
    }

    /// Already-resolved outputs, without triggering a fetch.
    pub fn peek(&self, unit: &Path) -> Option<Outputs> {
        let cell = self.entry(unit);
        cell.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_fetches_run_once() {
        let cache = Arc::new(OutputsCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let unit = PathBuf::from("/stack/vpc");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let unit = unit.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&unit, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Outputs::Ready(json!({"id": "vpc-1"}))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Outputs::Ready(json!({"id": "vpc-1"})));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn published_outputs_win_over_later_fetches() {
        let cache = OutputsCache::new();
        let unit = PathBuf::from("/stack/vpc");
        cache.publish(&unit, Outputs::Ready(json!({"id": "applied"})));
        let got = cache
            .get_or_fetch(&unit, || async { Outputs::Unavailable })
            .await;
        assert_eq!(got, Outputs::Ready(json!({"id": "applied"})));
    }

    #[tokio::test]
    async fn unavailable_results_are_cached_too() {
        let cache = OutputsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let unit = PathBuf::from("/stack/unapplied");
        for _ in 0..2 {
            let calls = calls.clone();
            let got = cache
                .get_or_fetch(&unit, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Outputs::Unavailable
                })
                .await;
            assert_eq!(got, Outputs::Unavailable);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
