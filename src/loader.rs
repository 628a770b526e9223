//! Lazy, single-flight module loading.
//!
//! A `ModuleLoader` materializes a compute module (kernel handle, model
//! plan) exactly once per loader, no matter how many callers race on
//! `load()`. The first caller runs the materializer; everyone arriving while
//! the flight is in progress subscribes to the same completion handle and
//! receives the same value or the same failure. A failure is never cached:
//! the loader returns to a retryable state.
//!
//! A loader is built for one configuration. Changing configuration means
//! building a new loader, which is what invalidates the cache.
//!
//! This module also owns the transport abstraction used to fetch the neural
//! model artifact, and the gzip framing logic around it: the kernel runtime
//! expects the model gzip-framed, so a payload that arrives transparently
//! decompressed (HTTP middleware strips `Content-Encoding` all the time) is
//! re-compressed in process before it is cached.

use std::future::Future;
use std::io::Read;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{Artifact, PipelineError, PipelineResult};
use crate::logging::ContextLogger;

/// Observable loader state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    NotLoaded,
    Loading,
    Loaded,
    Error,
}

type BoxedMaterializer<T> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = PipelineResult<T>> + Send>> + Send + Sync>;

enum LoadState<T> {
    NotLoaded,
    Loading(watch::Receiver<Option<PipelineResult<T>>>),
    Loaded(T),
    /// Previous attempt failed. Behaves like `NotLoaded` for the next
    /// `load()`, kept distinct so callers can observe the failure.
    Error,
}

/// Single-flight lazy loader for one module configuration.
pub struct ModuleLoader<T: Clone + Send + Sync + 'static> {
    artifact: Artifact,
    state: Mutex<LoadState<T>>,
    materialize: BoxedMaterializer<T>,
    log: ContextLogger,
}

impl<T: Clone + Send + Sync + 'static> ModuleLoader<T> {
    pub fn new<F, Fut>(artifact: Artifact, log: ContextLogger, materialize: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        Self {
            artifact,
            state: Mutex::new(LoadState::NotLoaded),
            materialize: Arc::new(move || {
                Box::pin(materialize()) as Pin<Box<dyn Future<Output = PipelineResult<T>> + Send>>
            }),
            log,
        }
    }

    pub async fn status(&self) -> LoadStatus {
        match &*self.state.lock().await {
            LoadState::NotLoaded => LoadStatus::NotLoaded,
            LoadState::Loading(_) => LoadStatus::Loading,
            LoadState::Loaded(_) => LoadStatus::Loaded,
            LoadState::Error => LoadStatus::Error,
        }
    }

    /// Load the module, materializing it at most once. Concurrent callers
    /// share the in-flight materialization and its outcome.
    pub async fn load(&self) -> PipelineResult<T> {
        let mut rx = {
            let mut state = self.state.lock().await;
            match &*state {
                LoadState::Loaded(module) => return Ok(module.clone()),
                LoadState::Loading(rx) => rx.clone(),
                LoadState::NotLoaded | LoadState::Error => {
                    let (tx, rx) = watch::channel(None);
                    *state = LoadState::Loading(rx);
                    drop(state);
                    return self.run_flight(tx).await;
                }
            }
        };

        // Waiter path: subscribe to the in-flight completion handle.
        loop {
            let resolved = rx.borrow().clone();
            if let Some(result) = resolved {
                return result;
            }
            if rx.changed().await.is_err() {
                // The initiating flight vanished without resolving.
                return Err(PipelineError::load(self.artifact, "load flight dropped"));
            }
        }
    }

    async fn run_flight(&self, tx: watch::Sender<Option<PipelineResult<T>>>) -> PipelineResult<T> {
        let result = (self.materialize)().await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(module) => {
                *state = LoadState::Loaded(module.clone());
                self.log.debug(&format!("{} module loaded", self.artifact));
            }
            Err(err) => {
                *state = LoadState::Error;
                self.log.warn(&format!("{} load failed: {err}", self.artifact));
            }
        }
        drop(state);

        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Drop the cached module. Not permitted while a flight is in progress.
    pub async fn reset(&self) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, LoadState::Loading(_)) {
            return Err(PipelineError::load(
                self.artifact,
                "reset while a load is in flight",
            ));
        }
        *state = LoadState::NotLoaded;
        Ok(())
    }
}

// =============================================================================
// Transports
// =============================================================================

/// Byte-fetch abstraction over the asset location. Implementations are
/// blocking; the loader drives them through `spawn_blocking`.
pub trait ModuleTransport: Send + Sync {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>>;
}

/// HTTP(S) transport. Asks for identity encoding so the gzip framing of the
/// model artifact survives the wire.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            agent: ureq::agent(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleTransport for HttpTransport {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .agent
            .get(location)
            .set("Accept-Encoding", "identity")
            .call()?;
        let mut payload = Vec::new();
        response.into_reader().read_to_end(&mut payload)?;
        Ok(payload)
    }
}

/// Filesystem transport for local asset paths.
pub struct FsTransport;

impl ModuleTransport for FsTransport {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        Ok(std::fs::read(location)?)
    }
}

/// Pick a transport from the location shape.
pub fn transport_for(location: &str) -> Arc<dyn ModuleTransport> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Arc::new(HttpTransport::new())
    } else {
        Arc::new(FsTransport)
    }
}

// =============================================================================
// Model blob acquisition
// =============================================================================

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip_framed(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == GZIP_MAGIC[0] && bytes[1] == GZIP_MAGIC[1]
}

/// Gzip-compress a payload in process.
pub fn gzip(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip-framed payload.
pub fn gunzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Fetch the model artifact and guarantee gzip framing.
///
/// The kernel runtime consumes the model in its gzip-framed wire form. If the
/// payload arrives without the `1f 8b` magic, some middleware decompressed it
/// transparently and it is re-compressed here before caching. Handing an
/// unframed blob to the kernel is undefined behavior.
pub async fn fetch_model_blob(
    transport: Arc<dyn ModuleTransport>,
    location: &str,
    log: &ContextLogger,
) -> PipelineResult<Vec<u8>> {
    let owned_location = location.to_string();
    let payload = tokio::task::spawn_blocking(move || transport.fetch(&owned_location))
        .await
        .map_err(|e| PipelineError::load(Artifact::Model, e))?
        .map_err(|e| PipelineError::load(Artifact::Model, e))?;

    if is_gzip_framed(&payload) {
        return Ok(payload);
    }

    log.debug("model payload arrived unframed, re-compressing");
    gzip(&payload).map_err(|e| PipelineError::load(Artifact::Model, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
        payload: Vec<u8>,
    }

    impl ModuleTransport for CountingTransport {
        fn fetch(&self, _location: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
    }

    fn test_log() -> ContextLogger {
        ContextLogger::new("loader-test")
    }

    #[tokio::test]
    async fn load_materializes_exactly_once_across_concurrent_callers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let loader = {
            let counter = Arc::clone(&counter);
            Arc::new(ModuleLoader::new(Artifact::Kernel, test_log(), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(7u32)
                }
            }))
        };

        let mut handles = Vec::new();
        for _ in 0..10 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move { loader.load().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(loader.status().await, LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn failure_is_not_cached_and_retry_reinvokes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let loader = {
            let counter = Arc::clone(&counter);
            ModuleLoader::new(Artifact::Model, test_log(), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(PipelineError::load(Artifact::Model, "http 503"))
                    } else {
                        Ok(42u32)
                    }
                }
            })
        };

        assert!(loader.load().await.is_err());
        assert_eq!(loader.status().await, LoadStatus::Error);

        assert_eq!(loader.load().await.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(loader.status().await, LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn reset_drops_cache_but_not_inflight() {
        let loader = Arc::new(ModuleLoader::new(Artifact::Kernel, test_log(), || async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(1u8)
        }));

        let flight = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { loader.load().await })
        };
        // Give the flight time to take off.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(loader.status().await, LoadStatus::Loading);
        assert!(loader.reset().await.is_err());

        flight.await.unwrap().unwrap();
        assert_eq!(loader.status().await, LoadStatus::Loaded);
        loader.reset().await.unwrap();
        assert_eq!(loader.status().await, LoadStatus::NotLoaded);
    }

    #[tokio::test]
    async fn model_blob_keeps_existing_gzip_framing() {
        let framed = gzip(b"model-bytes").unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            payload: framed.clone(),
        });
        let blob = fetch_model_blob(transport, "models/x.onnx.gz", &test_log())
            .await
            .unwrap();
        assert_eq!(blob, framed);
    }

    #[tokio::test]
    async fn unframed_model_blob_is_regzipped() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            payload: b"raw-model-bytes".to_vec(),
        });
        let blob = fetch_model_blob(transport, "models/x.onnx.gz", &test_log())
            .await
            .unwrap();
        assert!(is_gzip_framed(&blob));
        assert_eq!(gunzip(&blob).unwrap(), b"raw-model-bytes");
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_transport_call() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            payload: gzip(b"m").unwrap(),
        });
        let loader = {
            let transport = transport.clone();
            Arc::new(ModuleLoader::new(Artifact::Model, test_log(), move || {
                let transport: Arc<dyn ModuleTransport> = transport.clone();
                let log = test_log();
                async move { fetch_model_blob(transport, "base/model.gz", &log).await }
            }))
        };

        let mut handles = Vec::new();
        for _ in 0..10 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move { loader.load().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
