use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lq_query::canonical_key;
use lq_types::{DataPoint, SeriesId, SeriesMetadata};
use serde_json::Value;
use tokio::sync::watch;

use crate::transport::{DatasetResponse, SeriesResolver, Transport, TransportError};

/// In-memory backend double: responses keyed by the canonical form of the
/// request body, with a pause gate for holding fetches in flight and a
/// call counter for fetch-dedup assertions.
pub struct InMemoryBackend {
    responses: Mutex<HashMap<String, Result<DatasetResponse, String>>>,
    series: Mutex<HashMap<SeriesId, SeriesMetadata>>,
    fetches: AtomicUsize,
    fetches_by_key: Mutex<HashMap<String, usize>>,
    paused: watch::Sender<bool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            responses: Mutex::new(HashMap::new()),
            series: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            fetches_by_key: Mutex::new(HashMap::new()),
            paused,
        }
    }

    pub fn insert_dataset(&self, query: &Value, data: BTreeMap<String, Vec<DataPoint>>) {
        let key = canonical_key(query).expect("backend fixtures use object queries");
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Ok(DatasetResponse { data }));
    }

    pub fn insert_error(&self, query: &Value, message: impl Into<String>) {
        let key = canonical_key(query).expect("backend fixtures use object queries");
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Err(message.into()));
    }

    pub fn insert_series(&self, meta: SeriesMetadata) {
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meta.id.clone(), meta);
    }

    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches observed for one specific query.
    #[must_use]
    pub fn fetch_count_for(&self, query: &Value) -> usize {
        let key = canonical_key(query).expect("backend fixtures use object queries");
        self.fetches_by_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Hold subsequent fetches until `resume` is called.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    async fn wait_if_paused(&self) {
        let mut gate = self.paused.subscribe();
        while *gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryBackend {
    async fn fetch_dataset(&self, body: &Value) -> Result<DatasetResponse, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key =
            canonical_key(body).map_err(|error| TransportError::Transport(error.to_string()))?;
        *self
            .fetches_by_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_insert(0) += 1;
        self.wait_if_paused().await;

        let stored = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        match stored {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(TransportError::Rejected(message)),
            None => Err(TransportError::Rejected(format!(
                "no dataset configured for {key}"
            ))),
        }
    }
}

#[async_trait]
impl SeriesResolver for InMemoryBackend {
    async fn get_series(&self, id: &SeriesId) -> Result<SeriesMetadata, TransportError> {
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::SeriesNotFound(id.clone()))
    }
}
