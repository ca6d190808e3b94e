use std::collections::BTreeMap;

use async_trait::async_trait;
use lq_types::{DataPoint, SeriesId, SeriesMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("series not found: {0}")]
    SeriesNotFound(SeriesId),
}

/// Result of one dataset fetch: an array of datapoints per query element,
/// ordered by time ascending.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetResponse {
    pub data: BTreeMap<String, Vec<DataPoint>>,
}

/// Backend access for dataset queries. Called exactly once per query fetch
/// with the raw (non-canonicalized) query object as the request body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_dataset(&self, body: &Value) -> Result<DatasetResponse, TransportError>;
}

/// Metadata lookup for referenced series.
#[async_trait]
pub trait SeriesResolver: Send + Sync {
    async fn get_series(&self, id: &SeriesId) -> Result<SeriesMetadata, TransportError>;
}
