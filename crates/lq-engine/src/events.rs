use lq_types::SeriesId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    DataWrite,
    DataDelete,
}

/// A change notification from the live-update channel: data was written to
/// or deleted from one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub series: SeriesId,
}

/// Everything the live-update channel can push into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(ChangeEvent),
    SeriesChange(SeriesId),
    Connection(bool),
    Settings(Value),
}
