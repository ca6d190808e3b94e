#![forbid(unsafe_code)]

mod events;
mod handler;
mod memory;
mod query;
mod transport;

pub use events::{ChangeEvent, ChangeKind, ChannelMessage};
pub use handler::{
    DatasetHandler, EngineConfig, EngineError, Subscriber, spawn_channel_adapter,
};
pub use memory::InMemoryBackend;
pub use transport::{DatasetResponse, SeriesResolver, Transport, TransportError};
