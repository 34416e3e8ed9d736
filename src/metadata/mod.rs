// src/metadata/mod.rs
//! Talker metadata: normalization, upstream sources and the polling cache.

pub mod normalize;
pub mod poller;
pub mod source;

pub use normalize::{normalize, TalkerRecord, IDLE_TALKER};
pub use poller::{MetadataPoller, PollerHandle, PollerSnapshot, DEFAULT_POLL_INTERVAL};
pub use source::{HttpMetadataSource, MetadataSource, PollError, DEFAULT_FETCH_TIMEOUT};
