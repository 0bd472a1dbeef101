//! aprs-weather - APRS-IS weather ingestion library
//!
//! Connects to an APRS-IS server with a server-side filter, keeps the latest
//! weather report of every station it hears and turns every reported value
//! into create/update notifications for a host-supplied entity sink.

pub mod aprs_client;
pub mod aprs_filters;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod feed_worker;
pub mod log_format;
pub mod metrics;
pub mod observers;
pub mod packet;
pub mod packet_processors;
pub mod station_cache;
pub mod weather;

pub use aprs_client::{AprsClientConfig, AprsClientConfigBuilder, FeedConnection};
pub use dispatch::{ChannelSink, DispatchCoordinator, EntitySink, LogSink, SinkEvent};
pub use errors::FeedError;
pub use feed_worker::{ConsumeOptions, FeedHandle, consume};
pub use packet::{Metric, Packet, PacketKind};
pub use packet_processors::{IngestPipeline, PacketHandler, PacketRouter};
pub use station_cache::{StationState, StationStateCache, StationStateReader};
