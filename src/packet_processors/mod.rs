//! Packet processing between the feed and the entity sink
//!
//! - `router` drops packets without weather telemetry
//! - `pipeline` runs decode, routing, caching and dispatch as one serial pass

pub mod pipeline;
pub mod router;

pub use pipeline::{IngestPipeline, LineOutcome, PacketHandler};
pub use router::{PacketRouter, Routed};
