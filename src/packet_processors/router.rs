use tracing::trace;

use crate::packet::{Packet, PacketKind};

/// A weather packet accepted by the router, keyed by its station
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub station_id: String,
    pub packet: Packet,
}

/// PacketRouter keeps weather packets and drops everything else.
///
/// Packets are handled strictly in arrival order and nothing is buffered:
/// `route` either hands the packet back keyed by station or drops it.
#[derive(Debug, Clone, Default)]
pub struct PacketRouter;

impl PacketRouter {
    pub fn new() -> Self {
        Self
    }

    /// Classify a decoded packet.
    ///
    /// Packets without weather telemetry are the common case on a feed and
    /// are dropped silently.
    pub fn route(&self, packet: Packet) -> Option<Routed> {
        match packet.kind {
            PacketKind::Weather if !packet.metrics.is_empty() => {
                metrics::counter!("weather.router.forwarded_total").increment(1);
                Some(Routed {
                    station_id: packet.source_station.clone(),
                    packet,
                })
            }
            PacketKind::Weather => {
                trace!(
                    "Weather packet from {} has no metrics, dropping",
                    packet.source_station
                );
                metrics::counter!("weather.router.dropped.empty_total").increment(1);
                None
            }
            kind => {
                trace!(
                    "Packet of kind {:?} from {} carries no weather, dropping",
                    kind, packet.source_station
                );
                metrics::counter!("weather.router.dropped.no_weather_total").increment(1);
                None
            }
        }
    }
}
