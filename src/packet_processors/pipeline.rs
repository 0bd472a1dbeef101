use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::dispatch::{DispatchCoordinator, DispatchSummary, EntitySink};
use crate::observers::ObserverRegistry;
use crate::packet::Packet;
use crate::packet_processors::router::PacketRouter;
use crate::station_cache::{StationStateCache, StationStateReader};

/// Receives every APRS line the feed worker reads
pub trait PacketHandler: Send {
    fn handle_line(&mut self, line: &str, received_at: DateTime<Utc>);
}

impl<F> PacketHandler for F
where
    F: FnMut(&str, DateTime<Utc>) + Send,
{
    fn handle_line(&mut self, line: &str, received_at: DateTime<Utc>) {
        self(line, received_at)
    }
}

/// What happened to a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line could not be decoded
    Malformed,
    /// Decoded, but carried no weather telemetry
    Dropped,
    /// Written to the cache and dispatched
    Dispatched(DispatchSummary),
}

/// Decode → route → cache → dispatch, one line at a time.
///
/// The pipeline is owned by the feed worker, which makes it the single writer
/// of the station cache and the only driver of dispatch.
pub struct IngestPipeline<S: EntitySink> {
    router: PacketRouter,
    cache: StationStateCache,
    coordinator: DispatchCoordinator<S>,
}

impl<S: EntitySink> IngestPipeline<S> {
    pub fn new(sink: S) -> Self {
        Self {
            router: PacketRouter::new(),
            cache: StationStateCache::new(),
            coordinator: DispatchCoordinator::new(sink),
        }
    }

    pub fn with_position_tracking(mut self, enabled: bool) -> Self {
        self.coordinator = self.coordinator.with_position_tracking(enabled);
        self
    }

    /// Read handle on the station cache for other contexts
    pub fn reader(&self) -> StationStateReader {
        self.cache.reader()
    }

    pub fn cache(&self) -> &StationStateCache {
        &self.cache
    }

    pub fn registry(&self) -> &ObserverRegistry {
        self.coordinator.registry()
    }

    pub fn process_line(&mut self, line: &str, received_at: DateTime<Utc>) -> LineOutcome {
        let start_time = std::time::Instant::now();
        metrics::counter!("aprs.process_line.called_total").increment(1);

        let lag_seconds = (Utc::now() - received_at).num_milliseconds() as f64 / 1000.0;
        metrics::gauge!("aprs.lag_seconds").set(lag_seconds);

        let outcome = match Packet::decode(line, received_at) {
            Ok(packet) => {
                metrics::counter!("aprs.parse.success_total").increment(1);
                self.process_packet(packet)
            }
            Err(e) => {
                metrics::counter!("aprs.parse.failed_total").increment(1);
                debug!("{}", e);
                LineOutcome::Malformed
            }
        };

        let elapsed_ms = start_time.elapsed().as_micros() as f64 / 1000.0;
        metrics::histogram!("aprs.line_processing_latency_ms").record(elapsed_ms);

        outcome
    }

    pub fn process_packet(&mut self, packet: Packet) -> LineOutcome {
        let Some(routed) = self.router.route(packet) else {
            return LineOutcome::Dropped;
        };

        let replaced = self.cache.replace(&routed.station_id, routed.packet);
        if replaced.previous.is_none() {
            debug!("First weather packet from station {}", routed.station_id);
        }

        let summary = self.coordinator.dispatch(&replaced.current);
        trace!(
            "Dispatched {}: {} created, {} updated, {} failed",
            routed.station_id, summary.created, summary.updated, summary.failed
        );
        LineOutcome::Dispatched(summary)
    }
}

impl<S: EntitySink> PacketHandler for IngestPipeline<S> {
    fn handle_line(&mut self, line: &str, received_at: DateTime<Utc>) {
        self.process_line(line, received_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::RecordingSink;
    use crate::packet::Metric;

    fn call(op: &str, station: &str, metric: Metric, value: f64) -> (String, String, Metric, f64) {
        (op.to_string(), station.to_string(), metric, value)
    }

    #[test]
    fn scenario_first_weather_packet_creates() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        let outcome = pipeline.process_packet(
            Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]).with_position(59.9, 30.3),
        );

        assert!(matches!(outcome, LineOutcome::Dispatched(s) if s.created == 1));
        let state = pipeline.cache().get("K1ABC").unwrap();
        assert_eq!(state.last_packet.value(Metric::Temperature), Some(21.5));
        assert_eq!(
            sink.calls(),
            vec![call("create", "K1ABC", Metric::Temperature, 21.5)]
        );
    }

    #[test]
    fn scenario_next_packet_updates_without_second_create() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        pipeline.process_packet(
            Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]).with_position(59.9, 30.3),
        );
        pipeline.process_packet(Packet::weather("K1ABC", [(Metric::Temperature, 22.0)]));

        assert_eq!(
            sink.calls(),
            vec![
                call("create", "K1ABC", Metric::Temperature, 21.5),
                call("update", "K1ABC", Metric::Temperature, 22.0),
            ]
        );
        assert_eq!(pipeline.cache().get("K1ABC").unwrap().last_packet.latitude, None);
    }

    #[test]
    fn scenario_packet_without_weather_touches_nothing() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        let outcome = pipeline.process_line(
            "K1ABC>APRS,TCPIP*,qAC,T2TEST:!5957.00N/03018.00E>Mobile station",
            Utc::now(),
        );

        assert_eq!(outcome, LineOutcome::Dropped);
        assert!(pipeline.cache().is_empty());
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn scenario_empty_weather_is_a_noop() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        pipeline.process_packet(Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]));
        let before = pipeline.cache().get("K1ABC").unwrap();

        let outcome = pipeline.process_packet(Packet::weather("K1ABC", Vec::new()));

        assert_eq!(outcome, LineOutcome::Dropped);
        assert_eq!(pipeline.cache().get("K1ABC").unwrap(), before);
        assert_eq!(sink.calls().len(), 1);
    }

    #[test]
    fn malformed_lines_are_absorbed() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        assert_eq!(
            pipeline.process_line("not an aprs packet", Utc::now()),
            LineOutcome::Malformed
        );
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn raw_weather_line_flows_to_sink() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        pipeline.handle_line(
            "K1ABC>APRS,TCPIP*,qAC,T2TEST:!5957.00N/03018.00E_220/004g005t071h55b10132",
            Utc::now(),
        );

        let metrics: Vec<Metric> = sink.calls().iter().map(|c| c.2).collect();
        assert_eq!(
            metrics,
            vec![
                Metric::Temperature,
                Metric::Humidity,
                Metric::Pressure,
                Metric::WindDirection,
                Metric::WindSpeed,
                Metric::WindGust,
            ]
        );
        assert!(sink.calls().iter().all(|c| c.0 == "create"));
        assert_eq!(pipeline.reader().station_ids(), vec!["K1ABC"]);
    }

    #[test]
    fn positionless_and_sparse_reports_create_entities() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        let outcome = pipeline.process_line(
            "W2XYZ>APRS,TCPIP*,qAC,T2TEST:_10090556c...s...g...t045h50b10100wRSW",
            Utc::now(),
        );
        assert!(matches!(outcome, LineOutcome::Dispatched(s) if s.created == 3));
        assert_eq!(
            sink.calls(),
            vec![
                call("create", "W2XYZ", Metric::Temperature, 45.0),
                call("create", "W2XYZ", Metric::Humidity, 50.0),
                call("create", "W2XYZ", Metric::Pressure, 1010.0),
            ]
        );

        // A positioned report with placeholder wind updates and extends it
        pipeline.process_line(
            "W2XYZ>APRS,TCPIP*,qAC,T2TEST:!4903.50N/07201.75W_.../...g...t046h51b10110wRSW",
            Utc::now(),
        );
        let calls = sink.calls();
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[3], call("update", "W2XYZ", Metric::Temperature, 46.0));
        assert!(calls[3..].iter().all(|c| c.0 == "update"));
    }

    #[test]
    fn stations_are_tracked_independently() {
        let sink = RecordingSink::default();
        let mut pipeline = IngestPipeline::new(sink.clone());

        pipeline.process_packet(Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]));
        pipeline.process_packet(Packet::weather("W2XYZ", [(Metric::Temperature, 10.0)]));
        pipeline.process_packet(Packet::weather("K1ABC", [(Metric::Temperature, 21.0)]));

        assert_eq!(
            sink.calls(),
            vec![
                call("create", "K1ABC", Metric::Temperature, 21.5),
                call("create", "W2XYZ", Metric::Temperature, 10.0),
                call("update", "K1ABC", Metric::Temperature, 21.0),
            ]
        );
        assert_eq!(pipeline.registry().len(), 2);
    }
}
