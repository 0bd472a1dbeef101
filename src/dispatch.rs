//! Turns station updates into entity create/update notifications.
//!
//! Each (station, metric) pair moves from unseen to materialized exactly once,
//! on the first packet that carries a value for it. That packet produces a
//! `create`; every later packet carrying a value produces an `update`.
//! Packets without a value for a metric leave that pair untouched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::errors::FeedError;
use crate::observers::{ObservedMetric, ObserverRegistry};
use crate::packet::Metric;
use crate::station_cache::StationState;

/// Host-side consumer of metric notifications.
///
/// Both calls must return promptly; the feed worker calls them inline.
pub trait EntitySink: Send {
    fn create(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError>;
    fn update(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError>;
}

/// Notification as published by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SinkEvent {
    Create {
        station_id: String,
        metric: Metric,
        value: f64,
        unique_id: String,
        at: DateTime<Utc>,
    },
    Update {
        station_id: String,
        metric: Metric,
        value: f64,
        at: DateTime<Utc>,
    },
}

impl SinkEvent {
    pub fn station_id(&self) -> &str {
        match self {
            SinkEvent::Create { station_id, .. } | SinkEvent::Update { station_id, .. } => {
                station_id
            }
        }
    }

    pub fn metric(&self) -> Metric {
        match self {
            SinkEvent::Create { metric, .. } | SinkEvent::Update { metric, .. } => *metric,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            SinkEvent::Create { value, .. } | SinkEvent::Update { value, .. } => *value,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, SinkEvent::Create { .. })
    }
}

/// Sink that publishes immutable events on a channel for the host to drain
#[derive(Clone)]
pub struct ChannelSink {
    tx: flume::Sender<SinkEvent>,
}

impl ChannelSink {
    /// Create the sink together with the receiving end for the host
    pub fn channel() -> (Self, flume::Receiver<SinkEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn publish(&self, event: SinkEvent) -> Result<(), FeedError> {
        let station_id = event.station_id().to_string();
        let metric = event.metric();
        self.tx.send(event).map_err(|_| FeedError::SinkUnavailable {
            station_id,
            metric: metric.to_string(),
            reason: "event channel closed".to_string(),
        })
    }
}

impl EntitySink for ChannelSink {
    fn create(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError> {
        self.publish(SinkEvent::Create {
            station_id: station_id.to_string(),
            metric,
            value,
            unique_id: ObservedMetric::new(station_id, metric).unique_id(),
            at: Utc::now(),
        })
    }

    fn update(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError> {
        self.publish(SinkEvent::Update {
            station_id: station_id.to_string(),
            metric,
            value,
            at: Utc::now(),
        })
    }
}

/// Sink that only writes structured log lines
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl EntitySink for LogSink {
    fn create(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError> {
        let observed = ObservedMetric::new(station_id, metric);
        tracing::info!(
            station_id,
            metric = %metric,
            value,
            unit = metric.unit(),
            unique_id = %observed.unique_id(),
            "New sensor: {}",
            observed.display_name()
        );
        Ok(())
    }

    fn update(&self, station_id: &str, metric: Metric, value: f64) -> Result<(), FeedError> {
        tracing::info!(
            station_id,
            metric = %metric,
            value,
            unit = metric.unit(),
            "Sensor update"
        );
        Ok(())
    }
}

/// Outcome of dispatching one station update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

impl DispatchSummary {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.failed == 0
    }
}

pub struct DispatchCoordinator<S: EntitySink> {
    sink: S,
    registry: ObserverRegistry,
    tracked: Vec<Metric>,
}

impl<S: EntitySink> DispatchCoordinator<S> {
    /// Coordinator tracking the weather metrics only
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            registry: ObserverRegistry::new(),
            tracked: Metric::WEATHER.to_vec(),
        }
    }

    /// Also materialize latitude/longitude as metrics of their own
    pub fn with_position_tracking(mut self, enabled: bool) -> Self {
        self.tracked = Metric::WEATHER.to_vec();
        if enabled {
            self.tracked.extend(Metric::POSITION);
        }
        self
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    /// Notify the sink about every tracked metric present in the station's
    /// latest packet, in `Metric` order.
    pub fn dispatch(&mut self, state: &StationState) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let station_id = state.station_id.as_str();

        for metric in &self.tracked {
            let metric = *metric;
            let Some(value) = state.last_packet.value(metric) else {
                continue;
            };

            let is_new = self
                .registry
                .mark(ObservedMetric::new(station_id, metric));

            let result = if is_new {
                debug!(station_id, metric = %metric, value, "Materializing metric");
                self.sink.create(station_id, metric, value)
            } else {
                trace!(station_id, metric = %metric, value, "Updating metric");
                self.sink.update(station_id, metric, value)
            };

            match result {
                Ok(()) if is_new => {
                    summary.created += 1;
                    metrics::counter!("weather.dispatch.created_total").increment(1);
                }
                Ok(()) => {
                    summary.updated += 1;
                    metrics::counter!("weather.dispatch.updated_total").increment(1);
                }
                Err(e) => {
                    // The mark stays in place; the sink owns its own retries.
                    let kind = if is_new { "create" } else { "update" };
                    warn!("Dropping {} notification: {}", kind, e);
                    summary.failed += 1;
                    metrics::counter!("weather.dispatch.sink_failed_total").increment(1);
                }
            }
        }

        summary
    }
}
