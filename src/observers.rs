use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::packet::Metric;

/// A (station, metric) pair that has been handed to the entity sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObservedMetric {
    pub station_id: String,
    pub metric: Metric,
}

impl ObservedMetric {
    pub fn new(station_id: impl Into<String>, metric: Metric) -> Self {
        Self {
            station_id: station_id.into(),
            metric,
        }
    }

    /// Stable identifier for the entity backing this pair
    pub fn unique_id(&self) -> String {
        format!("aprs{}_rt_{}", self.station_id, self.metric.name())
    }

    /// Human readable entity name
    pub fn display_name(&self) -> String {
        format!("APRS {}", self.station_id)
    }
}

impl fmt::Display for ObservedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.station_id, self.metric)
    }
}

/// Remembers which pairs are materialized.
///
/// Marks are never removed: once a pair has been created it only ever
/// receives updates for the lifetime of the process.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    materialized: HashSet<ObservedMetric>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pair. Returns `true` if it was not materialized before,
    /// i.e. the caller must issue a create rather than an update.
    pub fn mark(&mut self, observed: ObservedMetric) -> bool {
        self.materialized.insert(observed)
    }

    pub fn is_materialized(&self, station_id: &str, metric: Metric) -> bool {
        self.materialized
            .contains(&ObservedMetric::new(station_id, metric))
    }

    pub fn len(&self) -> usize {
        self.materialized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materialized.is_empty()
    }

    /// Materialized metrics of one station, in dispatch order
    pub fn metrics_for(&self, station_id: &str) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .materialized
            .iter()
            .filter(|o| o.station_id == station_id)
            .map(|o| o.metric)
            .collect();
        metrics.sort();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_one_shot() {
        let mut registry = ObserverRegistry::new();
        assert!(registry.mark(ObservedMetric::new("K1ABC", Metric::Temperature)));
        assert!(!registry.mark(ObservedMetric::new("K1ABC", Metric::Temperature)));
        assert!(!registry.mark(ObservedMetric::new("K1ABC", Metric::Temperature)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn pairs_are_independent_per_station_and_metric() {
        let mut registry = ObserverRegistry::new();
        registry.mark(ObservedMetric::new("K1ABC", Metric::Temperature));

        assert!(registry.is_materialized("K1ABC", Metric::Temperature));
        assert!(!registry.is_materialized("K1ABC", Metric::Humidity));
        assert!(!registry.is_materialized("W2XYZ", Metric::Temperature));

        assert!(registry.mark(ObservedMetric::new("W2XYZ", Metric::Temperature)));
        assert!(registry.mark(ObservedMetric::new("K1ABC", Metric::Humidity)));
        assert_eq!(
            registry.metrics_for("K1ABC"),
            vec![Metric::Temperature, Metric::Humidity]
        );
    }

    #[test]
    fn entity_identity() {
        let observed = ObservedMetric::new("K1ABC", Metric::Temperature);
        assert_eq!(observed.unique_id(), "aprsK1ABC_rt_temperature");
        assert_eq!(observed.display_name(), "APRS K1ABC");
        assert_eq!(observed.to_string(), "K1ABC/temperature");
    }
}
