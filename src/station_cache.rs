//! Latest known state per station.
//!
//! The feed worker is the only writer. It publishes every update through a
//! `tokio::sync::watch` channel, so readers on other threads or tasks never
//! share mutable state with it: they copy an `Arc<StationState>` out of the
//! current snapshot and can wait for the next publication.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

use crate::packet::Packet;

/// Most recent qualifying packet for a station
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationState {
    pub station_id: String,
    pub last_packet: Packet,
    pub last_updated_at: DateTime<Utc>,
}

pub type StationSnapshot = HashMap<String, Arc<StationState>>;

/// Result of [`StationStateCache::replace`]
#[derive(Debug, Clone)]
pub struct Replaced {
    pub current: Arc<StationState>,
    pub previous: Option<Arc<StationState>>,
}

/// Writer side of the station map
pub struct StationStateCache {
    tx: watch::Sender<StationSnapshot>,
}

impl StationStateCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StationSnapshot::new());
        Self { tx }
    }

    /// Replace the state of `station_id` with `packet`, returning the state it
    /// replaced (`None` on first sighting).
    pub fn update(&self, station_id: &str, packet: Packet) -> Option<Arc<StationState>> {
        self.replace(station_id, packet).previous
    }

    /// Like [`update`](Self::update), but also hands back the state that was
    /// just published.
    pub fn replace(&self, station_id: &str, packet: Packet) -> Replaced {
        let current = Arc::new(StationState {
            station_id: station_id.to_string(),
            last_packet: packet,
            last_updated_at: Utc::now(),
        });

        let mut previous = None;
        self.tx.send_modify(|stations| {
            previous = stations.insert(station_id.to_string(), current.clone());
        });

        let station_count = self.tx.borrow().len();
        metrics::gauge!("weather.station_cache.stations").set(station_count as f64);
        trace!(
            station_id,
            first_sighting = previous.is_none(),
            "Station state updated"
        );

        Replaced { current, previous }
    }

    pub fn get(&self, station_id: &str) -> Option<Arc<StationState>> {
        self.tx.borrow().get(station_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A read handle for other scheduling contexts
    pub fn reader(&self) -> StationStateReader {
        StationStateReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StationStateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the station map. Cheap to clone.
#[derive(Clone)]
pub struct StationStateReader {
    rx: watch::Receiver<StationSnapshot>,
}

impl StationStateReader {
    pub fn get(&self, station_id: &str) -> Option<Arc<StationState>> {
        self.rx.borrow().get(station_id).cloned()
    }

    pub fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rx.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole map as of now
    pub fn snapshot(&self) -> StationSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until the writer publishes another update.
    ///
    /// Returns `false` once the cache has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Metric;

    #[test]
    fn first_update_reports_no_previous_state() {
        let cache = StationStateCache::new();
        let previous = cache.update(
            "K1ABC",
            Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]),
        );
        assert!(previous.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn updates_overwrite_instead_of_merging() {
        let cache = StationStateCache::new();
        let first = Packet::weather(
            "K1ABC",
            [(Metric::Temperature, 21.5), (Metric::Humidity, 40.0)],
        )
        .with_position(59.9, 30.3);
        let second = Packet::weather("K1ABC", [(Metric::Temperature, 22.0)]);

        cache.update("K1ABC", first.clone());
        let previous = cache.update("K1ABC", second.clone()).unwrap();

        assert_eq!(previous.last_packet, first);
        let current = cache.get("K1ABC").unwrap();
        assert_eq!(current.last_packet, second);
        assert_eq!(current.last_packet.value(Metric::Humidity), None);
        assert_eq!(current.last_packet.latitude, None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_returns_the_published_state() {
        let cache = StationStateCache::new();
        let first = Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]);
        let second = Packet::weather("K1ABC", [(Metric::Temperature, 22.0)]);

        let replaced = cache.replace("K1ABC", first.clone());
        assert!(replaced.previous.is_none());
        assert_eq!(replaced.current.last_packet, first);

        let replaced = cache.replace("K1ABC", second.clone());
        assert_eq!(replaced.previous.unwrap().last_packet, first);
        assert!(Arc::ptr_eq(&replaced.current, &cache.get("K1ABC").unwrap()));
        assert_eq!(replaced.current.last_packet, second);
    }

    #[test]
    fn get_after_n_updates_returns_last_packet() {
        let cache = StationStateCache::new();
        let mut last = None;
        for i in 0..10 {
            let packet = Packet::weather("W2XYZ", [(Metric::Temperature, f64::from(i))]);
            cache.update("W2XYZ", packet.clone());
            last = Some(packet);
        }
        assert_eq!(cache.get("W2XYZ").unwrap().last_packet, last.unwrap());
    }

    #[test]
    fn readers_see_published_updates() {
        let cache = StationStateCache::new();
        let reader = cache.reader();
        assert!(reader.is_empty());

        cache.update("K1ABC", Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]));
        cache.update("AB1CD", Packet::weather("AB1CD", [(Metric::Humidity, 80.0)]));

        assert_eq!(reader.station_ids(), vec!["AB1CD", "K1ABC"]);
        let state = reader.get("K1ABC").unwrap();
        assert_eq!(state.last_packet.value(Metric::Temperature), Some(21.5));
        assert!(reader.get("N0CALL").is_none());
    }

    #[test]
    fn copies_held_by_readers_are_not_mutated_by_later_updates() {
        let cache = StationStateCache::new();
        let reader = cache.reader();
        cache.update("K1ABC", Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]));
        let held = reader.get("K1ABC").unwrap();

        cache.update("K1ABC", Packet::weather("K1ABC", [(Metric::Temperature, 25.0)]));

        assert_eq!(held.last_packet.value(Metric::Temperature), Some(21.5));
        assert_eq!(
            reader.get("K1ABC").unwrap().last_packet.value(Metric::Temperature),
            Some(25.0)
        );
    }

    #[tokio::test]
    async fn reader_wakes_on_update() {
        let cache = StationStateCache::new();
        let mut reader = cache.reader();

        let waiter = tokio::spawn(async move {
            let changed = reader.changed().await;
            (changed, reader.get("K1ABC"))
        });

        tokio::task::yield_now().await;
        cache.update("K1ABC", Packet::weather("K1ABC", [(Metric::Temperature, 21.5)]));

        let (changed, state) = waiter.await.unwrap();
        assert!(changed);
        assert!(state.is_some());
    }
}
