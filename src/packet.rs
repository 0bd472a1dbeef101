//! Decoded APRS packets and the weather metrics carried by them.
//!
//! Raw lines are parsed with `ogn-parser`. Weather comes either from the
//! comment of a position report with the weather symbol
//! (`ccc/sssgXXXtXXXrXXXpXXXPXXXhXXbXXXXX`) or from a positionless `_MMDDhhmm`
//! report, decoded by [`crate::weather`]. Values are kept in the units the feed
//! reports them in, apart from undoing the wire encodings (pressure in tenths
//! of hPa, rain in hundredths of an inch, `h00` = 100%).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use num_traits::AsPrimitive;
use ogn_parser::{AprsData, AprsPacket};
use serde::Serialize;

use crate::errors::FeedError;
use crate::weather;

/// A value that can be materialized as an entity for a station.
///
/// The declaration order is the dispatch order: when one packet carries
/// several metrics they are always handled in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Metric {
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "pressure")]
    Pressure,
    #[serde(rename = "wind_direction")]
    WindDirection,
    #[serde(rename = "wind_speed")]
    WindSpeed,
    #[serde(rename = "wind_gust")]
    WindGust,
    #[serde(rename = "rain_1h")]
    Rain1h,
    #[serde(rename = "rain_24h")]
    Rain24h,
    #[serde(rename = "rain_since_midnight")]
    RainSinceMidnight,
    #[serde(rename = "latitude")]
    Latitude,
    #[serde(rename = "longitude")]
    Longitude,
}

impl Metric {
    pub const WEATHER: [Metric; 9] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::WindDirection,
        Metric::WindSpeed,
        Metric::WindGust,
        Metric::Rain1h,
        Metric::Rain24h,
        Metric::RainSinceMidnight,
    ];

    pub const POSITION: [Metric; 2] = [Metric::Latitude, Metric::Longitude];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::WindDirection => "wind_direction",
            Metric::WindSpeed => "wind_speed",
            Metric::WindGust => "wind_gust",
            Metric::Rain1h => "rain_1h",
            Metric::Rain24h => "rain_24h",
            Metric::RainSinceMidnight => "rain_since_midnight",
            Metric::Latitude => "latitude",
            Metric::Longitude => "longitude",
        }
    }

    /// Unit label of the value as reported by the feed
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "°F",
            Metric::Humidity => "%",
            Metric::Pressure => "hPa",
            Metric::WindDirection => "°",
            Metric::WindSpeed | Metric::WindGust => "mph",
            Metric::Rain1h | Metric::Rain24h | Metric::RainSinceMidnight => "in",
            Metric::Latitude | Metric::Longitude => "°",
        }
    }

    pub fn is_position(&self) -> bool {
        matches!(self, Metric::Latitude | Metric::Longitude)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::WEATHER
            .iter()
            .chain(Metric::POSITION.iter())
            .find(|m| m.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown metric: {}", s))
    }
}

/// Coarse classification of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Position,
    Weather,
    Status,
    Other,
}

/// One unit received from the feed. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    pub source_station: String,
    pub kind: PacketKind,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Only populated for weather packets
    pub metrics: BTreeMap<Metric, f64>,
    pub received_at: DateTime<Utc>,
}

impl Packet {
    /// Decode a raw APRS-IS line
    pub fn decode(raw: &str, received_at: DateTime<Utc>) -> Result<Self, FeedError> {
        let parsed = ogn_parser::parse(raw).map_err(|e| FeedError::MalformedPacket {
            raw: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::build(&parsed, information_field(raw), received_at))
    }

    /// Build from an already parsed packet. Weather is read from the raw line
    /// when the packet still carries it.
    pub fn from_aprs(packet: &AprsPacket, received_at: DateTime<Utc>) -> Self {
        let body = packet.raw.as_deref().and_then(information_field);
        Self::build(packet, body, received_at)
    }

    fn build(packet: &AprsPacket, body: Option<&str>, received_at: DateTime<Utc>) -> Self {
        let source_station = packet.from.to_string();

        match &packet.data {
            AprsData::Position(position) => {
                let latitude: f64 = position.latitude.as_();
                let longitude: f64 = position.longitude.as_();

                let mut metrics = body
                    .and_then(weather::position_weather_comment)
                    .map(weather::parse_position_comment)
                    .unwrap_or_default();
                if metrics.is_empty() {
                    // Reports `ogn-parser` decoded itself, e.g. without the raw line
                    let comment = &position.comment;
                    let fields = [
                        (Metric::Temperature, comment.temperature.map(f64::from)),
                        (Metric::Humidity, comment.humidity.map(f64::from)),
                        (Metric::Pressure, comment.barometric_pressure.map(f64::from)),
                        (Metric::WindDirection, comment.wind_direction.map(f64::from)),
                        (Metric::WindSpeed, comment.wind_speed.map(f64::from)),
                        (Metric::WindGust, comment.gust.map(f64::from)),
                        (Metric::Rain1h, comment.rainfall_1h.map(f64::from)),
                        (Metric::Rain24h, comment.rainfall_24h.map(f64::from)),
                        (
                            Metric::RainSinceMidnight,
                            comment.rainfall_midnight.map(f64::from),
                        ),
                    ];
                    metrics = fields
                        .into_iter()
                        .filter_map(|(metric, value)| {
                            value.map(|v| (metric, weather::scale(metric, v)))
                        })
                        .collect();
                }

                let kind = if metrics.is_empty() {
                    PacketKind::Position
                } else {
                    PacketKind::Weather
                };

                Packet {
                    source_station,
                    kind,
                    latitude: Some(latitude),
                    longitude: Some(longitude),
                    metrics,
                    received_at,
                }
            }
            AprsData::Status(_) => Packet::bare(source_station, PacketKind::Status, received_at),
            _ => match body.and_then(weather::parse_positionless) {
                Some(metrics) if !metrics.is_empty() => Packet {
                    source_station,
                    kind: PacketKind::Weather,
                    latitude: None,
                    longitude: None,
                    metrics,
                    received_at,
                },
                _ => Packet::bare(source_station, PacketKind::Other, received_at),
            },
        }
    }

    fn bare(source_station: String, kind: PacketKind, received_at: DateTime<Utc>) -> Self {
        Packet {
            source_station,
            kind,
            latitude: None,
            longitude: None,
            metrics: BTreeMap::new(),
            received_at,
        }
    }

    /// Build a weather packet directly, e.g. for replays and tests
    pub fn weather<S, I>(source_station: S, metrics: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (Metric, f64)>,
    {
        Packet {
            source_station: source_station.into(),
            kind: PacketKind::Weather,
            latitude: None,
            longitude: None,
            metrics: metrics
                .into_iter()
                .filter(|(m, _)| !m.is_position())
                .collect(),
            received_at: Utc::now(),
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_kind(mut self, kind: PacketKind) -> Self {
        self.kind = kind;
        self
    }

    /// Value of a metric in this packet, if present
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Latitude => self.latitude,
            Metric::Longitude => self.longitude,
            _ => self.metrics.get(&metric).copied(),
        }
    }

    pub fn has_weather(&self) -> bool {
        self.kind == PacketKind::Weather && !self.metrics.is_empty()
    }
}

/// Text after the `SRC>DST,PATH:` header
fn information_field(raw: &str) -> Option<&str> {
    raw.split_once(':').map(|(_, body)| body)
}
