//! Weather report fields as stations actually send them.
//!
//! Reports are fixed-width `<tag><digits>` runs. Stations replace digits they
//! have no reading for with dots or spaces, skip fields entirely and append a
//! software/unit suffix (`wRSW`, `eMB51`) after the data. Every field is
//! decoded on its own, so a missing or unreadable one never costs the rest of
//! the report.

use std::collections::BTreeMap;

use crate::packet::Metric;

/// Symbol code of a weather station
pub const WEATHER_SYMBOL: u8 = b'_';

/// Comment of a position report body whose symbol is the weather station.
///
/// Handles plain (`!`/`=`) and timestamped (`/`/`@`) reports in both the
/// uncompressed and the compressed position format.
pub fn position_weather_comment(body: &str) -> Option<&str> {
    let start = match body.as_bytes().first()? {
        b'!' | b'=' => 1,
        b'/' | b'@' => 8,
        _ => return None,
    };
    let position = body.get(start..)?;
    let first = *position.as_bytes().first()?;
    // Uncompressed: DDMM.mmN/DDDMM.mmE_ ; compressed: /YYYYXXXX_csT
    let (symbol_at, comment_at) = if first.is_ascii_digit() || first == b' ' {
        (18, 19)
    } else {
        (9, 13)
    };
    if *position.as_bytes().get(symbol_at)? != WEATHER_SYMBOL {
        return None;
    }
    Some(position.get(comment_at..).unwrap_or(""))
}

/// Weather carried in a position comment: `ccc/sss` wind, then tagged fields
pub fn parse_position_comment(comment: &str) -> BTreeMap<Metric, f64> {
    let mut metrics = BTreeMap::new();
    let rest = match (comment.get(0..3), comment.get(3..4), comment.get(4..7)) {
        (Some(direction), Some("/"), Some(speed)) => {
            insert(&mut metrics, Metric::WindDirection, direction);
            insert(&mut metrics, Metric::WindSpeed, speed);
            &comment[7..]
        }
        _ => comment,
    };
    parse_fields(rest, Layout::Position, &mut metrics);
    metrics
}

/// Positionless report body: `_MMDDhhmm` followed by tagged fields.
///
/// `None` if the body is not a positionless weather report at all.
pub fn parse_positionless(body: &str) -> Option<BTreeMap<Metric, f64>> {
    let rest = body.strip_prefix(WEATHER_SYMBOL as char)?;
    let timestamp = rest.get(0..8)?;
    if !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut metrics = BTreeMap::new();
    parse_fields(&rest[8..], Layout::Positionless, &mut metrics);
    Some(metrics)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Position,
    Positionless,
}

/// Width and target of a field tag. `s` is wind speed in positionless
/// reports and snowfall otherwise.
fn field_layout(tag: u8, layout: Layout) -> Option<(usize, Option<Metric>)> {
    let field = match tag {
        b'c' => (3, Some(Metric::WindDirection)),
        b's' if layout == Layout::Positionless => (3, Some(Metric::WindSpeed)),
        b's' => (3, None),
        b'g' => (3, Some(Metric::WindGust)),
        b't' => (3, Some(Metric::Temperature)),
        b'r' => (3, Some(Metric::Rain1h)),
        b'p' => (3, Some(Metric::Rain24h)),
        b'P' => (3, Some(Metric::RainSinceMidnight)),
        b'h' => (2, Some(Metric::Humidity)),
        b'b' => (5, Some(Metric::Pressure)),
        // Luminosity and raw rain counter
        b'L' | b'l' | b'#' => (3, None),
        _ => return None,
    };
    Some(field)
}

/// Walk the tagged fields until the first tag that is not a weather field,
/// which starts the software suffix or free text.
fn parse_fields(mut rest: &str, layout: Layout, metrics: &mut BTreeMap<Metric, f64>) {
    while let Some(&tag) = rest.as_bytes().first() {
        let Some((width, metric)) = field_layout(tag, layout) else {
            break;
        };
        let Some(raw) = rest.get(1..1 + width) else {
            break;
        };
        if let Some(metric) = metric {
            insert(metrics, metric, raw);
        }
        rest = &rest[1 + width..];
    }
}

/// First reading of a metric wins; placeholders are skipped.
fn insert(metrics: &mut BTreeMap<Metric, f64>, metric: Metric, raw: &str) {
    if let Some(value) = reading(raw) {
        metrics.entry(metric).or_insert_with(|| scale(metric, value));
    }
}

/// Digits with an optional leading minus; dots and spaces mean no reading
fn reading(raw: &str) -> Option<f64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i32>().ok().map(f64::from)
}

/// Undo the wire encoding of a field
pub fn scale(metric: Metric, value: f64) -> f64 {
    match metric {
        Metric::Humidity if value == 0.0 => 100.0,
        Metric::Pressure => value / 10.0,
        Metric::Rain1h | Metric::Rain24h | Metric::RainSinceMidnight => value / 100.0,
        _ => value,
    }
}
