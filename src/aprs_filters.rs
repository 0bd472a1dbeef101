//! APRS-IS server-side filter expressions.
//!
//! The feed is restricted to a radius around a centre point plus a set of
//! packet type codes, e.g. `r/59.95/30.31667/400 -t/oimqstun`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Packet type codes accepted by the `t/` filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketTypeCode {
    Position,
    Object,
    Item,
    Message,
    Query,
    Status,
    Telemetry,
    UserDefined,
    Nws,
    Weather,
}

impl PacketTypeCode {
    pub fn code(&self) -> char {
        match self {
            PacketTypeCode::Position => 'p',
            PacketTypeCode::Object => 'o',
            PacketTypeCode::Item => 'i',
            PacketTypeCode::Message => 'm',
            PacketTypeCode::Query => 'q',
            PacketTypeCode::Status => 's',
            PacketTypeCode::Telemetry => 't',
            PacketTypeCode::UserDefined => 'u',
            PacketTypeCode::Nws => 'n',
            PacketTypeCode::Weather => 'w',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'p' => PacketTypeCode::Position,
            'o' => PacketTypeCode::Object,
            'i' => PacketTypeCode::Item,
            'm' => PacketTypeCode::Message,
            'q' => PacketTypeCode::Query,
            's' => PacketTypeCode::Status,
            't' => PacketTypeCode::Telemetry,
            'u' => PacketTypeCode::UserDefined,
            'n' => PacketTypeCode::Nws,
            'w' => PacketTypeCode::Weather,
            _ => return None,
        })
    }

    /// Parse a run of type letters such as `oimqstun`
    pub fn parse_set(letters: &str) -> Result<Vec<Self>, String> {
        let mut set = Vec::new();
        for c in letters.chars() {
            let code =
                Self::from_code(c).ok_or_else(|| format!("unknown packet type code '{}'", c))?;
            if !set.contains(&code) {
                set.push(code);
            }
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pub terms: Vec<FilterItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterItem {
    pub negated: bool,
    pub kind: FilterKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// r/<lat>/<lon>/<range_km>
    Range { lat: f64, lon: f64, km: f64 },

    /// t/<letters>
    Types(Vec<PacketTypeCode>),

    /// b/<call1>/<call2>/... (wildcards allowed)
    Buddies(Vec<String>),

    /// p/<prefix1>/<prefix2>/...
    Prefixes(Vec<String>),

    /// Token we pass through to the server untouched
    Unknown(String),

    /// A token that failed structured parsing; original preserved
    Invalid { original: String, reason: String },
}

impl FilterExpr {
    /// The filter used by a weather feed: everything within `km` of the
    /// centre, minus the excluded packet types.
    pub fn weather_feed(lat: f64, lon: f64, km: f64, excluded: &[PacketTypeCode]) -> Self {
        let mut terms = vec![FilterItem {
            negated: false,
            kind: FilterKind::Range { lat, lon, km },
        }];
        if !excluded.is_empty() {
            terms.push(FilterItem {
                negated: true,
                kind: FilterKind::Types(excluded.to_vec()),
            });
        }
        FilterExpr { terms }
    }

    /// Append the terms of another expression
    pub fn extend(&mut self, other: FilterExpr) {
        self.terms.extend(other.terms);
    }

    /// Terms that could not be parsed, with the reason
    pub fn invalid_terms(&self) -> Vec<(&str, &str)> {
        self.terms
            .iter()
            .filter_map(|t| match &t.kind {
                FilterKind::Invalid { original, reason } => {
                    Some((original.as_str(), reason.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[derive(Debug)]
pub struct ParseFilterError {
    pub message: String,
}

impl Display for ParseFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for ParseFilterError {}

impl FromStr for FilterExpr {
    type Err = ParseFilterError;

    /// Parse a filter string like `r/59.95/30.31667/400 -t/oimqstun b/K1*`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = Vec::new();

        for raw in s.split_whitespace() {
            let (negated, token) = match raw.strip_prefix('-') {
                Some(stripped) => (true, stripped),
                None => (false, raw),
            };

            let kind = parse_single_token(token).unwrap_or_else(|e| FilterKind::Invalid {
                original: token.to_string(),
                reason: e,
            });

            terms.push(FilterItem { negated, kind });
        }

        Ok(FilterExpr { terms })
    }
}

impl Display for FilterExpr {
    /// Serialize back to an APRS-IS filter string (keeps order and negation)
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| {
                let s = match &t.kind {
                    FilterKind::Range { lat, lon, km } => format!(
                        "r/{}/{}/{}",
                        fmt_float(*lat),
                        fmt_float(*lon),
                        fmt_float(*km)
                    ),
                    FilterKind::Types(codes) => {
                        format!("t/{}", codes.iter().map(|c| c.code()).collect::<String>())
                    }
                    FilterKind::Buddies(list) => format!("b/{}", list.join("/")),
                    FilterKind::Prefixes(pref) => format!("p/{}", pref.join("/")),
                    FilterKind::Unknown(s) => s.clone(),
                    FilterKind::Invalid { original, .. } => original.clone(),
                };
                if t.negated { format!("-{}", s) } else { s }
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

fn parse_single_token(tok: &str) -> Result<FilterKind, String> {
    let mut parts = tok.splitn(2, '/');
    let head = parts.next().unwrap_or("");
    let tail = parts.next();

    match (head, tail) {
        ("r", Some(rest)) => parse_r(rest),
        ("t", Some(rest)) => PacketTypeCode::parse_set(rest).map(FilterKind::Types),
        ("b", Some(rest)) => Ok(FilterKind::Buddies(split_nonempty(rest))),
        ("p", Some(rest)) => Ok(FilterKind::Prefixes(split_nonempty(rest))),
        _ => Ok(FilterKind::Unknown(tok.to_string())),
    }
}

fn parse_r(rest: &str) -> Result<FilterKind, String> {
    let v: Vec<&str> = rest.split('/').collect();
    if v.len() != 3 {
        return Err(format!("bad r/<lat>/<lon>/<km>: got {} parts", v.len()));
    }
    let lat = parse_f64(v[0]).map_err(|e| format!("r/lat: {}", e))?;
    let lon = parse_f64(v[1]).map_err(|e| format!("r/lon: {}", e))?;
    let km = parse_f64(v[2]).map_err(|e| format!("r/km: {}", e))?;
    validate_lat_lon(lat, lon)?;
    if !km.is_finite() || km < 0.0 {
        return Err("r/km must be finite, >= 0".to_string());
    }
    Ok(FilterKind::Range { lat, lon, km })
}

fn split_nonempty(s: &str) -> Vec<String> {
    s.split('/')
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}

fn parse_f64(s: &str) -> Result<f64, String> {
    if s.is_empty() {
        return Err("missing number".to_string());
    }
    s.parse::<f64>().map_err(|_| format!("not a number: {}", s))
}

pub(crate) fn validate_lat_lon(lat: f64, lon: f64) -> Result<(), String> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err("lat/lon must be finite".to_string());
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(format!("lat out of range [-90,90]: {}", lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(format!("lon out of range [-180,180]: {}", lon));
    }
    Ok(())
}

fn fmt_float(x: f64) -> String {
    let s = format!("{}", x);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
