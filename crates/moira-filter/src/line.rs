//! Graphite plaintext protocol.

use crate::error::{FilterError, Result};
use moira_common::types::MetricPoint;
use std::collections::BTreeMap;

/// Parses one `metric[;k=v...] value timestamp` line.
///
/// The line terminator must already be stripped. `now` replaces the
/// Graphite "now" timestamp `-1`.
///
/// # Examples
///
/// ```
/// use moira_filter::line::parse_line;
///
/// let point = parse_line(b"cpu.load;host=a 0.5 1700000000.9", 0).unwrap();
/// assert_eq!(point.name, "cpu.load");
/// assert_eq!(point.label("host"), Some("a"));
/// assert_eq!(point.timestamp, 1_700_000_000);
///
/// assert!(parse_line(b"cpu.load 0.5", 0).is_err());
/// ```
pub fn parse_line(line: &[u8], now: i64) -> Result<MetricPoint> {
    if line.is_empty() {
        return Err(FilterError::malformed("empty line"));
    }
    if let Some(b) = line.iter().find(|b| !(0x20..=0x7e).contains(*b)) {
        return Err(FilterError::malformed(format!(
            "non-printable byte 0x{b:02x}"
        )));
    }
    // Printable ASCII is valid UTF-8.
    let text = std::str::from_utf8(line).map_err(|e| FilterError::malformed(e.to_string()))?;

    let mut fields = text.split(' ');
    let (Some(metric), Some(value), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(FilterError::malformed("expected 3 space-separated fields"));
    };
    if metric.is_empty() || value.is_empty() || timestamp.is_empty() {
        return Err(FilterError::malformed("empty field"));
    }

    let (name, labels) = parse_metric(metric)?;

    let value: f64 = value
        .parse()
        .map_err(|_| FilterError::malformed(format!("bad value {value:?}")))?;
    if !value.is_finite() {
        return Err(FilterError::malformed("value is not finite"));
    }

    let ts: f64 = timestamp
        .parse()
        .map_err(|_| FilterError::malformed(format!("bad timestamp {timestamp:?}")))?;
    if !ts.is_finite() {
        return Err(FilterError::malformed("timestamp is not finite"));
    }
    let timestamp = if ts == -1.0 { now } else { ts.trunc() as i64 };

    Ok(MetricPoint {
        name,
        labels,
        value,
        timestamp,
    })
}

/// Splits `name;k=v;k=v` into the name and its labels.
pub fn parse_metric(metric: &str) -> Result<(String, BTreeMap<String, String>)> {
    let mut parts = metric.split(';');
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(FilterError::malformed("empty metric name"));
    }
    let mut labels = BTreeMap::new();
    for tag in parts {
        let Some((k, v)) = tag.split_once('=') else {
            return Err(FilterError::malformed(format!("tag {tag:?} has no '='")));
        };
        if k.is_empty() || v.is_empty() {
            return Err(FilterError::malformed(format!("tag {tag:?} is incomplete")));
        }
        if k == "name" {
            return Err(FilterError::malformed("tag key 'name' is reserved"));
        }
        labels.insert(k.to_string(), v.to_string());
    }
    Ok((name.to_string(), labels))
}
