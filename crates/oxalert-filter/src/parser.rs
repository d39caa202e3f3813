use crate::error::{FilterError, Result};
use std::collections::BTreeMap;

/// A valid metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMetric {
    /// Canonical series name: the base name followed by `;k=v` tags sorted
    /// by key.
    pub name: String,
    /// Base name without tags.
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn invalid(line: &str, reason: &str) -> FilterError {
    FilterError::InvalidLine(format!("{reason}: {line:?}"))
}

/// Parses `<name>[;k=v...] <value> <unix_seconds>`.
///
/// # Examples
///
/// ```
/// use oxalert_filter::parser::parse_line;
///
/// let m = parse_line(b"cpu.load;host=web1;dc=eu 0.5 1700000000").unwrap();
/// assert_eq!(m.name, "cpu.load;dc=eu;host=web1");
/// assert_eq!(m.labels["host"], "web1");
/// assert!(parse_line(b"cpu.load NaN 1700000000").is_err());
/// ```
pub fn parse_line(raw: &[u8]) -> Result<ParsedMetric> {
    let line = std::str::from_utf8(raw)
        .map_err(|_| FilterError::InvalidLine("not UTF-8".to_string()))?
        .trim();

    let mut fields = line.split_whitespace();
    let (Some(name), Some(value), Some(ts), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(invalid(line, "expected three fields"));
    };

    let value: f64 = value.parse().map_err(|_| invalid(line, "bad value"))?;
    if !value.is_finite() {
        return Err(invalid(line, "non-finite value"));
    }

    let timestamp = match ts.parse::<i64>() {
        Ok(v) => v,
        Err(_) => ts
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
            .ok_or_else(|| invalid(line, "bad timestamp"))?,
    };
    if timestamp <= 0 {
        return Err(invalid(line, "bad timestamp"));
    }

    let mut parts = name.split(';');
    let metric = parts.next().unwrap_or_default();
    if metric.is_empty() || !metric.chars().all(valid_name_char) {
        return Err(invalid(line, "bad metric name"));
    }

    let mut labels = BTreeMap::new();
    for tag in parts {
        let Some((k, v)) = tag.split_once('=') else {
            return Err(invalid(line, "bad tag"));
        };
        if k.is_empty() || v.is_empty() || k == "name" {
            return Err(invalid(line, "bad tag"));
        }
        labels.insert(k.to_string(), v.to_string());
    }

    let mut canonical = metric.to_string();
    for (k, v) in &labels {
        canonical.push(';');
        canonical.push_str(k);
        canonical.push('=');
        canonical.push_str(v);
    }

    Ok(ParsedMetric {
        name: canonical,
        metric: metric.to_string(),
        labels,
        value,
        timestamp,
    })
}
