//! Parser for the Prometheus text exposition format served by the signer's
//! `/metrics` endpoint.

use crate::models::{MetricKey, MetricsSnapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::trace;

/// Malformed lines are skipped.
pub fn parse_exposition(text: &str, captured_at: DateTime<Utc>) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::new(captured_at);

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_sample(line) {
            Some((key, value)) => snapshot.insert(key, value),
            None => trace!(line, "skipping malformed exposition line"),
        }
    }

    snapshot
}

fn parse_sample(line: &str) -> Option<(MetricKey, f64)> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = line.get(..name_end)?;
    if name.is_empty() {
        return None;
    }

    let rest = line.get(name_end..)?;
    let (labels, rest) = match rest.strip_prefix('{') {
        Some(inner) => parse_labels(inner)?,
        None => (BTreeMap::new(), rest),
    };

    // An optional timestamp may follow the value; it is ignored.
    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some((
        MetricKey {
            name: name.to_owned(),
            labels,
        },
        value,
    ))
}

/// Parses `k="v",...}` and returns the labels plus whatever follows `}`.
fn parse_labels(input: &str) -> Option<(BTreeMap<String, String>, &str)> {
    let mut labels = BTreeMap::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while chars
            .next_if(|(_, c)| c.is_whitespace() || *c == ',')
            .is_some()
        {}

        let (position, first) = chars.next()?;
        if first == '}' {
            return Some((labels, input.get(position + 1..)?));
        }

        let mut name = String::from(first);
        loop {
            let (_, c) = chars.next()?;
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_owned();
        if name.is_empty() {
            return None;
        }

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        if chars.next()?.1 != '"' {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()?.1 {
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    escaped => value.push(escaped),
                },
                '"' => break,
                c => value.push(c),
            }
        }
        labels.insert(name, value);
    }
}
