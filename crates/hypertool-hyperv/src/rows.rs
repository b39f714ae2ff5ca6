//! Tolerant decoding of PowerShell `ConvertTo-Json` output.
//!
//! Host data omits properties depending on VM generation, host version and
//! enabled features, so nothing here fails on a missing field: every
//! accessor produces a default instead. Only malformed JSON is an error.
//!
//! Long-running scripts also print out-of-band marker lines on stdout
//! (progress, job state, final result); [`parse_marker`] recognises them.

use crate::error::{HyperVError, HyperVErrorKind, HyperVResult};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Timestamp used when the host value is absent or unparseable.
pub const UNSET_TIME: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// A single object from the host output with default-producing accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    value: Value,
}

impl RowView {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// The underlying JSON value.
    pub fn raw(&self) -> &Value {
        &self.value
    }

    /// Property lookup: exact key first, then ASCII case-insensitive.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let map = self.value.as_object()?;
        map.get(key).or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    /// String value; null or absent yields an empty string.
    pub fn string(&self, key: &str) -> String {
        match self.get(key) {
            Some(v) => value_to_string(v),
            None => String::new(),
        }
    }

    /// Like [`RowView::string`] but `None` for empty / whitespace values.
    pub fn opt_string(&self, key: &str) -> Option<String> {
        let s = self.string(key);
        if s.trim().is_empty() {
            None
        } else {
            Some(s)
        }
    }

    /// Array (or scalar) as separate non-empty strings.
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(value_to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            Some(v) => {
                let s = value_to_string(v);
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![s]
                }
            }
            None => Vec::new(),
        }
    }

    /// Array (or scalar) as strings in their original positions; null and
    /// empty entries stay as empty strings.
    pub fn positional_strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(v) => vec![value_to_string(v)],
        }
    }

    /// Array (or scalar) rendered as a comma-joined list.
    pub fn string_list(&self, key: &str) -> String {
        self.strings(key).join(", ")
    }

    /// Timestamp value, or [`UNSET_TIME`].
    pub fn datetime(&self, key: &str) -> DateTime<Utc> {
        match self.get(key) {
            Some(Value::String(s)) => parse_host_datetime(s).unwrap_or(UNSET_TIME),
            _ => UNSET_TIME,
        }
    }

    /// Boolean value; anything unrecognised is `false`.
    pub fn bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// 64-bit integer value; anything unrecognised is `0`.
    pub fn i64(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|u| u.min(i64::MAX as u64) as i64))
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => {
                let t = s.trim();
                t.parse::<i64>()
                    .ok()
                    .or_else(|| t.parse::<f64>().ok().map(|f| f as i64))
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => v.to_string(),
    }
}

/// Decode host output into rows.
///
/// Empty or whitespace output and a bare `null` yield no rows; an array
/// yields one row per element in order; any other value yields one row
/// (`ConvertTo-Json` emits a bare object when the pipeline held one item).
pub fn parse_rows(raw: &str) -> HyperVResult<Vec<RowView>> {
    let trimmed = raw.trim().trim_start_matches('\u{feff}');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
        HyperVError::with_details(
            HyperVErrorKind::ParseError,
            format!("Failed to parse PowerShell JSON output: {}", e),
            trimmed.chars().take(500).collect::<String>(),
        )
    })?;
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(RowView::new).collect(),
        other => vec![RowView::new(other)],
    })
}

/// Parse the timestamp shapes the host emits: RFC 3339 (`ToString('o')`),
/// a naive local date-time, or the PowerShell 5.1 `/Date(ms)/` form.
pub fn parse_host_datetime(text: &str) -> Option<DateTime<Utc>> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(ms) = parse_ms_date(s) {
        return Utc.timestamp_millis_opt(ms).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
    ];
    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
    })
}

fn parse_ms_date(s: &str) -> Option<i64> {
    let inner = s
        .strip_prefix("/Date(")
        .or_else(|| s.strip_prefix("\\/Date("))?;
    let end = inner.find(')')?;
    let body = &inner[..end];
    // Optional "+hhmm" / "-hhmm" offset after the millisecond count.
    let split = body
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    body[..split].parse::<i64>().ok()
}

// ─── Out-of-band markers ─────────────────────────────────────────────

pub const PROGRESS_PREFIX: &str = "##HT-PROGRESS:";
pub const STATE_PREFIX: &str = "##HT-STATE:";
pub const RESULT_PREFIX: &str = "##HT-RESULT:";
pub const TARGET_PREFIX: &str = "##HT-TARGET:";

/// A marker line printed by a job-polling script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Percent complete, 0–100.
    Progress(u8),
    /// Host job state text (`Running`, `Completed`, `Failed`, …).
    State(String),
    /// JSON payload describing the job's outcome.
    Result(String),
    /// Name of the VM the job operates on, printed before the job starts.
    Target(String),
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        let pct = rest.trim().parse::<u8>().ok()?;
        return (pct <= 100).then_some(Marker::Progress(pct));
    }
    if let Some(rest) = line.strip_prefix(STATE_PREFIX) {
        return Some(Marker::State(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
        return Some(Marker::Result(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix(TARGET_PREFIX) {
        let name = rest.trim();
        return (!name.is_empty()).then(|| Marker::Target(name.to_string()));
    }
    None
}
