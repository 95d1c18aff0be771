use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;

pub const NAME: &str = "get_current_time";
pub const DEFAULT_UTC_OFFSET: &str = "+00:00";

static UTC_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-](0\d|1[0-4]):[0-5]\d$").expect("valid utc offset regex"));

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "utc_offset": {
                "type": "string",
                "description": "UTC offset such as +02:00 or -05:30. Defaults to +00:00.",
                "pattern": UTC_OFFSET.as_str()
            }
        }
    })
}

/// Accepted offset string, falling back to UTC for anything absent or malformed.
pub fn normalize_offset(args: &Map<String, Value>) -> &str {
    args.get("utc_offset")
        .and_then(Value::as_str)
        .filter(|s| UTC_OFFSET.is_match(s))
        .unwrap_or(DEFAULT_UTC_OFFSET)
}

fn parse_offset(offset: &str) -> anyhow::Result<FixedOffset> {
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let (hours, minutes) = offset[1..]
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("malformed utc offset: {}", offset))?;
    let seconds = sign * (hours.parse::<i32>()? * 3600 + minutes.parse::<i32>()? * 60);
    FixedOffset::east_opt(seconds).ok_or_else(|| anyhow::anyhow!("utc offset out of range: {}", offset))
}

pub fn run(args: &Map<String, Value>) -> anyhow::Result<Value> {
    run_at(args, Utc::now())
}

fn run_at(args: &Map<String, Value>, now: DateTime<Utc>) -> anyhow::Result<Value> {
    let utc_offset = normalize_offset(args);
    let local = now.with_timezone(&parse_offset(utc_offset)?);
    Ok(json!({
        "utc_offset": utc_offset,
        "iso_time": local.to_rfc3339_opts(SecondsFormat::Secs, false),
        "unix_timestamp": now.timestamp(),
    }))
}
