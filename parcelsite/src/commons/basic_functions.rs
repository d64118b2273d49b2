use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y"];

// Smaller integers are plain numbers (years, counters), not epoch milliseconds
const EPOCH_MILLIS_MIN: i64 = 100_000_000_000;

/// Render a date/time property value as ISO-8601 text.
///
/// Registry and cadastral extracts carry `INSERT`/`UPDATE` timestamps in a
/// handful of layouts; the web map only needs readable text, so every value is
/// turned into a string (`YYYY-MM-DD` for dates, `YYYY-MM-DDTHH:MM:SS` for
/// timestamps). Unrecognised values are kept as their text form and nulls stay null.
pub fn process_datetime(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(normalize_datetime_text(s)),
        // Epoch milliseconds, as written by some GeoJSON drivers
        Value::Number(n) => match n
            .as_i64()
            .filter(|ms| ms.abs() >= EPOCH_MILLIS_MIN)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
        {
            Some(dt) => Value::String(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()),
            None => Value::String(n.to_string()),
        },
        other => Value::String(value_as_text(other)),
    }
}

fn normalize_datetime_text(text: &str) -> String {
    let trimmed = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string();
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return dt.format("%Y-%m-%dT%H:%M:%S").to_string();
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    text.to_string()
}

/// Text form of a property value (strings unquoted, null as empty)
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Null or absent property
pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_process_datetime_formats() {
        assert_eq!(process_datetime(&json!("2012-08-03")), json!("2012-08-03"));
        assert_eq!(process_datetime(&json!("03/08/2012")), json!("2012-08-03"));
        assert_eq!(
            process_datetime(&json!("2012/08/03 10:15:00")),
            json!("2012-08-03T10:15:00")
        );
        assert_eq!(
            process_datetime(&json!("2024-08-01T09:30:00+01:00")),
            json!("2024-08-01T08:30:00")
        );
    }

    #[test]
    fn test_process_datetime_passthrough() {
        assert_eq!(process_datetime(&Value::Null), Value::Null);
        assert_eq!(process_datetime(&json!("not a date")), json!("not a date"));
        assert_eq!(process_datetime(&json!(true)), json!("true"));
        assert_eq!(process_datetime(&json!(2024)), json!("2024"));
        // 2020-01-01T00:00:00Z
        assert_eq!(
            process_datetime(&json!(1577836800000_i64)),
            json!("2020-01-01T00:00:00")
        );
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(value_as_text(&json!("a")), "a");
        assert_eq!(value_as_text(&json!(1.5)), "1.5");
        assert_eq!(value_as_text(&Value::Null), "");
        assert!(is_null(None));
        assert!(is_null(Some(&Value::Null)));
        assert!(!is_null(Some(&json!(""))));
    }
}
