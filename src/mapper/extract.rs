//! Defensive accessors over loosely structured JSON payloads.
//!
//! Every accessor returns `None` for a missing, null, blank, or mistyped
//! value instead of failing; callers choose the default.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

pub type Fields = Map<String, Value>;

/// Non-blank string value. Numbers and booleans are rendered as text.
pub fn string(fields: &Fields, key: &str) -> Option<String> {
	match fields.get(key)? {
		Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		_ => None,
	}
}

/// Floating point value from a JSON number or a numeric string.
pub fn float(fields: &Fields, key: &str) -> Option<f64> {
	let value = match fields.get(key)? {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse::<f64>().ok(),
		_ => None,
	};
	value.filter(|v| v.is_finite())
}

/// Integer value. Integral floats and numeric strings are accepted.
pub fn integer(fields: &Fields, key: &str) -> Option<i64> {
	as_integer(fields.get(key)?)
}

pub fn as_integer(value: &Value) -> Option<i64> {
	match value {
		Value::Number(n) => n
			.as_i64()
			.or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()).map(|f| f as i64)),
		Value::String(s) => s.trim().parse::<i64>().ok(),
		_ => None,
	}
}

pub fn boolean(fields: &Fields, key: &str) -> Option<bool> {
	match fields.get(key)? {
		Value::Bool(b) => Some(*b),
		Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
			"true" => Some(true),
			"false" => Some(false),
			_ => None,
		},
		_ => None,
	}
}

/// Timestamp from an RFC 3339 string, a handful of common layouts, or a
/// Unix time in milliseconds. Anything else is `None`.
pub fn date(fields: &Fields, key: &str) -> Option<DateTime<Utc>> {
	match fields.get(key)? {
		Value::String(s) => parse_date(s),
		Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
		_ => None,
	}
}

pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
	let input = input.trim();
	if input.is_empty() {
		return None;
	}

	if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
		return Some(dt.with_timezone(&Utc));
	}

	let formats = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"];
	for format in &formats {
		if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
			return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
		}
	}

	NaiveDate::parse_from_str(input, "%Y-%m-%d")
		.ok()
		.and_then(|d| d.and_hms_opt(0, 0, 0))
		.map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// A person reference: either an identity object with `displayName` /
/// `uniqueName`, or a plain `"Display Name <email>"` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub display_name: String,
	pub email: Option<String>,
}

pub fn identity(fields: &Fields, key: &str) -> Option<Identity> {
	parse_identity(fields.get(key)?)
}

pub fn parse_identity(value: &Value) -> Option<Identity> {
	match value {
		Value::Object(obj) => {
			let unique = obj
				.get("uniqueName")
				.and_then(Value::as_str)
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string);
			let display = obj
				.get("displayName")
				.and_then(Value::as_str)
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.or_else(|| unique.clone())?;
			Some(Identity {
				display_name: display,
				email: unique.filter(|u| u.contains('@')),
			})
		}
		Value::String(s) => {
			let s = s.trim();
			if s.is_empty() {
				return None;
			}
			match (s.rfind('<'), s.ends_with('>')) {
				(Some(open), true) => {
					let name = s[..open].trim();
					let email = s[open + 1..s.len() - 1].trim();
					Some(Identity {
						display_name: if name.is_empty() { email.to_string() } else { name.to_string() },
						email: Some(email.to_string()).filter(|e| !e.is_empty()),
					})
				}
				_ => Some(Identity {
					display_name: s.to_string(),
					email: None,
				}),
			}
		}
		_ => None,
	}
}

/// Display name of a person field, if any.
pub fn person(fields: &Fields, key: &str) -> Option<String> {
	identity(fields, key).map(|i| i.display_name)
}
