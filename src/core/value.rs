use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::config::Conversions;

lazy_static! {
    static ref NON_NUMERIC: Regex = Regex::new(r"[^0-9.\-]").unwrap();
    static ref SCIENTIFIC: Regex = Regex::new(r"^[-+]?(\d+\.?\d*|\.\d+)[eE][-+]?\d+$").unwrap();
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A field value held by an entity or a backend record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Binary(Vec<u8>),
    Boolean(bool),
    Text(String),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Binary(_) => "BINARY",
            Self::Boolean(_) => "BOOLEAN",
            Self::Text(_) => "TEXT",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Decimal(_) => "DECIMAL",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "DATETIME",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON form used by the flat representation and by serde.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Self::Boolean(b) => Json::Bool(*b),
            Self::Text(s) => Json::String(s.clone()),
            Self::Integer(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
            Self::Time(t) => Json::String(t.format(TIME_FORMAT).to_string()),
            Self::DateTime(dt) => Json::String(dt.format(DATETIME_FORMAT).to_string()),
        }
    }

    /// Reads an untyped JSON value. Strings stay text until a column type
    /// coerces them.
    pub fn from_json(json: &serde_json::Value) -> std::result::Result<Self, String> {
        use serde_json::Value as Json;
        match json {
            Json::Null => Ok(Self::Null),
            Json::Bool(b) => Ok(Self::Boolean(*b)),
            Json::String(s) => Ok(Self::Text(s.clone())),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Integer(i)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| format!("number {} is out of range", n)),
            },
            Json::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| "binary values must be arrays of bytes".to_string())
                })
                .collect::<std::result::Result<Vec<u8>, String>>()
                .map(Self::Binary),
            Json::Object(_) => Err("objects are not scalar values".to_string()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Text(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(fl) => write!(f, "{}", fl),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Time(t) => write!(f, "{}", t.format(TIME_FORMAT)),
            Self::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Self::Decimal(d)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Self::Date(d)
    }
}

impl From<NaiveTime> for Value {
    fn from(t: NaiveTime) -> Self {
        Self::Time(t)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Self::DateTime(dt)
    }
}

/// Declared storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Binary,
    Boolean,
    String,
    Text,
    Integer,
    Float,
    Decimal,
    Date,
    Time,
    DateTime,
}

impl ColumnType {
    /// Whether `value` can be stored in a column of this type without
    /// conversion.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Binary, Value::Binary(_))
                | (Self::Boolean, Value::Boolean(_))
                | (Self::String | Self::Text, Value::Text(_))
                | (Self::Integer, Value::Integer(_))
                | (Self::Float, Value::Float(_))
                | (Self::Decimal, Value::Decimal(_))
                | (Self::Date, Value::Date(_))
                | (Self::Time, Value::Time(_))
                | (Self::DateTime, Value::DateTime(_))
        )
    }

    /// Converts `value` into this column type. The error is a human
    /// readable reason.
    pub fn coerce(&self, value: Value, conversions: &Conversions) -> std::result::Result<Value, String> {
        if self.accepts(&value) {
            return Ok(value);
        }
        let fail = |value: &Value| format!("cannot convert {} '{}' to {}", value.type_name(), value, self);
        match (self, value) {
            (Self::Binary, Value::Text(s)) => Ok(Value::Binary(s.into_bytes())),

            (Self::Boolean, Value::Text(s)) => {
                let lowered = s.trim().to_lowercase();
                if conversions.boolean_true_strings.iter().any(|t| *t == lowered) {
                    Ok(Value::Boolean(true))
                } else if conversions.boolean_false_strings.iter().any(|t| *t == lowered) {
                    Ok(Value::Boolean(false))
                } else {
                    Err(fail(&Value::Text(s)))
                }
            }
            (Self::Boolean, Value::Integer(i)) => Ok(Value::Boolean(i != 0)),

            (Self::String | Self::Text, Value::Binary(bytes)) => String::from_utf8(bytes)
                .map(Value::Text)
                .map_err(|e| format!("binary value is not utf-8: {}", e)),
            (Self::String | Self::Text, other) => Ok(Value::Text(other.to_string())),

            (Self::Integer, Value::Text(s)) => {
                let cleaned = normalize_number(&s, &conversions.decimal_separator);
                if let Ok(i) = cleaned.parse::<i64>() {
                    return Ok(Value::Integer(i));
                }
                match cleaned.parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 => float_to_integer(f)
                        .map(Value::Integer)
                        .ok_or_else(|| fail(&Value::Text(s))),
                    _ => Err(fail(&Value::Text(s))),
                }
            }
            (Self::Integer, Value::Float(f)) => float_to_integer(f.trunc())
                .map(Value::Integer)
                .ok_or_else(|| fail(&Value::Float(f))),
            (Self::Integer, Value::Decimal(d)) => d
                .trunc()
                .to_i64()
                .map(Value::Integer)
                .ok_or_else(|| fail(&Value::Decimal(d))),
            (Self::Integer, Value::Boolean(b)) => Ok(Value::Integer(i64::from(b))),

            (Self::Float, Value::Text(s)) => match normalize_number(&s, &conversions.decimal_separator).parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err(fail(&Value::Text(s))),
            },
            (Self::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (Self::Float, Value::Decimal(d)) => d
                .to_f64()
                .map(Value::Float)
                .ok_or_else(|| fail(&Value::Decimal(d))),

            (Self::Decimal, Value::Text(s)) => {
                let cleaned = normalize_number(&s, &conversions.decimal_separator);
                let parsed = if SCIENTIFIC.is_match(&cleaned) {
                    Decimal::from_scientific(&cleaned)
                } else {
                    Decimal::from_str(&cleaned)
                };
                parsed.map(Value::Decimal).map_err(|_| fail(&Value::Text(s)))
            }
            (Self::Decimal, Value::Integer(i)) => Ok(Value::Decimal(Decimal::from(i))),
            (Self::Decimal, Value::Float(f)) => Decimal::try_from(f)
                .map(Value::Decimal)
                .map_err(|_| fail(&Value::Float(f))),

            (Self::Date, Value::Text(s)) => parse_date(&s, conversions)
                .map(Value::Date)
                .ok_or_else(|| fail(&Value::Text(s))),
            (Self::Date, Value::DateTime(dt)) => Ok(Value::Date(dt.date())),

            (Self::Time, Value::Text(s)) => parse_time(&s, conversions)
                .map(Value::Time)
                .ok_or_else(|| fail(&Value::Text(s))),
            (Self::Time, Value::DateTime(dt)) => Ok(Value::Time(dt.time())),

            (Self::DateTime, Value::Text(s)) => parse_datetime(&s, conversions)
                .map(Value::DateTime)
                .ok_or_else(|| fail(&Value::Text(s))),
            (Self::DateTime, Value::Date(d)) => d
                .and_hms_opt(0, 0, 0)
                .map(Value::DateTime)
                .ok_or_else(|| fail(&Value::Date(d))),

            (_, other) => Err(fail(&other)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Binary => "BINARY",
            Self::Boolean => "BOOLEAN",
            Self::String => "STRING",
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Decimal => "DECIMAL",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::DateTime => "DATETIME",
        };
        f.write_str(name)
    }
}

/// Numeric text with thousands separators, currency signs and spaces
/// stripped. Exponent notation is kept as is.
fn normalize_number(text: &str, separator: &str) -> String {
    let mut normalized = text.trim().to_string();
    if separator != "." && !separator.is_empty() {
        normalized = normalized.replace('.', "").replace(separator, ".");
    }
    if SCIENTIFIC.is_match(&normalized) {
        return normalized;
    }
    NON_NUMERIC.replace_all(&normalized, "").into_owned()
}

/// Whole floats that fit an `i64`.
fn float_to_integer(f: f64) -> Option<i64> {
    // i64::MAX rounds up to 2^63 as a float, hence the strict bound.
    if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_date(text: &str, conversions: &Conversions) -> Option<NaiveDate> {
    let text = text.trim();
    conversions
        .date_formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            conversions
                .datetime_formats
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn parse_time(text: &str, conversions: &Conversions) -> Option<NaiveTime> {
    let text = text.trim();
    conversions
        .time_formats
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            conversions
                .datetime_formats
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.time())
        })
}

fn parse_datetime(text: &str, conversions: &Conversions) -> Option<NaiveDateTime> {
    let text = text.trim();
    conversions
        .datetime_formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            parse_date(text, conversions).and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_cleanup_with_separator() {
        let mut conversions = Conversions::default();
        assert_eq!(
            ColumnType::Integer.coerce(Value::from("$ 1,200"), &conversions),
            Ok(Value::Integer(1200))
        );

        conversions.decimal_separator = ",".to_string();
        assert_eq!(
            ColumnType::Float.coerce(Value::from("1.234,5"), &conversions),
            Ok(Value::Float(1234.5))
        );
        assert_eq!(
            ColumnType::Decimal.coerce(Value::from("-10,25"), &conversions),
            Ok(Value::Decimal(Decimal::new(-1025, 2)))
        );
    }

    #[test]
    fn test_exponents_and_out_of_range_numbers() {
        let conversions = Conversions::default();
        assert_eq!(
            ColumnType::Integer.coerce(Value::from("1e3"), &conversions),
            Ok(Value::Integer(1000))
        );
        assert_eq!(
            ColumnType::Float.coerce(Value::from("-2.5E-1"), &conversions),
            Ok(Value::Float(-0.25))
        );
        assert_eq!(
            ColumnType::Decimal.coerce(Value::from("2.5e-3"), &conversions),
            Ok(Value::Decimal(Decimal::new(25, 4)))
        );
        assert_eq!(
            ColumnType::Integer.coerce(Value::from("12 EUR"), &conversions),
            Ok(Value::Integer(12))
        );

        assert!(ColumnType::Integer.coerce(Value::from("99999999999999999999"), &conversions).is_err());
        assert!(ColumnType::Integer.coerce(Value::Float(1e30), &conversions).is_err());
        assert!(ColumnType::Integer.coerce(Value::Float(f64::NAN), &conversions).is_err());
        assert!(ColumnType::Float.coerce(Value::from("1e400"), &conversions).is_err());
    }

    #[test]
    fn test_boolean_strings() {
        let conversions = Conversions::default();
        assert_eq!(
            ColumnType::Boolean.coerce(Value::from("Yes"), &conversions),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            ColumnType::Boolean.coerce(Value::from("0"), &conversions),
            Ok(Value::Boolean(false))
        );
        assert!(ColumnType::Boolean.coerce(Value::from("maybe"), &conversions).is_err());
    }

    #[test]
    fn test_dates_from_formats() {
        let conversions = Conversions::default();
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            ColumnType::Date.coerce(Value::from("2024-02-29"), &conversions),
            Ok(Value::Date(date))
        );
        assert_eq!(
            ColumnType::DateTime.coerce(Value::from("2024-02-29"), &conversions),
            Ok(Value::DateTime(date.and_hms_opt(0, 0, 0).unwrap()))
        );
        assert_eq!(
            ColumnType::Time.coerce(Value::from("2024-02-29 10:30:00"), &conversions),
            Ok(Value::Time(NaiveTime::from_hms_opt(10, 30, 0).unwrap()))
        );
    }

    #[test]
    fn test_json_form() {
        let value = Value::Date(NaiveDate::from_ymd_opt(2020, 1, 2).unwrap());
        assert_eq!(value.to_json(), serde_json::json!("2020-01-02"));
        assert_eq!(Value::from_json(&serde_json::json!(5)), Ok(Value::Integer(5)));
        assert_eq!(
            Value::from_json(&serde_json::json!([1, 2])),
            Ok(Value::Binary(vec![1, 2]))
        );
        assert!(Value::from_json(&serde_json::json!({"a": 1})).is_err());
    }
}
