//! Result envelope and Postgres row → JSON conversion.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgHasArrayType, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat};
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use uuid::Uuid;

/// `result_json` of a task response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub fn written(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json(&self) -> String {
        // Only strings and JSON values inside; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"columns":[],"rows":[],"error":"failed to encode result: {e}"}}"#)
        })
    }
}

/// Column names of a row.
pub fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Convert one row to JSON values in column order.
pub fn row_to_json(row: &PgRow) -> Vec<JsonValue> {
    row.columns()
        .iter()
        .map(|column| {
            let idx = column.ordinal();
            decode(row, idx, column.type_info()).unwrap_or_else(|| {
                text_fallback(row, idx).unwrap_or_else(|| {
                    tracing::trace!(
                        column = %column.name(),
                        pg_type = %column.type_info().name(),
                        "No JSON mapping for column value, using null"
                    );
                    JsonValue::Null
                })
            })
        })
        .collect()
}

/// Typed decode by Postgres type name. Domains decode as their base type.
fn decode(row: &PgRow, idx: usize, type_info: &PgTypeInfo) -> Option<JsonValue> {
    match type_info.name() {
        "BOOL" => get::<bool>(row, idx).map(|b| json!(b)),
        "INT2" => get::<i16>(row, idx).map(|i| json!(i)),
        "INT4" => get::<i32>(row, idx).map(|i| json!(i)),
        "INT8" => get::<i64>(row, idx).map(|i| json!(i)),
        "OID" => get::<Oid>(row, idx).map(|o| json!(o.0)),
        "FLOAT4" => get::<f32>(row, idx).and_then(|f| float(f64::from(f))),
        "FLOAT8" => get::<f64>(row, idx).and_then(float),
        "NUMERIC" => get::<Decimal>(row, idx).map(|d| json!(d.to_string())),
        "MONEY" => get::<PgMoney>(row, idx).map(|m| json!(m.to_decimal(2).to_string())),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" | "XML" => {
            get::<String>(row, idx).map(JsonValue::String)
        }
        "UUID" => get::<Uuid>(row, idx).map(|u| json!(u.hyphenated().to_string())),
        "BYTEA" => get::<Vec<u8>>(row, idx).map(|b| json!(bytea_hex(&b))),
        "JSON" | "JSONB" => get::<JsonValue>(row, idx),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx).map(|dt| json!(dt.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx).map(|dt| json!(naive_timestamp(&dt))),
        "DATE" => get::<NaiveDate>(row, idx).map(|d| json!(d.to_string())),
        "TIME" => get::<NaiveTime>(row, idx).map(|t| json!(t.to_string())),
        "TIMETZ" => get::<PgTimeTz<NaiveTime, FixedOffset>>(row, idx)
            .map(|t| json!(format!("{}{}", t.time, t.offset))),
        "INTERVAL" => get::<PgInterval>(row, idx).map(|i| json!(interval_text(&i))),
        "INET" => get::<IpNetwork>(row, idx).map(|n| json!(network_text(&n))),
        "CIDR" => get::<IpNetwork>(row, idx).map(|n| json!(n.to_string())),

        "BOOL[]" => array::<bool>(row, idx, |b| json!(b)),
        "INT2[]" => array::<i16>(row, idx, |i| json!(i)),
        "INT4[]" => array::<i32>(row, idx, |i| json!(i)),
        "INT8[]" => array::<i64>(row, idx, |i| json!(i)),
        "FLOAT4[]" => array::<f32>(row, idx, |f| float(f64::from(f)).unwrap_or(JsonValue::Null)),
        "FLOAT8[]" => array::<f64>(row, idx, |f| float(f).unwrap_or(JsonValue::Null)),
        "NUMERIC[]" => array::<Decimal>(row, idx, |d| json!(d.to_string())),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => array::<String>(row, idx, JsonValue::String),
        "UUID[]" => array::<Uuid>(row, idx, |u| json!(u.hyphenated().to_string())),
        "BYTEA[]" => array::<Vec<u8>>(row, idx, |b| json!(bytea_hex(&b))),
        "JSON[]" | "JSONB[]" => array::<JsonValue>(row, idx, |v| v),
        "TIMESTAMPTZ[]" => array::<DateTime<Utc>>(row, idx, |dt| json!(dt.to_rfc3339())),
        "TIMESTAMP[]" => array::<NaiveDateTime>(row, idx, |dt| json!(naive_timestamp(&dt))),
        "DATE[]" => array::<NaiveDate>(row, idx, |d| json!(d.to_string())),
        "TIME[]" => array::<NaiveTime>(row, idx, |t| json!(t.to_string())),
        "INTERVAL[]" => array::<PgInterval>(row, idx, |i| json!(interval_text(&i))),
        "INET[]" => array::<IpNetwork>(row, idx, |n| json!(network_text(&n))),
        "CIDR[]" => array::<IpNetwork>(row, idx, |n| json!(n.to_string())),

        _ => match type_info.kind() {
            // Enum labels are sent as text in both wire formats.
            PgTypeKind::Enum(_) => get::<String>(row, idx).map(JsonValue::String),
            PgTypeKind::Domain(base) => decode(row, idx, base),
            _ => None,
        },
    }
}

/// Dispatch is by type name, so the decode skips sqlx's compatibility check;
/// that keeps domains and enums decodable as their wire type.
fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get_unchecked::<Option<T>, _>(idx).ok().flatten()
}

/// One-dimensional array; `NULL` elements stay `null`.
fn array<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> JsonValue) -> Option<JsonValue>
where
    T: for<'a> sqlx::Decode<'a, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + PgHasArrayType,
{
    get::<Vec<Option<T>>>(row, idx).map(|items| {
        JsonValue::Array(
            items
                .into_iter()
                .map(|item| item.map_or(JsonValue::Null, &to_json))
                .collect(),
        )
    })
}

/// Raw value as text: always for text-format results, and for binary
/// results that are printable UTF-8 (text-based extension types).
fn text_fallback(row: &PgRow, idx: usize) -> Option<JsonValue> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.is_null() {
        return None;
    }
    let format = raw.format();
    let text = raw.as_str().ok()?;
    let printable = !text.chars().any(|c| c.is_control() && !c.is_whitespace());
    match format {
        PgValueFormat::Text => Some(JsonValue::String(text.to_string())),
        PgValueFormat::Binary if printable => Some(JsonValue::String(text.to_string())),
        PgValueFormat::Binary => None,
    }
}

fn naive_timestamp(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Postgres `intervalstyle = postgres` output, e.g. `1 year 2 mons 3 days 04:05:06.5`.
pub fn interval_text(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    // After a negative field, positive ones carry an explicit "+".
    let mut negative_seen = false;
    let mut sign = |n: i64| {
        let plus = if negative_seen && n > 0 { "+" } else { "" };
        negative_seen |= n < 0;
        plus
    };

    let (years, months) = (interval.months / 12, interval.months % 12);
    for (n, unit) in [
        (i64::from(years), "year"),
        (i64::from(months), "mon"),
        (i64::from(interval.days), "day"),
    ] {
        if n != 0 {
            let plural = if n == 1 { "" } else { "s" };
            parts.push(format!("{}{n} {unit}{plural}", sign(n)));
        }
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let prefix = if micros < 0 { "-" } else { sign(micros) };
        let total = micros.unsigned_abs();
        let (secs, frac) = (total / 1_000_000, total % 1_000_000);
        let mut clock = format!(
            "{prefix}{:02}:{:02}:{:02}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
        if frac != 0 {
            let digits = format!("{frac:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

/// `inet` output: host addresses print bare, networks keep their prefix.
fn network_text(network: &IpNetwork) -> String {
    let host_prefix = if network.is_ipv4() { 32 } else { 128 };
    if network.prefix() == host_prefix {
        network.ip().to_string()
    } else {
        network.to_string()
    }
}

/// NaN and infinities have no JSON form.
fn float(f: f64) -> Option<JsonValue> {
    serde_json::Number::from_f64(f).map(JsonValue::Number)
}

/// Postgres `bytea` hex output form.
pub fn bytea_hex(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_write_shape() {
        let json: JsonValue = serde_json::from_str(&ResultEnvelope::written(3).to_json()).unwrap();
        assert_eq!(json["rows_affected"], 3);
        assert_eq!(json["columns"], json!([]));
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_envelope_error_shape() {
        let envelope = ResultEnvelope::failed("duplicate key");
        assert!(!envelope.is_success());
        let json: JsonValue = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(json["error"], "duplicate key");
        assert!(json.get("rows_affected").is_none());
    }

    #[test]
    fn test_envelope_read_shape() {
        let envelope = ResultEnvelope {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(1), json!("a")], vec![json!(2), JsonValue::Null]],
            ..Default::default()
        };
        let back: ResultEnvelope = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(back, envelope);
        assert!(back.is_success());
    }

    #[test]
    fn test_bytea_hex() {
        assert_eq!(bytea_hex(&[0xde, 0xad, 0x01]), "\\xdead01");
        assert_eq!(bytea_hex(&[]), "\\x");
    }

    fn interval(months: i32, days: i32, microseconds: i64) -> String {
        interval_text(&PgInterval {
            months,
            days,
            microseconds,
        })
    }

    #[test]
    fn test_interval_text() {
        assert_eq!(interval(0, 1, 0), "1 day");
        assert_eq!(interval(14, 3, 0), "1 year 2 mons 3 days");
        assert_eq!(interval(0, 0, 14_706_500_000), "04:05:06.5");
        assert_eq!(interval(0, -2, -3_600_000_000), "-2 days -01:00:00");
        assert_eq!(interval(0, -1, 7_200_000_000), "-1 days +02:00:00");
        assert_eq!(interval(-12, 0, 0), "-1 years");
        assert_eq!(interval(0, 0, 0), "00:00:00");
    }

    #[test]
    fn test_network_text() {
        let host: IpNetwork = "10.0.0.1/32".parse().unwrap();
        assert_eq!(network_text(&host), "10.0.0.1");
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert_eq!(network_text(&net), "10.0.0.0/8");
        let v6: IpNetwork = "::1/128".parse().unwrap();
        assert_eq!(network_text(&v6), "::1");
    }

    #[test]
    fn test_float_non_finite() {
        assert_eq!(float(1.5), Some(json!(1.5)));
        assert_eq!(float(f64::NAN), None);
    }
}
