//! Raw-to-clean record transformation
//!
//! A [`Transform`] must be pure: the same chunk always yields the same clean
//! rows. The load layer relies on this when a chunk is replayed after a crash.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::TransformError;
use crate::record::{Chunk, CleanRecord, ColumnSpec, ColumnType, RawRecord, TableSpec, Value};

pub trait Transform: Send + Sync {
    fn apply(&self, chunk: &Chunk<RawRecord>, table: &TableSpec) -> Result<Vec<CleanRecord>, TransformError>;
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformOptions {
    /// Trim and lowercase field names, turning spaces and hyphens into underscores
    #[serde(default = "default_true")]
    pub standardize_columns: bool,
    /// Source field name to target column name, applied before standardisation
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Fail the chunk when a record carries a field the table does not declare
    #[serde(default)]
    pub reject_unknown_columns: bool,
    #[serde(default = "default_true")]
    pub drop_duplicates: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            standardize_columns: true,
            rename: BTreeMap::new(),
            reject_unknown_columns: false,
            drop_duplicates: true,
        }
    }
}

/// Cleans records into the shape of the target table
#[derive(Debug, Clone, Default)]
pub struct SchemaTransform {
    options: TransformOptions,
}

impl SchemaTransform {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }

    fn column_name(&self, field: &str) -> String {
        let renamed = self.options.rename.get(field).map(String::as_str).unwrap_or(field);
        if self.options.standardize_columns {
            standardize_column_name(renamed)
        } else {
            renamed.to_string()
        }
    }

    fn clean_record(
        &self,
        chunk: &Chunk<RawRecord>,
        index: usize,
        raw: &RawRecord,
        table: &TableSpec,
    ) -> Result<CleanRecord, TransformError> {
        let fail = |message: String| TransformError {
            chunk_key: chunk.key().clone(),
            message: format!("record {index}{}: {message}", origin_suffix(raw)),
        };

        let mut fields: HashMap<String, &serde_json::Value> = HashMap::with_capacity(raw.fields().len());
        for (name, value) in raw.fields() {
            let column = self.column_name(name);
            if self.options.reject_unknown_columns && table.column(&column).is_none() {
                return Err(fail(format!("field {name:?} is not a declared column")));
            }
            fields.insert(column, value);
        }

        let mut clean = CleanRecord::new();
        for spec in &table.columns {
            let value = match fields.get(&spec.name) {
                Some(json) => coerce(json, spec.column_type).map_err(|e| fail(format!("column {:?}: {e}", spec.name)))?,
                None => Value::Null,
            };
            if value.is_null() && !accepts_null(spec, table) {
                return Err(fail(format!("column {:?} may not be null", spec.name)));
            }
            clean.insert(spec.name.clone(), value);
        }
        Ok(clean)
    }
}

impl Transform for SchemaTransform {
    fn apply(&self, chunk: &Chunk<RawRecord>, table: &TableSpec) -> Result<Vec<CleanRecord>, TransformError> {
        let cleaned = chunk
            .records()
            .iter()
            .enumerate()
            .map(|(index, raw)| self.clean_record(chunk, index, raw, table))
            .collect::<Result<Vec<_>, _>>()?;

        if !self.options.drop_duplicates {
            return Ok(cleaned);
        }

        let before = cleaned.len();
        let deduped = drop_duplicates(cleaned, table);
        if deduped.len() < before {
            tracing::debug!(
                chunk = %chunk.key(),
                removed = before - deduped.len(),
                "Removed duplicate records"
            );
        }
        Ok(deduped)
    }
}

fn origin_suffix(raw: &RawRecord) -> String {
    raw.provenance()
        .origin
        .as_ref()
        .map(|o| format!(" from {o}"))
        .unwrap_or_default()
}

fn accepts_null(spec: &ColumnSpec, table: &TableSpec) -> bool {
    spec.nullable && !table.primary_key.iter().any(|k| k == &spec.name)
}

/// `" Order ID "` becomes `"order_id"`
pub fn standardize_column_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Last occurrence wins per primary key, keeping the position of the first.
/// Without a key only exact duplicates are removed.
fn drop_duplicates(records: Vec<CleanRecord>, table: &TableSpec) -> Vec<CleanRecord> {
    let mut out: Vec<CleanRecord> = Vec::with_capacity(records.len());

    if table.primary_key.is_empty() {
        let mut seen = HashSet::new();
        for record in records {
            if seen.insert(record.summary()) {
                out.push(record);
            }
        }
        return out;
    }

    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    for record in records {
        let key = table.key_of(&record).unwrap_or_default();
        match positions.get(&key) {
            Some(&pos) => out[pos] = record,
            None => {
                positions.insert(key, out.len());
                out.push(record);
            },
        }
    }
    out
}

/// Convert a raw JSON value to the declared column type
pub fn coerce(value: &serde_json::Value, column_type: ColumnType) -> Result<Value, String> {
    use serde_json::Value as Json;

    if value.is_null() {
        return Ok(Value::Null);
    }
    if column_type == ColumnType::Json {
        return Ok(Value::Json(value.clone()));
    }
    if column_type == ColumnType::Text {
        return Ok(Value::Text(match value {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        }));
    }

    // Empty strings mean "no value" for every typed column
    if let Json::String(s) = value {
        if s.trim().is_empty() {
            return Ok(Value::Null);
        }
    }

    match (column_type, value) {
        (ColumnType::Integer, Json::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral_f64))
            .map(Value::Integer)
            .ok_or_else(|| format!("{n} is not an integer")),
        (ColumnType::Integer, Json::String(s)) => parse_integer(s.trim()).map(Value::Integer),

        (ColumnType::Float, Json::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(|| format!("{n} is not a number")),
        (ColumnType::Float, Json::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("{s:?} is not a number")),

        (ColumnType::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (ColumnType::Boolean, Json::Number(n)) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(format!("{n} is not a boolean")),
        },
        (ColumnType::Boolean, Json::String(s)) => parse_bool(s.trim()).map(Value::Bool),

        (ColumnType::Timestamp, Json::String(s)) => parse_timestamp(s.trim()).map(Value::Timestamp),
        (ColumnType::Timestamp, Json::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(Value::Timestamp)
            .ok_or_else(|| format!("{n} is not a unix timestamp")),

        (expected, other) => Err(format!("cannot convert {other} to {expected:?}")),
    }
}

fn parse_integer(s: &str) -> Result<i64, String> {
    // Plain digits are exact; only decimal or exponent forms go through f64
    if let Ok(wide) = s.parse::<i128>() {
        return i64::try_from(wide).map_err(|_| format!("{s:?} is out of range for an integer"));
    }
    s.parse::<f64>()
        .ok()
        .and_then(integral_f64)
        .ok_or_else(|| format!("{s:?} is not an integer"))
}

/// Whole floats inside the `i64` range; `as` would saturate anything outside it
fn integral_f64(f: f64) -> Option<i64> {
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.is_finite() && f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" => Ok(false),
        _ => Err(format!("{s:?} is not a boolean")),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("{s:?} is not a timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChunkKey, Provenance};
    use chrono::TimeZone;
    use serde_json::json;

    fn table() -> TableSpec {
        TableSpec::new(
            "orders",
            vec![
                ColumnSpec::new("id", ColumnType::Integer).not_null(),
                ColumnSpec::new("customer_name", ColumnType::Text),
                ColumnSpec::new("amount", ColumnType::Float),
                ColumnSpec::new("paid", ColumnType::Boolean),
                ColumnSpec::new("updated_at", ColumnType::Timestamp),
            ],
        )
        .with_primary_key(["id"])
    }

    fn chunk(rows: Vec<serde_json::Value>) -> Chunk<RawRecord> {
        let key = ChunkKey::new("run-1", "file", 1);
        let records = rows
            .into_iter()
            .map(|row| {
                let provenance = Provenance {
                    source_id: "file".into(),
                    extracted_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    sequence: 1,
                    origin: Some("orders.csv".into()),
                };
                RawRecord::new(row.as_object().cloned().unwrap(), provenance)
            })
            .collect();
        Chunk::new(key, records)
    }

    #[test]
    fn test_coerces_strings_to_declared_types() {
        let rows = chunk(vec![json!({
            "ID": "7",
            "Customer Name": "Ada",
            "amount": "12.50",
            "paid": "yes",
            "updated_at": "2024-03-01 10:00:00",
        })]);

        let clean = SchemaTransform::default().apply(&rows, &table()).unwrap();

        assert_eq!(clean.len(), 1);
        let record = &clean[0];
        assert_eq!(record.get("id"), Some(&Value::Integer(7)));
        assert_eq!(record.get("customer_name"), Some(&Value::Text("Ada".into())));
        assert_eq!(record.get("amount"), Some(&Value::Float(12.5)));
        assert_eq!(record.get("paid"), Some(&Value::Bool(true)));
        assert_eq!(
            record.get("updated_at"),
            Some(&Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()))
        );
    }

    #[test]
    fn test_empty_strings_become_null_and_missing_fields_null() {
        let rows = chunk(vec![json!({"id": 1, "amount": ""})]);
        let clean = SchemaTransform::default().apply(&rows, &table()).unwrap();
        assert_eq!(clean[0].get("amount"), Some(&Value::Null));
        assert_eq!(clean[0].get("paid"), Some(&Value::Null));
    }

    #[test]
    fn test_null_primary_key_rejected() {
        let rows = chunk(vec![json!({"id": null, "amount": 1})]);
        let err = SchemaTransform::default().apply(&rows, &table()).unwrap_err();
        assert!(err.message.contains("may not be null"), "{}", err.message);
        assert!(err.message.contains("orders.csv"));
    }

    #[test]
    fn test_bad_value_names_column() {
        let rows = chunk(vec![json!({"id": "seven"})]);
        let err = SchemaTransform::default().apply(&rows, &table()).unwrap_err();
        assert!(err.message.contains("\"id\""), "{}", err.message);
    }

    #[test]
    fn test_out_of_range_integer_is_rejected() {
        let rows = chunk(vec![json!({"id": "99999999999999999999"})]);
        let err = SchemaTransform::default().apply(&rows, &table()).unwrap_err();
        assert!(err.message.contains("\"id\""), "{}", err.message);
        assert!(err.message.contains("out of range"), "{}", err.message);
    }

    #[test]
    fn test_integer_boundaries() {
        let cases = [
            (json!("9223372036854775807"), Some(i64::MAX)),
            (json!("-9223372036854775808"), Some(i64::MIN)),
            (json!(i64::MAX), Some(i64::MAX)),
            (json!(i64::MIN), Some(i64::MIN)),
            (json!(" 42 "), Some(42)),
            (json!("1e3"), Some(1000)),
            (json!(7.0), Some(7)),
            (json!(-9.223372036854775808e18), Some(i64::MIN)),
            (json!("9223372036854775808"), None),
            (json!("-9223372036854775809"), None),
            (json!("99999999999999999999"), None),
            (json!("1e30"), None),
            (json!(1e30), None),
            (json!(-1e30), None),
            (json!(9.223372036854775807e18), None),
            (json!(u64::MAX), None),
            (json!("1.5"), None),
            (json!(1.5), None),
            (json!("NaN"), None),
            (json!("inf"), None),
        ];

        for (input, expected) in cases {
            let got = coerce(&input, ColumnType::Integer);
            match expected {
                Some(i) => assert_eq!(got, Ok(Value::Integer(i)), "input {input}"),
                None => assert!(got.is_err(), "input {input} gave {got:?}"),
            }
        }
    }

    #[test]
    fn test_last_duplicate_wins() {
        let rows = chunk(vec![
            json!({"id": 1, "amount": 1.0}),
            json!({"id": 2, "amount": 2.0}),
            json!({"id": 1, "amount": 3.0}),
        ]);
        let clean = SchemaTransform::default().apply(&rows, &table()).unwrap();
        assert_eq!(clean.len(), 2);
        assert_eq!(clean[0].get("amount"), Some(&Value::Float(3.0)));
        assert_eq!(clean[1].get("id"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_duplicates_kept_when_disabled() {
        let rows = chunk(vec![json!({"id": 1}), json!({"id": 1})]);
        let transform = SchemaTransform::new(TransformOptions {
            drop_duplicates: false,
            ..TransformOptions::default()
        });
        assert_eq!(transform.apply(&rows, &table()).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_columns_rejected_when_configured() {
        let rows = chunk(vec![json!({"id": 1, "discount": 5})]);
        let strict = SchemaTransform::new(TransformOptions {
            reject_unknown_columns: true,
            ..TransformOptions::default()
        });
        assert!(strict.apply(&rows, &table()).is_err());
        assert!(SchemaTransform::default().apply(&rows, &table()).is_ok());
    }

    #[test]
    fn test_rename_before_standardising() {
        let rows = chunk(vec![json!({"order-no": 9})]);
        let transform = SchemaTransform::new(TransformOptions {
            rename: BTreeMap::from([("order-no".to_string(), "ID".to_string())]),
            ..TransformOptions::default()
        });
        let clean = transform.apply(&rows, &table()).unwrap();
        assert_eq!(clean[0].get("id"), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let rows = chunk(vec![json!({"id": "1", "amount": "2"}), json!({"id": "2"})]);
        let transform = SchemaTransform::default();
        assert_eq!(transform.apply(&rows, &table()).unwrap(), transform.apply(&rows, &table()).unwrap());
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-06").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-06T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-06T02:00:00+02:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
