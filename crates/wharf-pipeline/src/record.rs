//! Record, chunk and table types shared by every pipeline stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Typed scalar stored in a clean record or used as a watermark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Ordering between comparable values.
    ///
    /// Integers and floats compare numerically with each other. Mixed kinds and
    /// `Null` have no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// True when `self` is strictly above `watermark`; anything is above a missing watermark
    pub fn exceeds(&self, watermark: Option<&Value>) -> bool {
        if self.is_null() {
            return false;
        }
        match watermark {
            None | Some(Value::Null) => true,
            Some(mark) => self.compare(mark) == Some(Ordering::Greater),
        }
    }

    /// Canonical text used to compare key tuples
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => "\u{0}null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Json(j) => j.to_string(),
        }
    }

    /// Whether this value may be stored in a column of the given type
    pub fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Bool(_), ColumnType::Boolean)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Integer(_), ColumnType::Float)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (_, ColumnType::Json)
        )
    }

    /// Untyped JSON rendering, used for row summaries and JSON columns
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Json(j) => j.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            other => f.write_str(&other.key_repr()),
        }
    }
}

/// Declared column type of a warehouse table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn pg_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Json => "JSONB",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Target table description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSpec {
    pub name: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub watermark_column: Option<String>,
    /// Columns to index once every chunk of a run has committed
    #[serde(default)]
    pub indexes: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            schema: default_schema(),
            columns,
            primary_key: Vec::new(),
            watermark_column: None,
            indexes: Vec::new(),
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_watermark(mut self, column: impl Into<String>) -> Self {
        self.watermark_column = Some(column.into());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// `schema.name`, unquoted; used for logging and lock keys
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Key tuple identifying a row, `None` when the table declares no primary key
    pub fn key_of(&self, record: &CleanRecord) -> Option<Vec<String>> {
        if self.primary_key.is_empty() {
            return None;
        }
        Some(
            self.primary_key
                .iter()
                .map(|col| record.get(col).map(Value::key_repr).unwrap_or_default())
                .collect(),
        )
    }
}

/// Identity of a chunk within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub run_id: String,
    pub source_id: String,
    pub sequence: u64,
}

impl ChunkKey {
    pub fn new(run_id: impl Into<String>, source_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            run_id: run_id.into(),
            source_id: source_id.into(),
            sequence,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.source_id, self.sequence)
    }
}

/// Where and when a raw record was extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub extracted_at: DateTime<Utc>,
    pub sequence: u64,
    /// File name or request URL the record came from
    pub origin: Option<String>,
}

/// One untyped record as produced by a source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    fields: serde_json::Map<String, serde_json::Value>,
    provenance: Provenance,
}

impl RawRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>, provenance: Provenance) -> Self {
        Self { fields, provenance }
    }

    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

/// Ordered records of one extraction unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk<R> {
    key: ChunkKey,
    records: Vec<R>,
}

impl<R> Chunk<R> {
    pub fn new(key: ChunkKey, records: Vec<R>) -> Self {
        Self { key, records }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}

/// Schema-typed output of a transform
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanRecord {
    values: BTreeMap<String, Value>,
}

impl CleanRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Compact JSON rendering for error summaries
    pub fn summary(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

impl From<BTreeMap<String, Value>> for CleanRecord {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_numeric_values_compare_across_kinds() {
        assert_eq!(Value::Integer(2).compare(&Value::Float(1.5)), Some(Ordering::Greater));
        assert_eq!(Value::Float(2.0).compare(&Value::Integer(2)), Some(Ordering::Equal));
        assert_eq!(Value::Text("a".into()).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_exceeds_watermark() {
        let early = Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let late = Value::Timestamp(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());

        assert!(late.exceeds(Some(&early)));
        assert!(!early.exceeds(Some(&late)));
        assert!(!early.exceeds(Some(&early)));
        assert!(early.exceeds(None));
        assert!(!Value::Null.exceeds(None));
    }

    #[test]
    fn test_value_serde_keeps_type_tag() {
        let ts = Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap());
        let encoded = serde_json::to_value(&ts).unwrap();
        assert_eq!(encoded["type"], "timestamp");
        let decoded: Value = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, ts);
    }

    #[test]
    fn test_chunk_key_ordering_and_display() {
        let a = ChunkKey::new("run", "orders", 2);
        let b = ChunkKey::new("run", "orders", 10);
        assert!(a < b);
        assert_eq!(b.to_string(), "run/orders/10");
    }

    #[test]
    fn test_table_key_of() {
        let table = TableSpec::new(
            "orders",
            vec![
                ColumnSpec::new("id", ColumnType::Integer),
                ColumnSpec::new("region", ColumnType::Text),
            ],
        )
        .with_primary_key(["id", "region"]);
        let record = CleanRecord::new()
            .with("id", Value::Integer(7))
            .with("region", Value::Text("eu".into()));

        assert_eq!(table.key_of(&record), Some(vec!["7".to_string(), "eu".to_string()]));
        assert_eq!(TableSpec::new("t", vec![]).key_of(&record), None);
    }

    #[test]
    fn test_value_fits_column_type() {
        assert!(Value::Integer(1).fits(ColumnType::Float));
        assert!(!Value::Float(1.0).fits(ColumnType::Integer));
        assert!(Value::Null.fits(ColumnType::Timestamp));
        assert!(Value::Text("x".into()).fits(ColumnType::Json));
    }
}
