//! Pipeline configuration
//!
//! A run is described by one file (TOML, YAML or JSON) layered with
//! `WHARF_`-prefixed environment variables, e.g. `WHARF_RETRY__MAX_ATTEMPTS=3`.
//! Every section denies unknown keys so typos fail at startup instead of being
//! silently ignored.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::load::LoadStrategy;
use crate::record::TableSpec;
use crate::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_MULTIPLIER};
use crate::transform::TransformOptions;

// ============================================================================
// Defaults
// ============================================================================

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "WHARF";

/// Default number of records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

/// Default number of rows per INSERT statement inside a chunk transaction.
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 500;

/// Default HTTP timeout for the API source.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Bytes inspected when guessing a file's encoding.
pub const DEFAULT_SNIFF_BYTES: usize = 10_000;

/// Encoding used when detection is inconclusive.
pub const DEFAULT_FALLBACK_ENCODING: &str = "windows-1252";

pub const DEFAULT_STAGING_DIR: &str = ".wharf/staging";
pub const DEFAULT_STATE_DIR: &str = ".wharf/state";
pub const DEFAULT_WAREHOUSE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_WAREHOUSE_CONNECT_TIMEOUT_SECS: u64 = 10;

fn default_true() -> bool {
    true
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    File,
    Db,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::File => "file",
            SourceKind::Db => "db",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Identifier used in chunk keys; defaults to the source kind
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub api: Option<ApiSourceConfig>,
    #[serde(default)]
    pub file: Option<FileSourceConfig>,
    #[serde(default)]
    pub db: Option<DbSourceConfig>,
}

impl SourceConfig {
    pub fn source_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.kind.as_str().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    /// 1-based page number parameter
    #[default]
    Page,
    /// Offset and limit parameters
    Offset,
    /// Opaque continuation token returned by the API
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiSourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub endpoint: String,
    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,
    /// Static query parameters added to every request
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_token_param")]
    pub token_param: String,
    /// Field holding the record array; guessed when absent
    #[serde(default)]
    pub records_field: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_page_size_param() -> String {
    "per_page".to_string()
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_token_param() -> String {
    "cursor".to_string()
}

fn default_api_timeout() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

impl ApiSourceConfig {
    pub fn new(base_url: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint: endpoint.into(),
            api_key: None,
            params: BTreeMap::new(),
            pagination: Pagination::default(),
            page_param: default_page_param(),
            page_size_param: default_page_size_param(),
            offset_param: default_offset_param(),
            token_param: default_token_param(),
            records_field: None,
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceConfig {
    /// Files read in order; chunks never span two files
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Encoding label (e.g. `utf-8`, `latin1`); detected when absent
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default = "default_true")]
    pub has_headers: bool,
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
    #[serde(default = "default_fallback_encoding")]
    pub fallback_encoding: String,
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_sniff_bytes() -> usize {
    DEFAULT_SNIFF_BYTES
}

fn default_fallback_encoding() -> String {
    DEFAULT_FALLBACK_ENCODING.to_string()
}

impl FileSourceConfig {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            delimiter: default_delimiter(),
            encoding: None,
            has_headers: true,
            sniff_bytes: DEFAULT_SNIFF_BYTES,
            fallback_encoding: default_fallback_encoding(),
        }
    }

    /// Delimiter as the single byte the csv reader expects
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.delimiter.as_bytes() {
            [b] => Ok(*b),
            _ => Err(ConfigError::Invalid(format!(
                "source.file.delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbSourceConfig {
    /// Connection URL of the operational database; defaults to the warehouse URL
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// Columns to select; every column when empty
    #[serde(default)]
    pub columns: Vec<String>,
    pub watermark_column: String,
    /// SQL type the textual cursor is cast back to
    #[serde(default = "default_watermark_cast")]
    pub watermark_cast: String,
    /// Exclusive lower bound for the first run
    #[serde(default)]
    pub start_after: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_watermark_cast() -> String {
    "timestamptz".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(default)]
    pub strategy: LoadStrategy,
    #[serde(default = "default_load_batch_size")]
    pub batch_size: usize,
    /// Create the target table when missing
    #[serde(default = "default_true")]
    pub create_table: bool,
    /// Build `target.indexes` once every chunk of a run has committed
    #[serde(default = "default_true")]
    pub create_indexes: bool,
}

fn default_load_batch_size() -> usize {
    DEFAULT_LOAD_BATCH_SIZE
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            strategy: LoadStrategy::default(),
            batch_size: DEFAULT_LOAD_BATCH_SIZE,
            create_table: true,
            create_indexes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    /// Postgres URL; falls back to `DATABASE_URL`
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    DEFAULT_WAREHOUSE_MAX_CONNECTIONS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_WAREHOUSE_CONNECT_TIMEOUT_SECS
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_WAREHOUSE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_WAREHOUSE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl WarehouseConfig {
    pub fn resolved_url(&self) -> Option<String> {
        self.url.clone().or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

// ============================================================================
// Root
// ============================================================================

/// Everything needed to drive one logical run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub load: LoadConfig,
    pub target: TableSpec,
    #[serde(default)]
    pub transform: TransformOptions,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
}

impl PipelineConfig {
    /// Load a config file, apply `WHARF_*` overrides and validate the result
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(path = %path.display(), source = %config.source.source_id(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Parse and validate an inline TOML document; environment overrides are not applied
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn source_id(&self) -> String {
        self.source.source_id()
    }

    /// Range and cross-field checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(message.into()))
        }

        if self.retry.max_attempts < 1 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid(format!(
                "retry.base_delay_ms ({}) cannot be greater than retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return invalid("retry.multiplier must be a finite number >= 1.0");
        }
        if self.chunk.size == 0 {
            return invalid("chunk.size must be greater than 0");
        }
        if self.load.batch_size == 0 {
            return invalid("load.batch_size must be greater than 0");
        }

        match self.source.kind {
            SourceKind::Api => {
                let Some(api) = &self.source.api else {
                    return invalid("source.kind = \"api\" requires a [source.api] section");
                };
                if api.base_url.trim().is_empty() {
                    return invalid("source.api.base_url cannot be empty");
                }
            },
            SourceKind::File => {
                let Some(file) = &self.source.file else {
                    return invalid("source.kind = \"file\" requires a [source.file] section");
                };
                if file.paths.is_empty() {
                    return invalid("source.file.paths cannot be empty");
                }
                file.delimiter_byte()?;
                if let Some(label) = &file.encoding {
                    if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                        return invalid(format!("Unknown source.file.encoding {label:?}"));
                    }
                }
                if encoding_rs::Encoding::for_label(file.fallback_encoding.as_bytes()).is_none() {
                    return invalid(format!(
                        "Unknown source.file.fallback_encoding {:?}",
                        file.fallback_encoding
                    ));
                }
            },
            SourceKind::Db => {
                let Some(db) = &self.source.db else {
                    return invalid("source.kind = \"db\" requires a [source.db] section");
                };
                if db.table.trim().is_empty() || db.watermark_column.trim().is_empty() {
                    return invalid("source.db.table and source.db.watermark_column are required");
                }
            },
        }

        if self.target.columns.is_empty() {
            return invalid("target.columns cannot be empty");
        }
        for key in &self.target.primary_key {
            if self.target.column(key).is_none() {
                return invalid(format!("Primary key column {key:?} is not declared in target.columns"));
            }
        }
        if let Some(mark) = &self.target.watermark_column {
            if self.target.column(mark).is_none() {
                return invalid(format!("Watermark column {mark:?} is not declared in target.columns"));
            }
        }
        for index in &self.target.indexes {
            if self.target.column(index).is_none() {
                return invalid(format!("Index column {index:?} is not declared in target.columns"));
            }
        }

        self.load
            .strategy
            .validate(&self.target)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
        [source]
        kind = "file"

        [source.file]
        paths = ["orders.csv"]

        [target]
        name = "orders"
        primary_key = ["id"]
        columns = [
            { name = "id", type = "integer", nullable = false },
            { name = "amount", type = "float" },
        ]
    "#;

    #[test]
    fn test_defaults_apply() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.chunk.size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.load.strategy, LoadStrategy::Append);
        assert_eq!(config.source_id(), "file");
        assert_eq!(config.target.schema, "public");
    }

    #[test]
    fn test_recognized_options() {
        let text = format!(
            "{MINIMAL}\n[retry]\nmax_attempts = 3\nbase_delay_ms = 10\nmax_delay_ms = 100\n\n[chunk]\nsize = 25\n\n[load]\nstrategy = \"upsert\"\nbatch_size = 5\n"
        );
        let config = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.chunk.size, 25);
        assert_eq!(config.load.strategy, LoadStrategy::Upsert);
        assert_eq!(config.load.batch_size, 5);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let text = format!("{MINIMAL}\n[retry]\nmax_attempt = 3\n");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("max_attempt"), "{err}");
    }

    #[test]
    fn test_unknown_section_rejected() {
        let text = format!("{MINIMAL}\n[alerts]\nemail = \"ops@example.com\"\n");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let text = format!("{MINIMAL}\n[retry]\nmax_attempts = 0\n");
        assert!(matches!(
            PipelineConfig::from_toml_str(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let text = format!("{MINIMAL}\n[load]\nstrategy = \"merge\"\n");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_incremental_requires_watermark() {
        let text = format!("{MINIMAL}\n[load]\nstrategy = \"incremental\"\n");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("watermark"), "{err}");
    }

    #[test]
    fn test_source_section_must_match_kind() {
        let text = MINIMAL.replace("kind = \"file\"", "kind = \"api\"");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("[source.api]"), "{err}");
    }

    #[test]
    fn test_bad_delimiter_rejected() {
        let text = MINIMAL.replace("paths = [\"orders.csv\"]", "paths = [\"orders.csv\"]\ndelimiter = \";;\"");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("WHARF_RETRY__MAX_ATTEMPTS", "7");
        std::env::set_var("WHARF_CHUNK__SIZE", "42");
        let result = PipelineConfig::load(&path);
        std::env::remove_var("WHARF_RETRY__MAX_ATTEMPTS");
        std::env::remove_var("WHARF_CHUNK__SIZE");

        let config = result.unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.chunk.size, 42);
    }
}
