//! # Perfdump - MBean Performance History
//!
//! Harvests management-bean metrics from running services through Jolokia,
//! keeps a rolling, file-persisted history of the harvested snapshots and
//! turns that history into report graphs and descriptive statistics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               PERFDUMP                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  JOLOKIA → HARVESTER → SNAPSHOT STORE → PATH EXTRACTOR → ALIGNER → GRAPHS   │
//! │  JTL RESULTS → STATISTICS ENGINE → SNAPSHOT STORE → JTL REPORT → GRAPHS     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Rolling history**: size-bounded JSON dump, rewritten atomically on append
//! - **Path extraction**: slash-delimited lookups into arbitrarily nested bean trees
//! - **Slot alignment**: timestamp axes merged per slot, first non-zero wins
//! - **Statistics**: nearest-rank percentiles compatible with historic dumps
//! - **Config-driven reports**: graphs declared in TOML, assembled on demand

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, sleep, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Duration as ChronoDuration, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{providers::{Env, Format, Toml}, Figment};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Tool version - follows semantic versioning
pub const PERFDUMP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PERFDUMP_NAME: &str = "perfdump";
pub const PERFDUMP_FULL_NAME: &str = "Perfdump MBean Performance History";

// ----------------------------------------------------------------------------
// History & Retention
// ----------------------------------------------------------------------------

/// Maximum number of snapshots kept in an mbean dump
pub const DEFAULT_DUMP_RETENTION: usize = 70;

/// Number of JTL summaries kept before a new one is appended (20 weeks of daily runs)
pub const JTL_HISTORY_KEEP: usize = 140;

/// Default dump file for mbean snapshots
pub const DEFAULT_DUMP_FILE: &str = "performance-dump.json";

/// Default dump file for JTL summaries
pub const DEFAULT_JTL_DUMP_FILE: &str = "jtl-performance-dump.json";

/// Indentation (spaces) of mbean dump documents
pub const DUMP_INDENT: usize = 4;

/// Indentation (spaces) of JTL dump documents
pub const JTL_DUMP_INDENT: usize = 2;

// ----------------------------------------------------------------------------
// Fetching
// ----------------------------------------------------------------------------

/// How long a Jolokia request keeps retrying transient failures (seconds)
pub const DEFAULT_FETCH_LATENCY_SECS: u64 = 30;

/// Pause between two attempts of a failing Jolokia request (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Timeout of a single HTTP attempt (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Jolokia status codes
pub const JOLOKIA_STATUS_OK: u64 = 200;
pub const JOLOKIA_STATUS_BAD_REQUEST: u64 = 400;
pub const JOLOKIA_STATUS_NOT_FOUND: u64 = 404;

/// Harvest cycles slower than this are reported (milliseconds)
pub const HARVEST_WARN_THRESHOLD_MS: u64 = 10_000;

// ----------------------------------------------------------------------------
// Collection
// ----------------------------------------------------------------------------

/// Default pause between two harvest cycles (seconds)
pub const DEFAULT_COLLECT_INTERVAL_SECS: u64 = 60;

/// Minimum pause between two harvest cycles (milliseconds)
pub const MIN_COLLECT_INTERVAL_MS: u64 = 100;

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// Timestamp path used when a report line declares none
pub const DEFAULT_TIMESTAMP_PATH: &str = "/timestamp";

/// Default output folder of rendered reports
pub const DEFAULT_REPORT_FOLDER: &str = "performance-report";

/// Report document written by the JSON renderer
pub const REPORT_DOCUMENT_NAME: &str = "report.json";

/// Copy of the main plot written by the JSON renderer
pub const MAIN_PLOT_DOCUMENT_NAME: &str = "main.json";

/// Percentiles computed for every JTL summary
pub const JTL_PERCENTILES: [u8; 2] = [10, 90];

/// Colors assigned to automatically built graph lines
pub const AUTO_LINE_COLORS: [&str; 8] = ["b", "y", "orange", "m", "r", "k", "g", "c"];

/// Colors assigned to JTL report lines
pub const JTL_LINE_COLORS: [&str; 7] = ["b", "g", "c", "y", "orange", "m", "r"];

/// Date format of x-axis labels
pub const AXIS_DATE_FORMAT: &str = "%d-%m-%Y";

/// Main plot of the JTL report
pub const JTL_MAIN_PLOT: &str = "Time";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Bean trees are kept in document order end to end: the dump file, the
// in-memory tree and the rewritten dump all iterate keys in the order the
// metric source produced them.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Bean Nodes - Nested Metric Values
// ----------------------------------------------------------------------------

/// Ordered mapping of key → node inside a bean tree.
pub type BeanTree = IndexMap<String, BeanNode>;

/// One node of a harvested bean tree.
///
/// `Number` and `Text` are the scalars metrics are read from; `Null`, `Bool`
/// and `List` exist so that any metric-source response survives a
/// load/persist cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BeanNode {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<BeanNode>),
    Tree(BeanTree),
}

impl BeanNode {
    /// Create an empty tree node
    pub fn tree() -> Self {
        BeanNode::Tree(BeanTree::new())
    }

    /// Build a number node; non-finite values become `Null`
    pub fn from_f64(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(BeanNode::Number)
            .unwrap_or(BeanNode::Null)
    }

    #[inline]
    pub fn is_tree(&self) -> bool {
        matches!(self, BeanNode::Tree(_))
    }

    #[inline]
    pub fn is_scalar(&self) -> bool {
        matches!(self, BeanNode::Number(_) | BeanNode::Text(_))
    }

    pub fn as_tree(&self) -> Option<&BeanTree> {
        match self {
            BeanNode::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_tree_mut(&mut self) -> Option<&mut BeanTree> {
        match self {
            BeanNode::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BeanNode::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Child of a tree node
    pub fn get(&self, key: &str) -> Option<&BeanNode> {
        self.as_tree().and_then(|tree| tree.get(key))
    }

    /// Numeric reading of a node.
    ///
    /// Numbers convert directly, numeric text is parsed, booleans read as
    /// 1/0. Everything else has no numeric reading.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BeanNode::Number(number) => number.as_f64(),
            BeanNode::Text(text) => text.trim().parse::<f64>().ok(),
            BeanNode::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            BeanNode::Null | BeanNode::List(_) | BeanNode::Tree(_) => None,
        }
    }

    /// True when the textual form of the node is a run of decimal digits
    /// (non-negative integers and digit-only strings).
    pub fn is_digit_like(&self) -> bool {
        match self {
            BeanNode::Number(number) => number.is_u64(),
            BeanNode::Text(text) => !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()),
            _ => false,
        }
    }
}

impl From<JsonValue> for BeanNode {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => BeanNode::Null,
            JsonValue::Bool(flag) => BeanNode::Bool(flag),
            JsonValue::Number(number) => BeanNode::Number(number),
            JsonValue::String(text) => BeanNode::Text(text),
            JsonValue::Array(items) => BeanNode::List(items.into_iter().map(BeanNode::from).collect()),
            JsonValue::Object(map) => BeanNode::Tree(
                map.into_iter()
                    .map(|(key, value)| (key, BeanNode::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&BeanNode> for JsonValue {
    fn from(node: &BeanNode) -> Self {
        match node {
            BeanNode::Null => JsonValue::Null,
            BeanNode::Bool(flag) => JsonValue::Bool(*flag),
            BeanNode::Number(number) => JsonValue::Number(number.clone()),
            BeanNode::Text(text) => JsonValue::String(text.clone()),
            BeanNode::List(items) => JsonValue::Array(items.iter().map(JsonValue::from).collect()),
            BeanNode::Tree(tree) => JsonValue::Object(
                tree.iter()
                    .map(|(key, node)| (key.clone(), JsonValue::from(node)))
                    .collect(),
            ),
        }
    }
}

impl From<u64> for BeanNode {
    fn from(value: u64) -> Self {
        BeanNode::Number(value.into())
    }
}

impl From<i64> for BeanNode {
    fn from(value: i64) -> Self {
        BeanNode::Number(value.into())
    }
}

impl From<f64> for BeanNode {
    fn from(value: f64) -> Self {
        BeanNode::from_f64(value)
    }
}

impl From<&str> for BeanNode {
    fn from(value: &str) -> Self {
        BeanNode::Text(value.to_string())
    }
}

impl From<String> for BeanNode {
    fn from(value: String) -> Self {
        BeanNode::Text(value)
    }
}

impl From<BeanTree> for BeanNode {
    fn from(tree: BeanTree) -> Self {
        BeanNode::Tree(tree)
    }
}

impl Display for BeanNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", JsonValue::from(self))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Snapshots - One Harvest Cycle
// ----------------------------------------------------------------------------

/// One point-in-time capture: entry name → bean tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BeanTree);

/// Chronologically ordered snapshots of one dump file.
pub type DumpHistory = Vec<Snapshot>;

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot from a JSON document; only objects qualify
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match BeanNode::from(value) {
            BeanNode::Tree(tree) => Some(Self(tree)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.0
                .iter()
                .map(|(key, node)| (key.clone(), JsonValue::from(node)))
                .collect(),
        )
    }

    pub fn entry(&self, name: &str) -> Option<&BeanNode> {
        self.0.get(name)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn insert_entry(&mut self, name: impl Into<String>, node: BeanNode) -> Option<BeanNode> {
        self.0.insert(name.into(), node)
    }

    /// Tree of an entry, created empty when missing or not a tree
    pub fn entry_tree_mut(&mut self, name: &str) -> &mut BeanTree {
        let node = self.0.entry(name.to_string()).or_insert_with(BeanNode::tree);
        if !node.is_tree() {
            *node = BeanNode::tree();
        }
        match node {
            BeanNode::Tree(tree) => tree,
            _ => unreachable!("entry node was just made a tree"),
        }
    }

    pub fn as_tree(&self) -> &BeanTree {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BeanTree> for Snapshot {
    fn from(tree: BeanTree) -> Self {
        Self(tree)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Bean Paths - Slash-Delimited Key Chains
// ----------------------------------------------------------------------------

/// A key chain addressing a node inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeanPath {
    segments: Vec<String>,
}

impl BeanPath {
    /// Split a path on `/`, dropping one leading slash.
    ///
    /// The empty path yields a single empty segment, as does every empty
    /// component between two slashes.
    pub fn parse(path: &str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        Self {
            segments: trimmed.split('/').map(str::to_string).collect(),
        }
    }

    /// Path rooted at a snapshot: `entry[/bean]/path...`
    pub fn qualified(entry: &str, bean: Option<&str>, path: &str) -> Self {
        let mut segments = Vec::with_capacity(4);
        segments.push(entry.to_string());
        if let Some(bean) = bean {
            segments.push(bean.to_string());
        }
        segments.extend(Self::parse(path).segments);
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Display for BeanPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

// ----------------------------------------------------------------------------
// 3.4 Lookup Modes
// ----------------------------------------------------------------------------

/// How a bean path is resolved inside a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    /// Full depth-first walk; any node whose key chain equals the path is
    /// captured and the last capture in traversal order wins.
    #[default]
    Legacy,
    /// Key-by-key descent from the root; only scalar leaves match.
    Anchored,
}

impl Display for LookupMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupMode::Legacy => write!(f, "legacy"),
            LookupMode::Anchored => write!(f, "anchored"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Timestamps - Epoch Seconds to Calendar Time
// ----------------------------------------------------------------------------

/// The Unix epoch, used as the "no timestamp" sentinel on report axes.
#[inline]
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Convert epoch seconds (possibly fractional) to a calendar timestamp.
pub fn timestamp_to_datetime(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return epoch();
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1_000_000_000.0).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).unwrap_or_else(epoch)
}

/// Axis label of a timestamp, as a UTC calendar date; the epoch sentinel
/// renders as an empty label.
pub fn format_axis_label(timestamp: &DateTime<Utc>) -> String {
    if *timestamp == epoch() {
        String::new()
    } else {
        timestamp.format(AXIS_DATE_FORMAT).to_string()
    }
}

/// `count` consecutive days ending at `latest`.
pub fn generate_daily_dates(count: usize, latest: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    (0..count)
        .map(|index| latest - ChronoDuration::days((count - 1 - index) as i64))
        .collect()
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, folded into PerfdumpError. Conditions the
// tool can absorb (missing entries, 4xx Jolokia answers, non-numeric
// matches) never surface here; they are logged and replaced by defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error Type
// ----------------------------------------------------------------------------

/// Root error type for the tool
#[derive(Error, Debug)]
pub enum PerfdumpError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PerfdumpError {
    /// Check if error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            PerfdumpError::Source(e) => e.is_recoverable(),
            PerfdumpError::Store(e) => e.is_recoverable(),
            PerfdumpError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PerfdumpError::Config(_) => "config",
            PerfdumpError::Source(_) => "source",
            PerfdumpError::Store(_) => "store",
            PerfdumpError::Data(_) => "data",
            PerfdumpError::Io(_) => "io",
            PerfdumpError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Missing required section: [{section}]")]
    MissingSection { section: String },

    #[error("Missing required field '{field}' in section [{section}]")]
    MissingField { section: String, field: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn missing_field(section: impl Into<String>, field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            section: section.into(),
            field: field.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Metric Source Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request to '{url}' failed: {message}")]
    RequestFailed { url: String, message: String },

    #[error("Could not retrieve a response from '{url}' within {latency_secs} seconds, last error: {last_error}")]
    Timeout {
        url: String,
        latency_secs: u64,
        last_error: String,
    },

    #[error("Jolokia answered '{url}' with status {status}")]
    Status { url: String, status: u64 },

    #[error("Invalid response from '{url}': {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Domain '{domain}' is not listed by '{endpoint}'")]
    DomainNotListed { endpoint: String, domain: String },
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SourceError::RequestFailed { .. } | SourceError::Timeout { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// 4.4 Snapshot Store Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Dump file {path} does not exist")]
    Missing { path: PathBuf },

    #[error("Dump file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Failed to read dump file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write dump file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to serialize dump: {message}")]
    Serialization { message: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Read { .. } | StoreError::Write { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.5 Data Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Cannot summarize an empty sample set")]
    EmptySampleSet,

    #[error("Percentile {0} is outside 0..=100")]
    InvalidPercentile(u8),

    #[error("Length mismatch in '{context}': {actual} values against {expected} timestamps")]
    LengthMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Assertion failed for '{key}': {message}")]
    AssertionFailed { key: String, message: String },

    #[error("Invalid sample in {origin}: {message}")]
    InvalidSample { origin: String, message: String },
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type PerfdumpResult<T> = Result<T, PerfdumpError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type DataResult<T> = Result<T, DataError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Two documents drive the tool:
// - the runtime configuration (PerfdumpConfig), layered TOML + PERFDUMP_*
//   environment overrides through figment;
// - report configurations (ReportConfig), one TOML document per report,
//   declaring graphs and the lines they plot.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Runtime Configuration
// ----------------------------------------------------------------------------

/// Master configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfdumpConfig {
    #[serde(default)]
    pub dumper: DumperConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub report: ReportOutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PerfdumpConfig {
    /// Load configuration from a TOML file merged with `PERFDUMP_*` variables
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PERFDUMP_").split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dumper.retention == 0 {
            return Err(ConfigError::invalid_value(
                "dumper.retention",
                "must keep at least one snapshot",
            ));
        }

        if self.dumper.fetch_latency.is_zero() {
            return Err(ConfigError::invalid_value(
                "dumper.fetch_latency",
                "must be greater than zero",
            ));
        }

        if self.dumper.poll_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "dumper.poll_interval",
                "must be greater than zero",
            ));
        }

        if self.collector.interval < Duration::from_millis(MIN_COLLECT_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "collector.interval",
                format!("must be at least {}ms", MIN_COLLECT_INTERVAL_MS),
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Generate default configuration as TOML
    pub fn generate_default_config() -> ConfigResult<String> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::parse(e.to_string()))
    }
}

/// Dump file and Jolokia fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumperConfig {
    #[serde(default = "default_dump_file")]
    pub dump_file: PathBuf,

    /// Maximum number of snapshots kept in the dump
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// How long a failing request is retried
    #[serde(default = "default_fetch_latency", with = "humantime_serde")]
    pub fetch_latency: Duration,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Timeout of one HTTP attempt
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,

    #[serde(default)]
    pub lookup_mode: LookupMode,
}

fn default_dump_file() -> PathBuf { PathBuf::from(DEFAULT_DUMP_FILE) }
fn default_retention() -> usize { DEFAULT_DUMP_RETENTION }
fn default_fetch_latency() -> Duration { Duration::from_secs(DEFAULT_FETCH_LATENCY_SECS) }
fn default_poll_interval() -> Duration { Duration::from_millis(DEFAULT_POLL_INTERVAL_MS) }
fn default_http_timeout() -> Duration { Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS) }

impl Default for DumperConfig {
    fn default() -> Self {
        Self {
            dump_file: default_dump_file(),
            retention: default_retention(),
            fetch_latency: default_fetch_latency(),
            poll_interval: default_poll_interval(),
            http_timeout: default_http_timeout(),
            lookup_mode: LookupMode::default(),
        }
    }
}

/// Periodic collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Harvest targets, one per (endpoint, domain) pair
    #[serde(default)]
    pub targets: Vec<HarvestTarget>,

    #[serde(default = "default_collect_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Total collection time; runs until interrupted when unset
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub run_time: Option<Duration>,
}

fn default_collect_interval() -> Duration { Duration::from_secs(DEFAULT_COLLECT_INTERVAL_SECS) }

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            interval: default_collect_interval(),
            run_time: None,
        }
    }
}

/// Report output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutputConfig {
    #[serde(default = "default_report_folder")]
    pub folder: PathBuf,
}

fn default_report_folder() -> PathBuf { PathBuf::from(DEFAULT_REPORT_FOLDER) }

impl Default for ReportOutputConfig {
    fn default() -> Self {
        Self {
            folder: default_report_folder(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Mirror log records to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable console output
    #[serde(default = "default_true")]
    pub console: bool,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "compact".to_string() }
fn default_true() -> bool { true }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            console: true,
            ansi_colors: true,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Harvest Targets
// ----------------------------------------------------------------------------

/// A Jolokia endpoint and the domain whose beans are harvested from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestTarget {
    pub endpoint: String,
    pub domain: String,
}

impl HarvestTarget {
    pub fn new(endpoint: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            domain: domain.into(),
        }
    }
}

impl FromStr for HarvestTarget {
    type Err = ConfigError;

    /// Parse `endpoint=domain`; the endpoint itself never contains `=`
    fn from_str(pair: &str) -> ConfigResult<Self> {
        match pair.split_once('=') {
            Some((endpoint, domain)) if !endpoint.is_empty() && !domain.is_empty() => {
                Ok(Self::new(endpoint, domain))
            }
            _ => Err(ConfigError::invalid_value(
                "target",
                format!("expected 'endpoint=domain', got '{}'", pair),
            )),
        }
    }
}

impl Display for HarvestTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.endpoint, self.domain)
    }
}

// ----------------------------------------------------------------------------
// 5.3 Report Configuration - Graph Definitions
// ----------------------------------------------------------------------------

/// A validated report configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportConfig {
    /// Dump file the report reads
    pub datafile: PathBuf,
    /// Graphs in document order
    pub graphs: Vec<GraphSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSpec {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub lines: Vec<LineSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineSpec {
    pub label: String,
    pub color: String,
    /// Entry name (the `jolokiaurl` key)
    pub entry: String,
    pub mbean: String,
    pub y_coord_path: String,
    pub timestamp_path: String,
    pub precision: u32,
}

/// Line sub-table as written in the document
#[derive(Debug, Deserialize)]
struct RawLineSection {
    color: Option<String>,
    #[serde(alias = "entry")]
    jolokiaurl: Option<String>,
    mbean: Option<String>,
    #[serde(rename = "yCoordPath")]
    y_coord_path: Option<String>,
    #[serde(rename = "timestampPath")]
    timestamp_path: Option<String>,
    precision: Option<RawPrecision>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPrecision {
    Integer(i64),
    Text(String),
}

impl RawPrecision {
    fn resolve(&self, section: &str) -> ConfigResult<u32> {
        let value = match self {
            RawPrecision::Integer(value) => *value,
            RawPrecision::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                ConfigError::invalid_value(format!("{}.precision", section), format!("'{}' is not an integer", text))
            })?,
        };
        u32::try_from(value).map_err(|_| {
            ConfigError::invalid_value(format!("{}.precision", section), format!("{} is out of range", value))
        })
    }
}

/// Keys of a graph section that are not line sub-tables
const GRAPH_SCALAR_KEYS: [&str; 2] = ["description", "unit"];

impl ReportConfig {
    /// Load and validate a report configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a report configuration document
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let document: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::parse(e.to_string()))?;

        let main = document
            .get("main")
            .and_then(toml::Value::as_table)
            .ok_or_else(|| ConfigError::MissingSection {
                section: "main".to_string(),
            })?;
        let datafile = main
            .get("datafile")
            .and_then(toml::Value::as_str)
            .ok_or_else(|| ConfigError::missing_field("main", "datafile"))?;

        let mut graphs = Vec::new();
        for (name, section) in document.iter().filter(|(name, _)| name.as_str() != "main") {
            let table = section
                .as_table()
                .ok_or_else(|| ConfigError::invalid_value(name.as_str(), "expected a graph section"))?;
            graphs.push(Self::parse_graph(name, table)?);
        }

        Ok(Self {
            datafile: PathBuf::from(datafile),
            graphs,
        })
    }

    fn parse_graph(name: &str, table: &toml::Table) -> ConfigResult<GraphSpec> {
        let unit = table
            .get("unit")
            .and_then(toml::Value::as_str)
            .ok_or_else(|| ConfigError::missing_field(name, "unit"))?;
        let description = table
            .get("description")
            .and_then(toml::Value::as_str)
            .unwrap_or_default();

        let mut lines = Vec::new();
        for (label, value) in table
            .iter()
            .filter(|(key, _)| !GRAPH_SCALAR_KEYS.contains(&key.as_str()))
        {
            let section = format!("{}.{}", name, label);
            if !value.is_table() {
                return Err(ConfigError::invalid_value(section, "expected a line sub-table"));
            }
            let raw: RawLineSection = value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::parse(format!("[{}] {}", section, e)))?;
            lines.push(Self::resolve_line(&section, label, raw)?);
        }

        Ok(GraphSpec {
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
            lines,
        })
    }

    fn resolve_line(section: &str, label: &str, raw: RawLineSection) -> ConfigResult<LineSpec> {
        let precision = match &raw.precision {
            Some(precision) => precision.resolve(section)?,
            None => 0,
        };
        Ok(LineSpec {
            label: label.to_string(),
            color: raw.color.ok_or_else(|| ConfigError::missing_field(section, "color"))?,
            entry: raw.jolokiaurl.ok_or_else(|| ConfigError::missing_field(section, "jolokiaurl"))?,
            mbean: raw.mbean.ok_or_else(|| ConfigError::missing_field(section, "mbean"))?,
            y_coord_path: raw
                .y_coord_path
                .ok_or_else(|| ConfigError::missing_field(section, "yCoordPath"))?,
            timestamp_path: raw
                .timestamp_path
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_PATH.to_string()),
            precision,
        })
    }

    /// Graph by name
    pub fn graph(&self, name: &str) -> Option<&GraphSpec> {
        self.graphs.iter().find(|graph| graph.name == name)
    }
}

// ============================================================================
// SECTION 6: LOGGING & DIAGNOSTICS
// ============================================================================
// Process-wide logging goes through tracing. Core components additionally
// receive an explicit Diagnostics sink in their constructor, so embedding
// code and tests can observe recoverable conditions without a subscriber.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logging Initialization
// ----------------------------------------------------------------------------

/// Map a textual level to a filter
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Initialize the logging system.
///
/// Returns the guard of the non-blocking file writer when `logging.file` is
/// set; records are only flushed while the guard is alive.
pub fn init_logging(config: &LoggingConfig) -> PerfdumpResult<Option<WorkerGuard>> {
    let level = parse_level(&config.level).unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console {
        let console = match config.format.as_str() {
            "json" => tracing_fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_target(true)
                .boxed(),
            "pretty" => tracing_fmt::layer()
                .pretty()
                .with_writer(io::stderr)
                .with_ansi(config.ansi_colors)
                .boxed(),
            _ => tracing_fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_ansi(config.ansi_colors)
                .with_target(true)
                .boxed(),
        };
        layers.push(console);
    }

    let guard = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                PerfdumpError::Config(ConfigError::invalid_value(
                    "logging.file",
                    format!("'{}' has no file name", path.display()),
                ))
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                tracing_fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| PerfdumpError::Internal(format!("Failed to set global subscriber: {}", e)))?;

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 6.2 Diagnostics Sink
// ----------------------------------------------------------------------------

/// Receiver of the diagnostics core components emit.
pub trait Diagnostics: Send + Sync + Debug {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards diagnostics to tracing, tagged with the emitting component.
#[derive(Debug, Clone)]
pub struct TracingDiagnostics {
    component: &'static str,
}

impl TracingDiagnostics {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Shared sink for a component
    pub fn shared(component: &'static str) -> Arc<dyn Diagnostics> {
        Arc::new(Self::new(component))
    }
}

impl Diagnostics for TracingDiagnostics {
    fn debug(&self, message: &str) {
        debug!(target: "perfdump", component = self.component, "{}", message);
    }

    fn info(&self, message: &str) {
        info!(target: "perfdump", component = self.component, "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(target: "perfdump", component = self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "perfdump", component = self.component, "{}", message);
    }
}

/// Discards every diagnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiagnostics;

impl NullDiagnostics {
    pub fn shared() -> Arc<dyn Diagnostics> {
        Arc::new(Self)
    }
}

impl Diagnostics for NullDiagnostics {
    fn debug(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// Performance timer for measuring harvest and assembly durations
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        if let Some(threshold) = self.threshold_ms {
            if elapsed.as_millis() > u128::from(threshold) {
                warn!(
                    target: "perfdump::perf",
                    timer = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
                return elapsed;
            }
        }

        trace!(
            target: "perfdump::perf",
            timer = self.name,
            elapsed_us = elapsed.as_micros() as u64,
            "Timer stopped"
        );
        elapsed
    }
}

// ============================================================================
// SECTION 7: METRIC SOURCE - JOLOKIA
// ============================================================================
// Jolokia exposes JMX over HTTP:
//   GET <endpoint>/list                  → {"value": {<domain>: {<key>: ..}}}
//   GET <endpoint>/read/<bean>[/attr]... → {"request":..,"value":..,"status":..,"timestamp":..}
// Every request is retried until the fetch latency elapses; the JSON status
// field decides whether an answered request counts as a failure.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metric Source Trait
// ----------------------------------------------------------------------------

/// Provider of bean listings and bean reads.
#[async_trait]
pub trait MetricSource: Send + Sync + Debug {
    /// Attribute keys of every bean registered under `domain`
    async fn list(&self, endpoint: &str, domain: &str) -> SourceResult<Vec<String>>;

    /// Full read response of one bean, optionally narrowed to an attribute
    /// and a path inside it
    async fn read(
        &self,
        endpoint: &str,
        bean: &str,
        attribute: Option<&str>,
        inner_path: Option<&str>,
    ) -> SourceResult<BeanNode>;
}

// ----------------------------------------------------------------------------
// 7.2 Request URLs
// ----------------------------------------------------------------------------

/// Escape a bean name for use as a Jolokia URL path component.
pub fn escape_bean_name(bean: &str) -> String {
    let mut escaped = String::with_capacity(bean.len() + 8);
    for ch in bean.chars() {
        match ch {
            '!' => escaped.push_str("!!"),
            '/' => escaped.push_str("!/"),
            '(' => escaped.push_str("!("),
            '[' => escaped.push_str("%5B"),
            ']' => escaped.push_str("%5D"),
            ' ' => escaped.push_str("%20"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn list_url(endpoint: &str) -> String {
    format!("{}/list", endpoint.trim_end_matches('/'))
}

pub fn read_url(endpoint: &str, bean: &str, attribute: Option<&str>, inner_path: Option<&str>) -> String {
    let mut url = format!("{}/read/{}", endpoint.trim_end_matches('/'), escape_bean_name(bean));
    for part in [attribute, inner_path].into_iter().flatten() {
        url.push('/');
        url.push_str(part);
    }
    url.push_str("?ignoreErrors=true");
    url
}

// ----------------------------------------------------------------------------
// 7.3 Jolokia Client
// ----------------------------------------------------------------------------

/// HTTP client for Jolokia agents.
#[derive(Debug, Clone)]
pub struct JolokiaClient {
    client: HttpClient,
    latency: Duration,
    poll_interval: Duration,
    diagnostics: Arc<dyn Diagnostics>,
}

impl JolokiaClient {
    pub fn new(config: &DumperConfig, diagnostics: Arc<dyn Diagnostics>) -> SourceResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| SourceError::RequestFailed {
                url: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            latency: config.fetch_latency,
            poll_interval: config.poll_interval,
            diagnostics,
        })
    }

    pub fn with_latency(mut self, latency: Duration, poll_interval: Duration) -> Self {
        self.latency = latency;
        self.poll_interval = poll_interval;
        self
    }

    /// Fetch a Jolokia document, retrying until the latency deadline passes
    async fn request(&self, url: &str) -> SourceResult<JsonValue> {
        debug!(target: "perfdump::source", url = %url, "Requesting jolokia");
        let deadline = Instant::now() + self.latency;

        let body = loop {
            match self.fetch_once(url).await {
                Ok(body) => break body,
                Err(last_error) => {
                    if Instant::now() >= deadline {
                        let error = SourceError::Timeout {
                            url: url.to_string(),
                            latency_secs: self.latency.as_secs(),
                            last_error,
                        };
                        self.diagnostics.error(&error.to_string());
                        return Err(error);
                    }
                    trace!(target: "perfdump::source", url = %url, error = %last_error, "Retrying request");
                    sleep(self.poll_interval).await;
                }
            }
        };

        let document: JsonValue = serde_json::from_str(&body).map_err(|e| SourceError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = document
            .get("status")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| SourceError::InvalidResponse {
                url: url.to_string(),
                message: "response carries no status".to_string(),
            })?;

        match status {
            JOLOKIA_STATUS_OK => {}
            JOLOKIA_STATUS_BAD_REQUEST | JOLOKIA_STATUS_NOT_FOUND => {
                self.diagnostics.warn(&format!(
                    "Request '{}' returned status {}: {}",
                    url,
                    status,
                    document.get("error").and_then(JsonValue::as_str).unwrap_or("no error message")
                ));
            }
            _ => {
                let error = SourceError::Status {
                    url: url.to_string(),
                    status,
                };
                self.diagnostics.error(&error.to_string());
                return Err(error);
            }
        }

        Ok(document)
    }

    /// One HTTP attempt; any failure is reported as text for the retry loop
    async fn fetch_once(&self, url: &str) -> Result<String, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let response = response.error_for_status().map_err(|e| e.to_string())?;
        response.text().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MetricSource for JolokiaClient {
    async fn list(&self, endpoint: &str, domain: &str) -> SourceResult<Vec<String>> {
        let url = list_url(endpoint);
        let document = self.request(&url).await?;
        let beans = document
            .get("value")
            .and_then(|value| value.get(domain))
            .and_then(JsonValue::as_object)
            .ok_or_else(|| SourceError::DomainNotListed {
                endpoint: endpoint.to_string(),
                domain: domain.to_string(),
            })?;
        Ok(beans.keys().cloned().collect())
    }

    async fn read(
        &self,
        endpoint: &str,
        bean: &str,
        attribute: Option<&str>,
        inner_path: Option<&str>,
    ) -> SourceResult<BeanNode> {
        let url = read_url(endpoint, bean, attribute, inner_path);
        let document = self.request(&url).await?;
        Ok(BeanNode::from(document))
    }
}

// ----------------------------------------------------------------------------
// 7.4 MBean Harvester
// ----------------------------------------------------------------------------

/// Builds one snapshot by reading every bean of each target's domain.
#[derive(Debug)]
pub struct MBeanHarvester<'a> {
    source: &'a dyn MetricSource,
    diagnostics: Arc<dyn Diagnostics>,
}

impl<'a> MBeanHarvester<'a> {
    pub fn new(source: &'a dyn MetricSource, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self { source, diagnostics }
    }

    /// Snapshot shaped `{<domain>: {<bean key>: <read response>}}`
    pub async fn harvest(&self, targets: &[HarvestTarget]) -> SourceResult<Snapshot> {
        let timer = PerfTimer::with_threshold("harvest", HARVEST_WARN_THRESHOLD_MS);
        let mut snapshot = Snapshot::new();

        for target in targets {
            self.diagnostics
                .info(&format!("Requesting jolokia with url {}", target.endpoint));
            let keys = self.source.list(&target.endpoint, &target.domain).await?;
            let tree = snapshot.entry_tree_mut(&target.domain);
            for key in keys {
                let bean = format!("{}:{}", target.domain, key);
                let response = self.source.read(&target.endpoint, &bean, None, None).await?;
                tree.insert(key, response);
            }
        }

        let elapsed = timer.stop();
        debug!(
            target: "perfdump::source",
            targets = targets.len(),
            entries = snapshot.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Harvest complete"
        );
        Ok(snapshot)
    }
}

// ============================================================================
// SECTION 8: SNAPSHOT STORE
// ============================================================================
// The dump file holds one JSON array of snapshots, oldest first. Every
// append rewrites the whole document: the retained tail plus the new
// snapshot goes to a sibling temporary file which is then renamed over the
// dump, so readers never observe a half-written document.
// ============================================================================

/// Rolling, size-bounded history persisted as a JSON document.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    retention: usize,
    strict: bool,
    indent: usize,
    diagnostics: Arc<dyn Diagnostics>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            path: path.into(),
            retention: DEFAULT_DUMP_RETENTION,
            strict: false,
            indent: DUMP_INDENT,
            diagnostics,
        }
    }

    /// Maximum number of snapshots held after an append (at least one)
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Treat a missing dump file as an error instead of an empty history
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_indent(mut self, spaces: usize) -> Self {
        self.indent = spaces;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Read the whole history
    pub fn load(&self) -> StoreResult<DumpHistory> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.strict {
                    self.diagnostics
                        .error(&format!("Dump file {} does not exist", self.path.display()));
                    return Err(StoreError::Missing {
                        path: self.path.clone(),
                    });
                }
                self.diagnostics.info(&format!(
                    "Dump file {} does not exist, starting a new history",
                    self.path.display()
                ));
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let history = parse_history(&content).map_err(|message| StoreError::Corrupt {
            path: self.path.clone(),
            message,
        })?;
        debug!(
            target: "perfdump::store",
            path = %self.path.display(),
            snapshots = history.len(),
            "Loaded dump"
        );
        Ok(history)
    }

    /// Re-read the history from disk
    pub fn reload(&self) -> StoreResult<DumpHistory> {
        self.load()
    }

    /// Replace the dump document with `history`
    pub fn persist(&self, history: &[Snapshot]) -> StoreResult<()> {
        let indent = " ".repeat(self.indent);
        let mut buffer = Vec::with_capacity(4096);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        history
            .serialize(&mut serializer)
            .map_err(|e| StoreError::Serialization {
                message: e.to_string(),
            })?;

        let staging = self.staging_path();
        fs::write(&staging, &buffer).map_err(|source| StoreError::Write {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            target: "perfdump::store",
            path = %self.path.display(),
            snapshots = history.len(),
            bytes = buffer.len(),
            "Persisted dump"
        );
        Ok(())
    }

    /// Append a snapshot, dropping the oldest ones beyond retention.
    /// Returns the number of snapshots now held.
    pub fn append(&self, snapshot: Snapshot) -> StoreResult<usize> {
        let history = self.load()?;
        self.append_to(history, snapshot)
    }

    /// Harvest a fresh snapshot and append it
    pub async fn append_harvest(
        &self,
        source: &dyn MetricSource,
        targets: &[HarvestTarget],
    ) -> PerfdumpResult<usize> {
        let history = self.load()?;
        let snapshot = MBeanHarvester::new(source, self.diagnostics.clone())
            .harvest(targets)
            .await?;
        Ok(self.append_to(history, snapshot)?)
    }

    fn append_to(&self, history: DumpHistory, snapshot: Snapshot) -> StoreResult<usize> {
        let mut history = truncate_history(history, self.retention - 1);
        history.push(snapshot);
        self.persist(&history)?;
        info!(
            target: "perfdump::store",
            path = %self.path.display(),
            snapshots = history.len(),
            "Appended snapshot"
        );
        Ok(history.len())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "dump".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Keep the most recent `keep` snapshots
pub fn truncate_history(mut history: DumpHistory, keep: usize) -> DumpHistory {
    if history.len() > keep {
        let excess = history.len() - keep;
        history.drain(..excess);
    }
    history
}

/// Parse a dump document; whitespace-only content is an empty history
pub fn parse_history(content: &str) -> Result<DumpHistory, String> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<JsonValue>(content).map_err(|e| e.to_string())? {
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                Snapshot::from_json(item)
                    .ok_or_else(|| format!("element {} is not a snapshot object", index))
            })
            .collect(),
        _ => Err("expected a JSON array of snapshots".to_string()),
    }
}

// ============================================================================
// SECTION 9: PATH EXTRACTOR
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Lookup Functions
// ----------------------------------------------------------------------------

/// Depth-first lookup over a snapshot tree.
///
/// Every key whose chain from the root equals `target` is captured, whatever
/// the kind of its node, and not descended into; every other tree child is
/// searched. The last capture in traversal order is returned.
pub fn find_legacy<'a>(tree: &'a BeanTree, target: &[String]) -> Option<&'a BeanNode> {
    let mut prefix = Vec::with_capacity(target.len());
    walk_legacy(tree, target, &mut prefix)
}

fn walk_legacy<'a>(
    tree: &'a BeanTree,
    target: &[String],
    prefix: &mut Vec<&'a str>,
) -> Option<&'a BeanNode> {
    let mut found = None;
    for (key, node) in tree {
        prefix.push(key.as_str());
        if chain_equals(prefix, target) {
            found = Some(node);
        } else if let BeanNode::Tree(child) = node {
            if let Some(deeper) = walk_legacy(child, target, prefix) {
                found = Some(deeper);
            }
        }
        prefix.pop();
    }
    found
}

fn chain_equals(prefix: &[&str], target: &[String]) -> bool {
    prefix.len() == target.len() && prefix.iter().zip(target).all(|(a, b)| *a == b.as_str())
}

/// Key-by-key descent from the root; only scalar leaves match.
pub fn find_anchored<'a>(tree: &'a BeanTree, target: &[String]) -> Option<&'a BeanNode> {
    let (leaf, parents) = target.split_last()?;
    let mut current = tree;
    for segment in parents {
        current = current.get(segment.as_str())?.as_tree()?;
    }
    current.get(leaf.as_str()).filter(|node| node.is_scalar())
}

/// Truncate every value toward zero when `precision` is 0
pub fn apply_precision(values: Vec<f64>, precision: u32) -> Vec<f64> {
    if precision > 0 {
        return values;
    }
    values
        .into_iter()
        .map(|value| {
            let truncated = value.trunc();
            if truncated == 0.0 { 0.0 } else { truncated }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 9.2 Extractor
// ----------------------------------------------------------------------------

/// Turns a path into one numeric value per snapshot.
#[derive(Debug, Clone)]
pub struct PathExtractor {
    mode: LookupMode,
    diagnostics: Arc<dyn Diagnostics>,
}

impl PathExtractor {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            mode: LookupMode::default(),
            diagnostics,
        }
    }

    pub fn with_mode(mut self, mode: LookupMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> LookupMode {
        self.mode
    }

    pub fn lookup<'a>(&self, tree: &'a BeanTree, target: &BeanPath) -> Option<&'a BeanNode> {
        match self.mode {
            LookupMode::Legacy => find_legacy(tree, target.segments()),
            LookupMode::Anchored => find_anchored(tree, target.segments()),
        }
    }

    /// Raw matched node per snapshot
    pub fn extract_nodes<'a>(
        &self,
        history: &'a [Snapshot],
        entry: &str,
        bean: Option<&str>,
        path: &str,
    ) -> Vec<Option<&'a BeanNode>> {
        self.check_entry_presence(history, entry);
        let target = BeanPath::qualified(entry, bean, path);
        history
            .iter()
            .map(|snapshot| self.lookup(snapshot.as_tree(), &target))
            .collect()
    }

    /// Numeric value per snapshot; zero where the path is absent
    pub fn extract(&self, history: &[Snapshot], entry: &str, bean: Option<&str>, path: &str) -> Vec<f64> {
        let values: Vec<f64> = self
            .extract_nodes(history, entry, bean, path)
            .into_iter()
            .map(|node| match node {
                None => 0.0,
                Some(node) => node.as_f64().unwrap_or_else(|| {
                    self.diagnostics.warn(&format!(
                        "Value at '{}' in entry '{}' is not numeric ({}), using 0",
                        path, entry, node
                    ));
                    0.0
                }),
            })
            .collect();
        trace!(target: "perfdump::extract", entry = %entry, path = %path, values = values.len(), "Extracted series");
        values
    }

    fn check_entry_presence(&self, history: &[Snapshot], entry: &str) {
        if history.is_empty() {
            self.diagnostics.warn("No snapshots in dump");
            return;
        }
        let known: BTreeSet<&str> = history.iter().flat_map(Snapshot::entry_names).collect();
        if !known.contains(entry) {
            self.diagnostics
                .warn(&format!("Entry '{}' not found in any snapshot of the dump", entry));
        }
    }
}

// ============================================================================
// SECTION 10: STATISTICS ENGINE
// ============================================================================

/// Descriptive statistics of one sample batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsResult {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    #[serde(rename = "standard-deviation")]
    pub standard_deviation: f64,
    pub percentiles: BTreeMap<u8, f64>,
}

/// Summarize a non-empty sample batch
pub fn summarize(samples: &[f64], percentiles: Option<&[u8]>) -> DataResult<StatisticsResult> {
    if samples.is_empty() {
        return Err(DataError::EmptySampleSet);
    }

    let count = samples.len() as f64;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / count;
    let variance = samples.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;

    let mut table = BTreeMap::new();
    if let Some(requested) = percentiles {
        if let Some(&invalid) = requested.iter().find(|&&percentile| percentile > 100) {
            return Err(DataError::InvalidPercentile(invalid));
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by_key(|value| OrderedFloat(*value));
        for &percentile in requested {
            if let Some(value) = nearest_rank(&sorted, percentile) {
                table.insert(percentile, value);
            }
        }
    }

    Ok(StatisticsResult {
        samples: samples.len(),
        min,
        max,
        mean,
        standard_deviation: variance.sqrt(),
        percentiles: table,
    })
}

/// Nearest-rank percentile of an ascending slice; `None` when it is empty.
///
/// The index is `trunc(p / 100 * N - 1)`; negative indices count from the
/// end, so `p = 0` selects the maximum. Indices past the end clamp to it.
pub fn nearest_rank(sorted: &[f64], percentile: u8) -> Option<f64> {
    let len = sorted.len();
    if len == 0 {
        return None;
    }
    let position = ((f64::from(percentile) / 100.0) * len as f64 - 1.0).trunc() as isize;
    let index = if position < 0 {
        (len as isize + position).max(0) as usize
    } else {
        (position as usize).min(len - 1)
    };
    sorted.get(index).copied()
}

// ============================================================================
// SECTION 11: SERIES ALIGNER
// ============================================================================
// Lines of one graph share a single timestamp axis. The first line's
// timestamps are the baseline; a later line only fills baseline slots that
// are still zero, so the first non-zero contributor of a slot wins.
// ============================================================================

/// Values and timestamps of one line before alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    pub label: String,
    pub values: Vec<f64>,
    pub timestamps: Vec<f64>,
}

/// Lines sharing one merged timestamp axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    /// Merged axis in epoch seconds
    pub axis: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub lines: Vec<(String, Vec<f64>)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesAligner;

impl SeriesAligner {
    /// Fill the zero slots of `baseline` from `contributor`.
    /// An empty baseline adopts the contributor.
    pub fn merge_slots(baseline: &mut Vec<f64>, contributor: &[f64], context: &str) -> DataResult<()> {
        if baseline.is_empty() {
            baseline.extend_from_slice(contributor);
            return Ok(());
        }
        if contributor.len() > baseline.len() {
            return Err(DataError::LengthMismatch {
                context: context.to_string(),
                expected: baseline.len(),
                actual: contributor.len(),
            });
        }
        for (slot, value) in baseline.iter_mut().zip(contributor) {
            if *slot == 0.0 {
                *slot = *value;
            }
        }
        Ok(())
    }

    /// Merge the timestamp lists of `lines`, in declaration order
    pub fn align(lines: Vec<RawSeries>) -> DataResult<AlignedSeries> {
        let mut axis = Vec::new();
        for line in &lines {
            Self::merge_slots(&mut axis, &line.timestamps, &line.label)?;
        }
        let timestamps = axis.iter().map(|secs| timestamp_to_datetime(*secs)).collect();
        Ok(AlignedSeries {
            axis,
            timestamps,
            lines: lines.into_iter().map(|line| (line.label, line.values)).collect(),
        })
    }
}

// ============================================================================
// SECTION 12: GRAPHS & GRAPH ASSEMBLER
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Graph Model
// ----------------------------------------------------------------------------

/// One named numeric series plus its display metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Line {
    pub color: String,
    pub label: String,
    pub values: Vec<f64>,
    /// Decimals shown in the legend; 0 also means integer values
    pub precision: u32,
}

impl Line {
    pub fn new(color: impl Into<String>, label: impl Into<String>, values: Vec<f64>, precision: u32) -> Self {
        Self {
            color: color.into(),
            label: label.into(),
            values,
            precision,
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Latest value formatted with the line's precision
    pub fn legend_value(&self) -> Option<String> {
        self.last_value()
            .map(|value| format!("{:.*}", self.precision as usize, value))
    }
}

/// Lines plotted over one shared timestamp axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Graph {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub timestamps: Vec<DateTime<Utc>>,
    pub lines: Vec<Line>,
}

impl Graph {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
        timestamps: Vec<DateTime<Utc>>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unit: unit.into(),
            timestamps,
            lines: Vec::new(),
        }
    }

    pub fn with_lines(mut self, lines: Vec<Line>) -> Self {
        self.lines = lines;
        self
    }

    /// Every line must have exactly one value per timestamp
    pub fn validate(&self) -> DataResult<()> {
        for line in &self.lines {
            if line.values.len() != self.timestamps.len() {
                return Err(DataError::LengthMismatch {
                    context: format!("{}/{}", self.name, line.label),
                    expected: self.timestamps.len(),
                    actual: line.values.len(),
                });
            }
        }
        Ok(())
    }

    pub fn axis_labels(&self) -> Vec<String> {
        self.timestamps.iter().map(format_axis_label).collect()
    }

    /// Line colors taken from `palette` in line order
    pub fn recolor(&mut self, palette: &[&str]) {
        if palette.is_empty() {
            return;
        }
        for (index, line) in self.lines.iter_mut().enumerate() {
            line.color = palette[index % palette.len()].to_string();
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Graph Assembler
// ----------------------------------------------------------------------------

/// Builds graphs from a report configuration and a dump history.
#[derive(Debug, Clone)]
pub struct GraphAssembler {
    extractor: PathExtractor,
    diagnostics: Arc<dyn Diagnostics>,
}

impl GraphAssembler {
    pub fn new(extractor: PathExtractor, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self { extractor, diagnostics }
    }

    /// All graphs of `config`, in document order
    pub fn assemble(&self, config: &ReportConfig, history: &[Snapshot]) -> DataResult<Vec<Graph>> {
        let timer = PerfTimer::new("assemble");
        let graphs = config
            .graphs
            .iter()
            .map(|spec| self.assemble_graph(spec, history))
            .collect::<DataResult<Vec<_>>>()?;
        timer.stop();
        Ok(graphs)
    }

    /// Load the configured dump and assemble every graph
    pub fn assemble_from_store(&self, config: &ReportConfig) -> PerfdumpResult<Vec<Graph>> {
        let store = SnapshotStore::new(&config.datafile, self.diagnostics.clone());
        let history = store.load()?;
        Ok(self.assemble(config, &history)?)
    }

    pub fn assemble_graph(&self, spec: &GraphSpec, history: &[Snapshot]) -> DataResult<Graph> {
        debug!(target: "perfdump::graph", graph = %spec.name, lines = spec.lines.len(), "Assembling graph");
        let raw = spec
            .lines
            .iter()
            .map(|line| {
                let values = self
                    .extractor
                    .extract(history, &line.entry, Some(&line.mbean), &line.y_coord_path);
                let timestamps = self
                    .extractor
                    .extract(history, &line.entry, Some(&line.mbean), &line.timestamp_path);
                RawSeries {
                    label: line.label.clone(),
                    values: apply_precision(values, line.precision),
                    timestamps,
                }
            })
            .collect();

        let aligned = SeriesAligner::align(raw)?;
        let lines = spec
            .lines
            .iter()
            .zip(aligned.lines)
            .map(|(line, (label, values))| Line::new(line.color.clone(), label, values, line.precision))
            .collect();

        let graph = Graph::new(&spec.name, &spec.description, &spec.unit, aligned.timestamps).with_lines(lines);
        graph.validate()?;
        Ok(graph)
    }
}

// ============================================================================
// SECTION 13: AUTO GRAPH BUILDER
// ============================================================================
// Raw dumps can be plotted without a report configuration: every Jolokia
// read response (a tree carrying a "value" key) is an mbean series, its
// counter-like attributes become a "Count-*" graph and its latency-like
// attributes a "Timings-*" graph.
// ============================================================================

/// Attribute history of one mbean across a dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MBeanSeries {
    pub name: String,
    pub clean_name: String,
    pub timestamps: Vec<f64>,
    pub attributes: IndexMap<String, Vec<BeanNode>>,
}

impl MBeanSeries {
    fn has_digit_values(values: &[BeanNode]) -> bool {
        values.iter().any(BeanNode::is_digit_like)
    }

    fn axis(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.iter().map(|secs| timestamp_to_datetime(*secs)).collect()
    }
}

/// Label of a timing attribute, if it is one
fn timing_label(key: &str) -> Option<&'static str> {
    if key.contains("50th") {
        Some("50th percentile")
    } else if key.contains("75th") {
        Some("75th percentile")
    } else if key.contains("95th") {
        Some("95th percentile")
    } else if key.contains("99th") && !key.contains("999th") {
        Some("99th percentile")
    } else if key.contains("median") {
        Some("50th percentile")
    } else if key == "avgTimePerRequest" || key == "Mean" {
        Some("Mean")
    } else if key == "Min" {
        Some("Min")
    } else if key == "Max" {
        Some("Max")
    } else {
        None
    }
}

fn is_count_attribute(key: &str) -> bool {
    key.contains("Count") || key.contains("requests")
}

/// Collects mbean series from dumps and turns them into graphs.
#[derive(Debug)]
pub struct AutoGraphBuilder {
    mbeans: IndexMap<String, MBeanSeries>,
    clean_name: Regex,
    diagnostics: Arc<dyn Diagnostics>,
}

impl AutoGraphBuilder {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> PerfdumpResult<Self> {
        let clean_name = Regex::new(r"(.+=[\w\.]+)")
            .map_err(|e| PerfdumpError::Internal(format!("Invalid mbean name pattern: {}", e)))?;
        Ok(Self {
            mbeans: IndexMap::new(),
            clean_name,
            diagnostics,
        })
    }

    /// Collect every read response of every snapshot
    pub fn ingest(&mut self, history: &[Snapshot]) {
        for snapshot in history {
            self.collect(snapshot.as_tree());
        }
    }

    pub fn mbeans(&self) -> impl Iterator<Item = &MBeanSeries> {
        self.mbeans.values()
    }

    fn collect(&mut self, tree: &BeanTree) {
        if tree.contains_key("value") {
            self.record(tree);
            return;
        }
        for node in tree.values() {
            if let BeanNode::Tree(child) = node {
                self.collect(child);
            }
        }
    }

    fn record(&mut self, response: &BeanTree) {
        let Some(name) = response
            .get("request")
            .and_then(|request| request.get("mbean"))
            .and_then(BeanNode::as_str)
        else {
            self.diagnostics.debug("Skipping read response without request.mbean");
            return;
        };
        let Some(values) = response.get("value").and_then(BeanNode::as_tree) else {
            self.diagnostics
                .debug(&format!("Skipping mbean '{}': value is not an attribute map", name));
            return;
        };

        let clean_name = self.clean_mbean_name(name);
        let series = self
            .mbeans
            .entry(name.to_string())
            .or_insert_with(|| MBeanSeries {
                name: name.to_string(),
                clean_name,
                ..MBeanSeries::default()
            });
        series.timestamps.push(
            response
                .get("timestamp")
                .and_then(BeanNode::as_f64)
                .unwrap_or(0.0),
        );
        for (key, value) in values {
            series
                .attributes
                .entry(key.clone())
                .or_default()
                .push(value.clone());
        }
    }

    /// `domain:key=value,...` up to the last `=value`, with `/` and `:` as `-`
    fn clean_mbean_name(&self, name: &str) -> String {
        let base = self
            .clean_name
            .captures(name)
            .and_then(|captures| captures.get(1))
            .map_or(name, |m| m.as_str());
        base.replace(['/', ':'], "-")
    }

    fn numeric_line(label: &str, values: &[BeanNode], precision: u32) -> Line {
        let numbers = values.iter().map(|value| value.as_f64().unwrap_or(0.0)).collect();
        Line::new("", label, apply_precision(numbers, precision), precision)
    }

    /// One "Count-*" graph per mbean with digit-valued counter attributes
    pub fn count_graphs(&self) -> Vec<Graph> {
        self.mbeans
            .values()
            .filter_map(|mbean| {
                let lines: Vec<Line> = mbean
                    .attributes
                    .iter()
                    .filter(|(key, values)| is_count_attribute(key) && MBeanSeries::has_digit_values(values))
                    .map(|(_, values)| Self::numeric_line("Count", values, 0))
                    .collect();
                if lines.is_empty() {
                    return None;
                }
                let mut graph = Graph::new(format!("Count-{}", mbean.clean_name), "counts", "milliseconds", mbean.axis())
                    .with_lines(lines);
                graph.recolor(&AUTO_LINE_COLORS[..AUTO_LINE_COLORS.len() - 1]);
                Some(graph)
            })
            .collect()
    }

    /// One "Timings-*" graph per mbean with digit-valued latency attributes
    pub fn timing_graphs(&self) -> Vec<Graph> {
        self.mbeans
            .values()
            .filter_map(|mbean| {
                let mut lines: Vec<Line> = mbean
                    .attributes
                    .iter()
                    .filter(|(_, values)| MBeanSeries::has_digit_values(values))
                    .filter_map(|(key, values)| timing_label(key).map(|label| Self::numeric_line(label, values, 2)))
                    .collect();
                if lines.is_empty() {
                    return None;
                }
                lines.sort_by(|a, b| a.label.cmp(&b.label));
                let mut graph = Graph::new(format!("Timings-{}", mbean.clean_name), "timings", "milliseconds", mbean.axis())
                    .with_lines(lines);
                graph.recolor(&AUTO_LINE_COLORS[..AUTO_LINE_COLORS.len() - 1]);
                Some(graph)
            })
            .collect()
    }

    /// Count and timing graphs sorted by name; graphs whose lines do not
    /// cover the timestamp axis are skipped
    pub fn build(&self) -> Vec<Graph> {
        let mut graphs: Vec<Graph> = self
            .count_graphs()
            .into_iter()
            .chain(self.timing_graphs())
            .filter(|graph| match graph.validate() {
                Ok(()) => true,
                Err(e) => {
                    self.diagnostics.warn(&format!("Skipping graph '{}': {}", graph.name, e));
                    false
                }
            })
            .collect();
        graphs.sort_by(|a, b| a.name.cmp(&b.name));

        if graphs.is_empty() {
            self.diagnostics
                .warn("No graphs to plot, all values are 0 or no digit-valued attributes were found");
        }
        graphs
    }
}

// ============================================================================
// SECTION 14: JTL RESULTS
// ============================================================================
// JMeter writes one <httpSample t=".." lt=".."/> per request directly under
// <testResults>; nested httpSamples are sub-results of a parent request and
// are not counted. Each run is summarized once (elapsed time and latency)
// and the summary is appended to a dump of its own.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 JTL Parsing
// ----------------------------------------------------------------------------

/// Elapsed time and latency of one request, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JtlSample {
    pub elapsed: f64,
    pub latency: f64,
}

/// Samples of the `httpSample` elements directly under `<testResults>`
pub fn parse_jtl(content: &str, origin: &str) -> PerfdumpResult<Vec<JtlSample>> {
    let document = roxmltree::Document::parse(content).map_err(|e| DataError::InvalidSample {
        origin: origin.to_string(),
        message: format!("malformed JTL document: {}", e),
    })?;

    let root = document.root_element();
    if !root.has_tag_name("testResults") {
        debug!(target: "perfdump::jtl", origin = %origin, root = root.tag_name().name(), "No testResults root");
        return Ok(Vec::new());
    }

    let samples = root
        .children()
        .filter(|node| node.is_element() && node.has_tag_name("httpSample"))
        .map(|node| {
            Ok(JtlSample {
                elapsed: sample_attribute(node.attribute("t"), "t", origin)?,
                latency: sample_attribute(node.attribute("lt"), "lt", origin)?,
            })
        })
        .collect::<DataResult<Vec<_>>>()?;

    debug!(target: "perfdump::jtl", origin = %origin, samples = samples.len(), "Parsed JTL document");
    Ok(samples)
}

fn sample_attribute(raw: Option<&str>, name: &str, origin: &str) -> DataResult<f64> {
    let raw = raw.ok_or_else(|| DataError::InvalidSample {
        origin: origin.to_string(),
        message: format!("httpSample without '{}' attribute", name),
    })?;
    raw.trim()
        .parse::<i64>()
        .map(|value| value as f64)
        .map_err(|_| DataError::InvalidSample {
            origin: origin.to_string(),
            message: format!("attribute '{}' is not an integer: '{}'", name, raw),
        })
}

/// Read and parse a JTL file
pub fn read_jtl_file(path: &Path) -> PerfdumpResult<Vec<JtlSample>> {
    let content = fs::read_to_string(path)?;
    parse_jtl(&content, &path.display().to_string())
}

// ----------------------------------------------------------------------------
// 14.2 JTL Summaries
// ----------------------------------------------------------------------------

/// Statistics of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JtlSummary {
    pub time: StatisticsResult,
    pub latency: StatisticsResult,
}

impl JtlSummary {
    pub fn from_samples(samples: &[JtlSample]) -> DataResult<Self> {
        let elapsed: Vec<f64> = samples.iter().map(|sample| sample.elapsed).collect();
        let latency: Vec<f64> = samples.iter().map(|sample| sample.latency).collect();
        Ok(Self {
            time: summarize(&elapsed, Some(&JTL_PERCENTILES[..]))?,
            latency: summarize(&latency, Some(&JTL_PERCENTILES[..]))?,
        })
    }

    pub fn to_snapshot(&self) -> StoreResult<Snapshot> {
        let value = serde_json::to_value(self).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        Snapshot::from_json(value).ok_or_else(|| StoreError::Serialization {
            message: "summary did not serialize to an object".to_string(),
        })
    }
}

/// Appends JTL summaries to a dump holding the most recent runs.
#[derive(Debug, Clone)]
pub struct JtlResultDumper {
    store: SnapshotStore,
}

impl JtlResultDumper {
    pub fn new(dump_file: impl Into<PathBuf>, strict: bool, diagnostics: Arc<dyn Diagnostics>) -> Self {
        let store = SnapshotStore::new(dump_file, diagnostics)
            .with_retention(JTL_HISTORY_KEEP + 1)
            .with_indent(JTL_DUMP_INDENT)
            .strict(strict);
        Self { store }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Summarize `samples` and append the summary; returns the dump size
    pub fn append_samples(&self, samples: &[JtlSample]) -> PerfdumpResult<usize> {
        let history = self.store.load()?;
        let snapshot = JtlSummary::from_samples(samples)?.to_snapshot()?;
        let mut history = truncate_history(history, JTL_HISTORY_KEEP);
        history.push(snapshot);
        self.store.persist(&history)?;
        info!(
            target: "perfdump::jtl",
            path = %self.store.path().display(),
            samples = samples.len(),
            summaries = history.len(),
            "Appended JTL summary"
        );
        Ok(history.len())
    }

    pub fn append_jtl_file(&self, jtl_file: &Path) -> PerfdumpResult<usize> {
        let samples = read_jtl_file(jtl_file)?;
        self.append_samples(&samples)
    }
}

// ----------------------------------------------------------------------------
// 14.3 JTL Report
// ----------------------------------------------------------------------------

/// One statistic family of a summary dump, column by column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlicedDump {
    pub samples: Vec<f64>,
    /// Column name → value per summary (`min`, `max`, `10_percentile`, ...)
    pub series: IndexMap<String, Vec<f64>>,
}

/// Slice the `key` statistics (`time` or `latency`) out of a summary dump.
/// Columns follow the field order of the first summary.
pub fn slice_dump(history: &[Snapshot], key: &str) -> DataResult<SlicedDump> {
    let first = history
        .first()
        .and_then(|snapshot| snapshot.entry(key))
        .and_then(BeanNode::as_tree)
        .ok_or_else(|| DataError::InvalidSample {
            origin: key.to_string(),
            message: "no summaries found in dump".to_string(),
        })?;

    let column = |path: &[&str]| -> Vec<f64> {
        history
            .iter()
            .map(|snapshot| {
                snapshot
                    .entry(key)
                    .and_then(|entry| path.iter().try_fold(entry, |node, segment| node.get(segment)))
                    .and_then(BeanNode::as_f64)
                    .unwrap_or(0.0)
            })
            .collect()
    };

    let mut sliced = SlicedDump::default();
    for (field, node) in first {
        match field.as_str() {
            "samples" => sliced.samples = column(&["samples"]),
            "percentiles" => {
                for percentile in node.as_tree().into_iter().flat_map(|tree| tree.keys()) {
                    sliced.series.insert(
                        format!("{}_percentile", percentile),
                        column(&["percentiles", percentile.as_str()]),
                    );
                }
            }
            other => {
                sliced.series.insert(other.to_string(), column(&[other]));
            }
        }
    }
    Ok(sliced)
}

/// "Time" and "Latency" graphs over one generated day per summary
pub fn jtl_report_graphs(history: &[Snapshot], latest: DateTime<Utc>) -> DataResult<Vec<Graph>> {
    [
        ("Time", "time", "request time"),
        ("Latency", "latency", "request latency"),
    ]
    .into_iter()
    .map(|(name, key, description)| -> DataResult<Graph> {
        let sliced = slice_dump(history, key)?;
        let samples = sliced.samples.last().copied().unwrap_or(0.0) as u64;
        let lines: Vec<Line> = sliced
            .series
            .into_iter()
            .enumerate()
            .map(|(index, (label, values))| {
                Line::new(JTL_LINE_COLORS[index % JTL_LINE_COLORS.len()], label, values, 0)
            })
            .collect();
        let days = lines.first().map_or(0, |line| line.values.len());
        Ok(Graph::new(
            name,
            format!("{} ({} samples)", description, samples),
            "milliseconds",
            generate_daily_dates(days, latest),
        )
        .with_lines(lines))
    })
    .collect()
}

// ============================================================================
// SECTION 15: DUMP ASSERTIONS
// ============================================================================

/// Latest value at `entry/path`
pub fn latest_value(extractor: &PathExtractor, history: &[Snapshot], entry: &str, path: &str) -> DataResult<f64> {
    extractor
        .extract(history, entry, None, path)
        .last()
        .copied()
        .ok_or_else(|| DataError::AssertionFailed {
            key: assertion_key(path),
            message: "the dump holds no snapshots".to_string(),
        })
}

fn assertion_key(path: &str) -> String {
    BeanPath::parse(path).last_segment().unwrap_or_default().to_string()
}

/// Fail unless the latest value at `entry/path` is zero
pub fn assert_zero(extractor: &PathExtractor, history: &[Snapshot], entry: &str, path: &str) -> DataResult<i64> {
    let value = latest_value(extractor, history, entry, path)?.trunc() as i64;
    if value != 0 {
        let key = assertion_key(path);
        return Err(DataError::AssertionFailed {
            message: format!("{} is non-zero ({})", key, value),
            key,
        });
    }
    Ok(value)
}

/// Fail when the latest value at `entry/path` is zero
pub fn assert_not_zero(extractor: &PathExtractor, history: &[Snapshot], entry: &str, path: &str) -> DataResult<i64> {
    let value = latest_value(extractor, history, entry, path)?.trunc() as i64;
    if value == 0 {
        let key = assertion_key(path);
        return Err(DataError::AssertionFailed {
            message: format!("{} is zero", key),
            key,
        });
    }
    Ok(value)
}

// ============================================================================
// SECTION 16: REPORT RENDERING
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Renderer Trait
// ----------------------------------------------------------------------------

/// Consumer of assembled graphs.
pub trait ReportRenderer: Debug {
    fn add_graph(&mut self, graph: &Graph) -> PerfdumpResult<()>;

    /// Write the report; `main_plot` names the graph to feature
    fn finish(&mut self, main_plot: Option<&str>) -> PerfdumpResult<PathBuf>;
}

/// Feed every graph to `renderer` and finish the report
pub fn render_report(
    renderer: &mut dyn ReportRenderer,
    graphs: &[Graph],
    main_plot: Option<&str>,
) -> PerfdumpResult<PathBuf> {
    for graph in graphs {
        renderer.add_graph(graph)?;
    }
    renderer.finish(main_plot)
}

/// Hex value of the short color names used in report configurations
pub fn color_hex(color: &str) -> Option<&'static str> {
    let hex = match color {
        "b" | "blue" => "#0000FF",
        "g" | "green" => "#008000",
        "r" | "red" => "#FF0000",
        "c" | "cyan" => "#00FFFF",
        "m" | "magenta" => "#FF00FF",
        "y" | "yellow" => "#FFFF00",
        "k" | "black" => "#000000",
        "w" | "white" => "#FFFFFF",
        "orange" => "#FFA500",
        "purple" => "#800080",
        "brown" => "#A52A2A",
        "gray" | "grey" => "#808080",
        "pink" => "#FFC0CB",
        "olive" => "#808000",
        "navy" => "#000080",
        "teal" => "#008080",
        _ => return None,
    };
    Some(hex)
}

// ----------------------------------------------------------------------------
// 16.2 JSON Renderer
// ----------------------------------------------------------------------------

/// Writes graphs and their legends as a JSON report document.
#[derive(Debug)]
pub struct JsonReportRenderer {
    folder: PathBuf,
    documents: Vec<JsonValue>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl JsonReportRenderer {
    /// Start a report in `folder`, replacing any previous content
    pub fn new(folder: impl Into<PathBuf>, diagnostics: Arc<dyn Diagnostics>) -> PerfdumpResult<Self> {
        let folder = folder.into();
        if folder.exists() {
            fs::remove_dir_all(&folder)?;
        }
        fs::create_dir_all(&folder)?;
        Ok(Self {
            folder,
            documents: Vec::new(),
            diagnostics,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn write_document(&self, name: &str, document: &JsonValue) -> PerfdumpResult<PathBuf> {
        let path = self.folder.join(name);
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StoreError::Serialization { message: e.to_string() })?;
        fs::write(&path, content)?;
        Ok(path)
    }
}

impl ReportRenderer for JsonReportRenderer {
    fn add_graph(&mut self, graph: &Graph) -> PerfdumpResult<()> {
        graph.validate()?;
        let lines: Vec<JsonValue> = graph
            .lines
            .iter()
            .map(|line| {
                json!({
                    "label": line.label,
                    "color": line.color,
                    "hex": color_hex(&line.color).unwrap_or(line.color.as_str()),
                    "precision": line.precision,
                    "legend": line.legend_value().map(|value| format!("{}: {}", line.label, value)),
                    "values": line.values,
                })
            })
            .collect();
        self.documents.push(json!({
            "name": graph.name,
            "description": graph.description,
            "unit": graph.unit,
            "axis": graph.axis_labels(),
            "timestamps": graph.timestamps,
            "lines": lines,
        }));
        debug!(target: "perfdump::report", graph = %graph.name, lines = graph.lines.len(), "Rendered graph");
        Ok(())
    }

    fn finish(&mut self, main_plot: Option<&str>) -> PerfdumpResult<PathBuf> {
        let report = self.write_document(REPORT_DOCUMENT_NAME, &JsonValue::Array(self.documents.clone()))?;

        if let Some(main_plot) = main_plot {
            match self
                .documents
                .iter()
                .find(|document| document.get("name").and_then(JsonValue::as_str) == Some(main_plot))
            {
                Some(document) => {
                    self.write_document(MAIN_PLOT_DOCUMENT_NAME, document)?;
                }
                None => self
                    .diagnostics
                    .warn(&format!("Main plot '{}' is not part of the report", main_plot)),
            }
        }

        info!(
            target: "perfdump::report",
            path = %report.display(),
            graphs = self.documents.len(),
            "Report written"
        );
        Ok(report)
    }
}

// ============================================================================
// SECTION 17: PERIODIC COLLECTOR
// ============================================================================

/// Harvest and append every `interval` until `run_time` elapses or the
/// process is interrupted. Returns the number of completed cycles.
pub async fn run_collection(
    store: &SnapshotStore,
    source: &dyn MetricSource,
    config: &CollectorConfig,
) -> PerfdumpResult<usize> {
    if config.targets.is_empty() {
        return Err(ConfigError::missing_field("collector", "targets").into());
    }

    let deadline = config.run_time.map(|run_time| Instant::now() + run_time);
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        target: "perfdump::collector",
        targets = config.targets.len(),
        interval = ?config.interval,
        run_time = ?config.run_time,
        "Starting collection"
    );

    let mut cycles = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                    break;
                }
                let snapshots = store.append_harvest(source, &config.targets).await?;
                cycles += 1;
                info!(target: "perfdump::collector", cycle = cycles, snapshots, "Collection cycle complete");
            }
            _ = &mut shutdown => {
                info!(target: "perfdump::collector", cycles, "Collection interrupted");
                break;
            }
        }
    }

    Ok(cycles)
}

// ============================================================================
// SECTION 18: COMMAND LINE INTERFACE
// ============================================================================
// Every capability is reachable from the command line:
// - dump/collect write snapshots, read/assert-* query them
// - plot/plot-dump/jtl build reports
// - validate/generate-config/version need no runtime configuration
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Perfdump CLI
#[derive(Parser, Debug)]
#[command(
    name = "perfdump",
    author = "Performance Team",
    version,
    about = "Harvest Jolokia mbean metrics into a rolling history and report on it",
    long_about = "Perfdump harvests management-bean metrics from services exposing a \
                  Jolokia agent, keeps a size-bounded JSON history of the snapshots and \
                  assembles graphs and statistics from that history."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "perfdump.toml", env = "PERFDUMP_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PERFDUMP_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest every bean of the given targets and append one snapshot
    Dump {
        /// Dump file to append to
        dump_file: PathBuf,

        /// Targets as endpoint=domain
        #[arg(required = true)]
        targets: Vec<String>,

        /// Maximum number of snapshots kept
        #[arg(short, long)]
        retention: Option<usize>,
    },

    /// Print the series found at entry=path pairs
    Read {
        /// Dump file to read
        dump_file: PathBuf,

        /// Pairs as entry=path
        #[arg(required = true)]
        pairs: Vec<String>,

        /// Path lookup mode
        #[arg(long, value_enum)]
        lookup: Option<LookupMode>,
    },

    /// Harvest periodically until the run time elapses or Ctrl-C
    Collect {
        /// Dump file to append to
        #[arg(short, long)]
        dump_file: Option<PathBuf>,

        /// Pause between harvests (e.g. "30s", "5m")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Total collection time
        #[arg(short, long, value_parser = humantime::parse_duration)]
        run_time: Option<Duration>,

        /// Targets as endpoint=domain, replacing the configured ones
        targets: Vec<String>,
    },

    /// Build the report declared by a report configuration
    Plot {
        /// Report configuration (TOML)
        report_config: PathBuf,

        /// Graph featured as main plot
        main_plot: Option<String>,

        /// Output folder
        #[arg(short, long)]
        folder: Option<PathBuf>,
    },

    /// Build count and timing graphs straight from raw dumps
    PlotDump {
        /// Output folder
        #[arg(short, long)]
        folder: Option<PathBuf>,

        /// Dump files to scan
        #[arg(required = true)]
        dump_files: Vec<PathBuf>,
    },

    /// Summarize a JMeter result file and append it to the JTL dump
    Jtl {
        /// JTL result file
        jtl_file: PathBuf,

        /// JTL dump file
        #[arg(short, long, default_value = DEFAULT_JTL_DUMP_FILE)]
        dump_file: PathBuf,

        /// Build the Time/Latency report afterwards
        #[arg(short, long)]
        plot: bool,

        /// Fail when the dump file does not exist yet
        #[arg(long)]
        strict: bool,
    },

    /// Fail unless the latest value at a path is zero
    AssertZero {
        dump_file: PathBuf,
        entry: String,
        path: String,
    },

    /// Fail when the latest value at a path is zero
    AssertNotZero {
        dump_file: PathBuf,
        entry: String,
        path: String,
    },

    /// Validate a report configuration
    Validate {
        /// Report configuration (TOML)
        report_config: PathBuf,
    },

    /// Generate default runtime configuration
    GenerateConfig {
        /// Output file path (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 18.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn parse_targets(raw: &[String]) -> ConfigResult<Vec<HarvestTarget>> {
    raw.iter().map(|pair| pair.parse()).collect()
}

fn parse_read_pair(pair: &str) -> ConfigResult<(&str, &str)> {
    pair.split_once('=').ok_or_else(|| {
        ConfigError::invalid_value("pair", format!("expected 'entry=path', got '{}'", pair))
    })
}

/// Handle the dump subcommand
async fn handle_dump(
    config: &PerfdumpConfig,
    dump_file: &Path,
    targets: &[String],
    retention: Option<usize>,
) -> PerfdumpResult<()> {
    let targets = parse_targets(targets)?;
    let source = JolokiaClient::new(&config.dumper, TracingDiagnostics::shared("source"))?;
    let store = SnapshotStore::new(dump_file, TracingDiagnostics::shared("store"))
        .with_retention(retention.unwrap_or(config.dumper.retention));
    let snapshots = store.append_harvest(&source, &targets).await?;
    println!("✅ Appended snapshot to {} ({} snapshots)", dump_file.display(), snapshots);
    Ok(())
}

/// Handle the read subcommand
fn handle_read(
    config: &PerfdumpConfig,
    dump_file: &Path,
    pairs: &[String],
    lookup: Option<LookupMode>,
) -> PerfdumpResult<()> {
    let history = SnapshotStore::new(dump_file, TracingDiagnostics::shared("store")).load()?;
    let extractor = PathExtractor::new(TracingDiagnostics::shared("extract"))
        .with_mode(lookup.unwrap_or(config.dumper.lookup_mode));
    for pair in pairs {
        let (entry, path) = parse_read_pair(pair)?;
        let values = extractor.extract(&history, entry, None, path);
        println!("{} = {:?}", entry, values);
    }
    Ok(())
}

/// Handle the collect subcommand
async fn handle_collect(
    config: &PerfdumpConfig,
    dump_file: Option<&Path>,
    interval: Option<Duration>,
    run_time: Option<Duration>,
    targets: &[String],
) -> PerfdumpResult<()> {
    let mut collector = config.collector.clone();
    if !targets.is_empty() {
        collector.targets = parse_targets(targets)?;
    }
    if let Some(interval) = interval {
        collector.interval = interval;
    }
    if run_time.is_some() {
        collector.run_time = run_time;
    }

    let source = JolokiaClient::new(&config.dumper, TracingDiagnostics::shared("source"))?;
    let store = SnapshotStore::new(
        dump_file.map_or_else(|| config.dumper.dump_file.clone(), Path::to_path_buf),
        TracingDiagnostics::shared("store"),
    )
    .with_retention(config.dumper.retention);

    let cycles = run_collection(&store, &source, &collector).await?;
    println!("✅ Collected {} snapshots into {}", cycles, store.path().display());
    Ok(())
}

/// Handle the plot subcommand
fn handle_plot(
    config: &PerfdumpConfig,
    report_config: &Path,
    main_plot: Option<&str>,
    folder: Option<&Path>,
) -> PerfdumpResult<()> {
    let report = ReportConfig::load(report_config)?;
    let extractor = PathExtractor::new(TracingDiagnostics::shared("extract")).with_mode(config.dumper.lookup_mode);
    let assembler = GraphAssembler::new(extractor, TracingDiagnostics::shared("graph"));
    let graphs = assembler.assemble_from_store(&report)?;

    let folder = folder.map_or_else(|| config.report.folder.clone(), Path::to_path_buf);
    let mut renderer = JsonReportRenderer::new(&folder, TracingDiagnostics::shared("report"))?;
    let written = render_report(&mut renderer, &graphs, main_plot)?;
    println!("✅ Report with {} graphs written to {}", graphs.len(), written.display());
    Ok(())
}

/// Handle the plot-dump subcommand
fn handle_plot_dump(config: &PerfdumpConfig, folder: Option<&Path>, dump_files: &[PathBuf]) -> PerfdumpResult<()> {
    let mut builder = AutoGraphBuilder::new(TracingDiagnostics::shared("graph"))?;
    for dump_file in dump_files {
        let history = SnapshotStore::new(dump_file, TracingDiagnostics::shared("store"))
            .strict(true)
            .load()?;
        builder.ingest(&history);
    }
    let graphs = builder.build();

    let folder = folder.map_or_else(|| config.report.folder.clone(), Path::to_path_buf);
    let mut renderer = JsonReportRenderer::new(&folder, TracingDiagnostics::shared("report"))?;
    let written = render_report(&mut renderer, &graphs, None)?;
    println!("✅ Report with {} graphs written to {}", graphs.len(), written.display());
    Ok(())
}

/// Handle the jtl subcommand
fn handle_jtl(config: &PerfdumpConfig, jtl_file: &Path, dump_file: &Path, plot: bool, strict: bool) -> PerfdumpResult<()> {
    let dumper = JtlResultDumper::new(dump_file, strict, TracingDiagnostics::shared("jtl"));
    let summaries = dumper.append_jtl_file(jtl_file)?;
    println!("✅ Appended summary of {} to {} ({} summaries)", jtl_file.display(), dump_file.display(), summaries);

    if plot {
        let history = dumper.store().load()?;
        let graphs = jtl_report_graphs(&history, Utc::now())?;
        let mut renderer = JsonReportRenderer::new(&config.report.folder, TracingDiagnostics::shared("report"))?;
        let written = render_report(&mut renderer, &graphs, Some(JTL_MAIN_PLOT))?;
        println!("📊 Report written to {}", written.display());
    }
    Ok(())
}

/// Handle the assert-zero and assert-not-zero subcommands
fn handle_assert(config: &PerfdumpConfig, dump_file: &Path, entry: &str, path: &str, expect_zero: bool) -> PerfdumpResult<()> {
    let history = SnapshotStore::new(dump_file, TracingDiagnostics::shared("store"))
        .strict(true)
        .load()?;
    let extractor = PathExtractor::new(TracingDiagnostics::shared("extract")).with_mode(config.dumper.lookup_mode);
    let outcome = if expect_zero {
        assert_zero(&extractor, &history, entry, path)
    } else {
        assert_not_zero(&extractor, &history, entry, path)
    };

    match outcome {
        Ok(value) => {
            println!("✅ {}/{} = {}", entry, path, value);
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            Err(e.into())
        }
    }
}

/// Handle the validate subcommand
fn handle_validate(report_config: &Path) -> PerfdumpResult<()> {
    println!("Validating report configuration: {}", report_config.display());

    match ReportConfig::load(report_config) {
        Ok(report) => {
            println!("✅ Report configuration is valid!");
            println!("\n📊 Report Summary:");
            println!("  • Data file: {}", report.datafile.display());
            println!("  • Graphs: {}", report.graphs.len());
            for graph in &report.graphs {
                println!("    - {} ({} lines, unit {})", graph.name, graph.lines.len(), graph.unit);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Report configuration validation failed!");
            println!("Error: {}", e);
            Err(PerfdumpError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> PerfdumpResult<()> {
    let config_str = PerfdumpConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", PERFDUMP_FULL_NAME, PERFDUMP_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Defaults:");
    println!("  • Dump retention: {} snapshots", DEFAULT_DUMP_RETENTION);
    println!("  • JTL history: {} summaries", JTL_HISTORY_KEEP);
    println!("  • Fetch latency: {}s", DEFAULT_FETCH_LATENCY_SECS);
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for perfdump
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need configuration
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { report_config } => {
            handle_validate(report_config)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let mut config = if config_found {
        PerfdumpConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        PerfdumpConfig::default()
    };

    // Override log level if specified
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.verbose {
        config.logging.level = "debug".into();
    }

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&config.logging)?;
    if !config_found {
        debug!("Config file not found at {}, using defaults", cli.config.display());
    }
    debug!("{} v{}", PERFDUMP_FULL_NAME, PERFDUMP_VERSION);

    // Handle remaining subcommands
    match cli.command {
        Commands::Dump { dump_file, targets, retention } => {
            handle_dump(&config, &dump_file, &targets, retention).await?;
        }
        Commands::Read { dump_file, pairs, lookup } => {
            handle_read(&config, &dump_file, &pairs, lookup)?;
        }
        Commands::Collect { dump_file, interval, run_time, targets } => {
            handle_collect(&config, dump_file.as_deref(), interval, run_time, &targets).await?;
        }
        Commands::Plot { report_config, main_plot, folder } => {
            handle_plot(&config, &report_config, main_plot.as_deref(), folder.as_deref())?;
        }
        Commands::PlotDump { folder, dump_files } => {
            handle_plot_dump(&config, folder.as_deref(), &dump_files)?;
        }
        Commands::Jtl { jtl_file, dump_file, plot, strict } => {
            handle_jtl(&config, &jtl_file, &dump_file, plot, strict)?;
        }
        Commands::AssertZero { dump_file, entry, path } => {
            handle_assert(&config, &dump_file, &entry, &path, true)?;
        }
        Commands::AssertNotZero { dump_file, entry, path } => {
            handle_assert(&config, &dump_file, &entry, &path, false)?;
        }
        Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 20: TESTS
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Diagnostics sink that keeps every record for inspection
    #[derive(Debug, Default)]
    pub struct RecordingDiagnostics {
        records: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingDiagnostics {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn push(&self, level: &'static str, message: &str) {
            self.records.lock().unwrap().push((level, message.to_string()));
        }

        pub fn at(&self, level: &str) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|(recorded, _)| *recorded == level)
                .map(|(_, message)| message.clone())
                .collect()
        }

        pub fn warnings(&self) -> Vec<String> {
            self.at("warn")
        }
    }

    impl Diagnostics for RecordingDiagnostics {
        fn debug(&self, message: &str) {
            self.push("debug", message);
        }
        fn info(&self, message: &str) {
            self.push("info", message);
        }
        fn warn(&self, message: &str) {
            self.push("warn", message);
        }
        fn error(&self, message: &str) {
            self.push("error", message);
        }
    }

    /// In-memory metric source keyed by domain and bean name
    #[derive(Debug, Default)]
    pub struct FixtureSource {
        pub listings: BTreeMap<String, Vec<String>>,
        pub responses: BTreeMap<String, JsonValue>,
        pub reads: Mutex<Vec<String>>,
    }

    impl FixtureSource {
        pub fn with_bean(mut self, domain: &str, key: &str, response: JsonValue) -> Self {
            self.listings.entry(domain.to_string()).or_default().push(key.to_string());
            self.responses.insert(format!("{}:{}", domain, key), response);
            self
        }

        pub fn reads(&self) -> Vec<String> {
            self.reads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetricSource for FixtureSource {
        async fn list(&self, endpoint: &str, domain: &str) -> SourceResult<Vec<String>> {
            self.listings
                .get(domain)
                .cloned()
                .ok_or_else(|| SourceError::DomainNotListed {
                    endpoint: endpoint.to_string(),
                    domain: domain.to_string(),
                })
        }

        async fn read(
            &self,
            endpoint: &str,
            bean: &str,
            _attribute: Option<&str>,
            _inner_path: Option<&str>,
        ) -> SourceResult<BeanNode> {
            self.reads.lock().unwrap().push(bean.to_string());
            self.responses
                .get(bean)
                .cloned()
                .map(BeanNode::from)
                .ok_or_else(|| SourceError::InvalidResponse {
                    url: read_url(endpoint, bean, None, None),
                    message: "unknown bean".to_string(),
                })
        }
    }

    pub fn snapshot(value: JsonValue) -> Snapshot {
        Snapshot::from_json(value).expect("snapshot must be an object")
    }

    /// Jolokia read response as stored in harvested snapshots
    pub fn read_response(mbean: &str, timestamp: u64, value: JsonValue) -> JsonValue {
        json!({
            "request": {"mbean": mbean, "type": "read"},
            "value": value,
            "timestamp": timestamp,
            "status": 200
        })
    }

    /// Snapshots shaped `{E: {X: {a: {b: {c: v}}, timestamp: ts}}}`
    pub fn nested_history(values: &[u64]) -> DumpHistory {
        values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                snapshot(json!({
                    "E": {"X": {"a": {"b": {"c": value}}, "timestamp": 1_500_000_000u64 + 86_400 * index as u64}}
                }))
            })
            .collect()
    }

    /// Arbitrary JSON documents with lowercase keys and integral numbers
    pub fn arb_json() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::from),
            any::<i64>().prop_map(JsonValue::from),
            "[a-z ]{0,8}".prop_map(JsonValue::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|map| JsonValue::Object(map.into_iter().collect())),
            ]
        })
    }

    /// Arbitrary snapshots of up to three capitalized entries
    pub fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
        prop::collection::btree_map("[A-Z][a-z]{0,3}", arb_json(), 0..3)
            .prop_map(|entries| snapshot(JsonValue::Object(entries.into_iter().collect())))
    }

    /// History where every snapshot holds `E/X/a/b/c = constant` among noise
    pub fn constant_history(constant: i64, noise: &[(BTreeMap<String, JsonValue>, BTreeMap<String, JsonValue>)]) -> DumpHistory {
        noise
            .iter()
            .map(|(siblings, entries)| {
                let mut bean: serde_json::Map<String, JsonValue> = siblings.clone().into_iter().collect();
                bean.insert("a".to_string(), json!({"b": {"c": constant}}));
                let mut document: serde_json::Map<String, JsonValue> = entries.clone().into_iter().collect();
                document.insert("E".to_string(), json!({"X": bean}));
                snapshot(JsonValue::Object(document))
            })
            .collect()
    }
}


#[cfg(test)]
mod store_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_appended_snapshots_load_back(history in prop::collection::vec(arb_snapshot(), 1..20)) {
            let dir = TempDir::new().unwrap();
            let store = store_in(&dir);
            for (index, snapshot) in history.iter().enumerate() {
                prop_assert_eq!(store.append(snapshot.clone()).unwrap(), index + 1);
            }
            prop_assert_eq!(store.reload().unwrap(), history);
        }
    }

    fn store_in(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("dump.json"), NullDiagnostics::shared())
    }

    fn numbered(sequence: u64) -> Snapshot {
        snapshot(json!({"E": {"seq": sequence}}))
    }

    #[test]
    fn test_missing_file_is_empty_history() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).load().unwrap().is_empty());
    }

    #[test]
    fn test_strict_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = store_in(&dir).strict(true).load();
        assert!(matches!(result, Err(StoreError::Missing { .. })));
    }

    #[test]
    fn test_whitespace_file_is_empty_history() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "  \n\t").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_documents_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for content in ["not json", "{}", "[1, 2]", "[{\"E\": 1}, \"x\"]"] {
            fs::write(store.path(), content).unwrap();
            assert!(
                matches!(store.load(), Err(StoreError::Corrupt { .. })),
                "content {:?} must be corrupt",
                content
            );
        }
    }

    #[test]
    fn test_append_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let first = snapshot(json!({
            "AddiService": {
                "name=RequestTiming": {"value": {"Count": 3, "Mean": 1.25, "Name": "x", "Flags": [true, null]}},
                "timestamp": 1_500_000_000u64
            }
        }));
        let second = snapshot(json!({"Other": {"zeta": 1, "alpha": "2"}}));

        assert_eq!(store.append(first.clone()).unwrap(), 1);
        assert_eq!(store.append(second.clone()).unwrap(), 2);

        let history = store.reload().unwrap();
        assert_eq!(history, vec![first, second]);
        assert_eq!(
            history[1].entry("Other").unwrap().as_tree().unwrap().keys().collect::<Vec<_>>(),
            vec!["zeta", "alpha"]
        );
    }

    #[test]
    fn test_retention_drops_oldest_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for sequence in 0..(DEFAULT_DUMP_RETENTION as u64 + 5) {
            store.append(numbered(sequence)).unwrap();
        }

        let history = store.load().unwrap();
        assert_eq!(history.len(), DEFAULT_DUMP_RETENTION);
        assert_eq!(history[0], numbered(5));
        assert_eq!(history[DEFAULT_DUMP_RETENTION - 1], numbered(DEFAULT_DUMP_RETENTION as u64 + 4));
    }

    #[test]
    fn test_custom_retention() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).with_retention(3);
        for sequence in 0..5 {
            store.append(numbered(sequence)).unwrap();
        }
        assert_eq!(store.load().unwrap(), vec![numbered(2), numbered(3), numbered(4)]);
        assert_eq!(store_in(&dir).with_retention(0).retention(), 1);
    }

    #[test]
    fn test_persist_layout() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.append(numbered(1)).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with("[\n    {\n        \"E\""));
        assert!(!dir.path().join("dump.json.tmp").exists());
    }

    #[test]
    fn test_truncate_history() {
        let history: DumpHistory = (0..5).map(numbered).collect();
        assert_eq!(truncate_history(history.clone(), 2), vec![numbered(3), numbered(4)]);
        assert_eq!(truncate_history(history.clone(), 10).len(), 5);
        assert!(truncate_history(history, 0).is_empty());
    }
}



#[cfg(test)]
mod jtl_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const JTL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testResults version="1.2">
<httpSample t="120" lt="80" ts="1500000000000" s="true" lb="GET /a" rc="200">
  <httpSample t="60" lt="40" lb="GET /a-sub"/>
  <responseData class="java.lang.String">ok</responseData>
</httpSample>
<httpSample t="200" lt="150" ts="1500000001000" s="true" lb="GET /b" rc="200"/>
<sample t="999" lt="999" lb="JDBC"/>
</testResults>
"#;

    fn samples(pairs: &[(f64, f64)]) -> Vec<JtlSample> {
        pairs
            .iter()
            .map(|&(elapsed, latency)| JtlSample { elapsed, latency })
            .collect()
    }

    #[test]
    fn test_parse_top_level_http_samples() {
        let parsed = parse_jtl(JTL, "results.jtl").unwrap();
        assert_eq!(parsed, samples(&[(120.0, 80.0), (200.0, 150.0)]));
    }

    #[test]
    fn test_parse_rejects_incomplete_samples() {
        let document = "<testResults><httpSample t=\"10\"/></testResults>";
        let result = parse_jtl(document, "broken.jtl");
        assert!(matches!(result, Err(PerfdumpError::Data(DataError::InvalidSample { .. }))));

        let document = "<testResults><httpSample t=\"ten\" lt=\"1\"/></testResults>";
        assert!(parse_jtl(document, "broken.jtl").is_err());
    }

    #[test]
    fn test_parse_single_quoted_attributes() {
        let document = "<testResults version='1.2'><httpSample t='120' lt='80'/></testResults>";
        assert_eq!(parse_jtl(document, "quoted.jtl").unwrap(), samples(&[(120.0, 80.0)]));
    }

    #[test]
    fn test_parse_angle_bracket_in_attribute_value() {
        let document = r#"<testResults><httpSample lb="a>b" t="5" lt="3"/></testResults>"#;
        assert_eq!(parse_jtl(document, "label.jtl").unwrap(), samples(&[(5.0, 3.0)]));
    }

    #[test]
    fn test_parse_ignores_commented_samples() {
        let document = r#"<testResults>
<!-- <httpSample t="9000" lt="9000"/> -->
<httpSample t="10" lt="4"/>
</testResults>"#;
        assert_eq!(parse_jtl(document, "commented.jtl").unwrap(), samples(&[(10.0, 4.0)]));
    }

    #[test]
    fn test_parse_rejects_malformed_document() {
        let result = parse_jtl("<testResults><httpSample t=\"1\" lt=\"1\">", "truncated.jtl");
        assert!(matches!(result, Err(PerfdumpError::Data(DataError::InvalidSample { .. }))));
    }

    #[test]
    fn test_parse_other_root_has_no_samples() {
        let document = r#"<results><httpSample t="10" lt="4"/></results>"#;
        assert!(parse_jtl(document, "other.jtl").unwrap().is_empty());
    }

    #[test]
    fn test_summary_snapshot_shape() {
        let summary = JtlSummary::from_samples(&samples(&[(120.0, 80.0), (200.0, 150.0)])).unwrap();
        let snapshot = summary.to_snapshot().unwrap();
        assert_eq!(snapshot.entry_names().collect::<Vec<_>>(), vec!["time", "latency"]);
        let time = snapshot.entry("time").unwrap();
        assert_eq!(time.get("samples").and_then(BeanNode::as_f64), Some(2.0));
        assert_eq!(time.get("min").and_then(BeanNode::as_f64), Some(120.0));
        assert_eq!(time.get("mean").and_then(BeanNode::as_f64), Some(160.0));
        assert_eq!(
            time.get("percentiles").and_then(|p| p.get("90")).and_then(BeanNode::as_f64),
            Some(120.0)
        );
    }

    #[test]
    fn test_dumper_appends_file_summaries() {
        let dir = TempDir::new().unwrap();
        let jtl = dir.path().join("results.jtl");
        fs::write(&jtl, JTL).unwrap();

        let dumper = JtlResultDumper::new(dir.path().join("jtl-dump.json"), false, NullDiagnostics::shared());
        assert_eq!(dumper.append_jtl_file(&jtl).unwrap(), 1);
        assert_eq!(dumper.append_jtl_file(&jtl).unwrap(), 2);

        let content = fs::read_to_string(dumper.store().path()).unwrap();
        assert!(content.starts_with("[\n  {\n    \"time\""));
    }

    #[test]
    fn test_dumper_keeps_recent_history() {
        let dir = TempDir::new().unwrap();
        let dumper = JtlResultDumper::new(dir.path().join("jtl-dump.json"), false, NullDiagnostics::shared());
        let summary = JtlSummary::from_samples(&samples(&[(1.0, 1.0)])).unwrap().to_snapshot().unwrap();
        dumper.store().persist(&vec![summary; JTL_HISTORY_KEEP + 10]).unwrap();

        assert_eq!(dumper.append_samples(&samples(&[(5.0, 2.0)])).unwrap(), JTL_HISTORY_KEEP + 1);
        let history = dumper.store().load().unwrap();
        let last = history.last().unwrap().entry("time").unwrap();
        assert_eq!(last.get("min").and_then(BeanNode::as_f64), Some(5.0));
    }

    #[test]
    fn test_strict_dumper_requires_existing_dump() {
        let dir = TempDir::new().unwrap();
        let dumper = JtlResultDumper::new(dir.path().join("missing.json"), true, NullDiagnostics::shared());
        let result = dumper.append_samples(&samples(&[(1.0, 1.0)]));
        assert!(matches!(result, Err(PerfdumpError::Store(StoreError::Missing { .. }))));
        assert!(!dir.path().join("missing.json").exists());
    }

    #[test]
    fn test_empty_run_is_rejected() {
        let dir = TempDir::new().unwrap();
        let dumper = JtlResultDumper::new(dir.path().join("jtl-dump.json"), false, NullDiagnostics::shared());
        let result = dumper.append_samples(&[]);
        assert!(matches!(result, Err(PerfdumpError::Data(DataError::EmptySampleSet))));
    }

    #[test]
    fn test_slice_dump_columns() {
        let history: DumpHistory = [[(10.0, 5.0), (30.0, 15.0)], [(20.0, 10.0), (40.0, 20.0)]]
            .iter()
            .map(|pairs| JtlSummary::from_samples(&samples(pairs)).unwrap().to_snapshot().unwrap())
            .collect();

        let sliced = slice_dump(&history, "time").unwrap();
        assert_eq!(sliced.samples, vec![2.0, 2.0]);
        assert_eq!(
            sliced.series.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["min", "max", "mean", "standard-deviation", "10_percentile", "90_percentile"]
        );
        assert_eq!(sliced.series["min"], vec![10.0, 20.0]);
        assert_eq!(sliced.series["mean"], vec![20.0, 30.0]);

        assert!(slice_dump(&[], "time").is_err());
    }

    #[test]
    fn test_jtl_report_graphs() {
        let history: DumpHistory = (1..=3)
            .map(|run| {
                let pairs = [(10.0 * run as f64, 1.0), (20.0 * run as f64, 2.0), (30.0, 3.0)];
                JtlSummary::from_samples(&samples(&pairs)).unwrap().to_snapshot().unwrap()
            })
            .collect();
        let latest = timestamp_to_datetime(1_500_000_000.0);

        let graphs = jtl_report_graphs(&history, latest).unwrap();
        assert_eq!(graphs.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(), vec!["Time", "Latency"]);

        let time = &graphs[0];
        assert_eq!(time.description, "request time (3 samples)");
        assert_eq!(time.unit, "milliseconds");
        assert_eq!(time.timestamps.len(), 3);
        assert_eq!(time.timestamps[2], latest);
        assert_eq!(
            time.lines.iter().map(|line| line.color.as_str()).collect::<Vec<_>>(),
            vec!["b", "g", "c", "y", "orange", "m"]
        );
        assert_eq!(time.lines[0].values, vec![10.0, 20.0, 30.0]);
        assert!(time.validate().is_ok());
        assert_eq!(graphs[1].description, "request latency (3 samples)");
    }
}


#[cfg(test)]
mod source_tests {
    use super::test_support::*;
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn fast_client(diagnostics: Arc<dyn Diagnostics>) -> JolokiaClient {
        JolokiaClient::new(&DumperConfig::default(), diagnostics)
            .unwrap()
            .with_latency(Duration::from_millis(300), Duration::from_millis(50))
    }

    fn addi_source() -> FixtureSource {
        FixtureSource::default()
            .with_bean(
                "AddiService",
                "name=RequestTiming,type=AddJob",
                read_response("AddiService:name=RequestTiming,type=AddJob", 1_500_000_000, json!({"Count": 3})),
            )
            .with_bean(
                "AddiService",
                "name=Errors",
                read_response("AddiService:name=Errors", 1_500_000_000, json!({"Count": 0})),
            )
    }

    #[tokio::test]
    async fn test_harvest_snapshot_shape() {
        let source = addi_source();
        let harvester = MBeanHarvester::new(&source, NullDiagnostics::shared());
        let snapshot = harvester
            .harvest(&[HarvestTarget::new("http://host/jolokia", "AddiService")])
            .await
            .unwrap();

        let entry = snapshot.entry("AddiService").unwrap().as_tree().unwrap();
        assert_eq!(
            entry.keys().collect::<Vec<_>>(),
            vec!["name=RequestTiming,type=AddJob", "name=Errors"]
        );
        assert_eq!(
            source.reads(),
            vec!["AddiService:name=RequestTiming,type=AddJob", "AddiService:name=Errors"]
        );

        let extractor = PathExtractor::new(NullDiagnostics::shared());
        let values = extractor.extract(&[snapshot], "AddiService", Some("name=RequestTiming,type=AddJob"), "value/Count");
        assert_eq!(values, vec![3.0]);
    }

    #[tokio::test]
    async fn test_append_harvest_persists_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.json"), NullDiagnostics::shared());
        let targets = [HarvestTarget::new("http://host/jolokia", "AddiService")];

        assert_eq!(store.append_harvest(&addi_source(), &targets).await.unwrap(), 1);
        assert_eq!(store.append_harvest(&addi_source(), &targets).await.unwrap(), 2);
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unlisted_domain_leaves_dump_untouched() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.json"), NullDiagnostics::shared());
        let result = store
            .append_harvest(&addi_source(), &[HarvestTarget::new("http://host/jolokia", "Unknown")])
            .await;

        assert!(matches!(
            result,
            Err(PerfdumpError::Source(SourceError::DomainNotListed { .. }))
        ));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_jolokia_list_and_read() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/jolokia/list");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({"value": {"AddiService": {"name=A": {}, "name=B": {}}}, "status": 200}));
            })
            .await;
        let read = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/jolokia/read/AddiService:name=A")
                    .query_param("ignoreErrors", "true");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "request": {"mbean": "AddiService:name=A", "type": "read"},
                        "value": {"Count": 3},
                        "timestamp": 1_500_000_000u64,
                        "status": 200
                    }));
            })
            .await;

        let client = fast_client(NullDiagnostics::shared());
        let endpoint = server.url("/jolokia");

        let keys = client.list(&endpoint, "AddiService").await.unwrap();
        assert_eq!(keys, vec!["name=A", "name=B"]);

        let node = client.read(&endpoint, "AddiService:name=A", None, None).await.unwrap();
        assert_eq!(node.get("value").and_then(|v| v.get("Count")), Some(&BeanNode::from(3u64)));

        list.assert_async().await;
        read.assert_async().await;

        let missing = client.list(&endpoint, "Other").await;
        assert!(matches!(missing, Err(SourceError::DomainNotListed { .. })));
    }

    #[tokio::test]
    async fn test_jolokia_not_found_is_tolerated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path_contains("/read/");
                then.status(200)
                    .json_body(json!({"status": 404, "error": "javax.management.InstanceNotFoundException"}));
            })
            .await;

        let diagnostics = RecordingDiagnostics::shared();
        let client = fast_client(diagnostics.clone());
        let node = client
            .read(&server.url("/jolokia"), "AddiService:name=Gone", None, None)
            .await
            .unwrap();

        assert_eq!(node.get("status").and_then(BeanNode::as_f64), Some(404.0));
        assert!(diagnostics.warnings()[0].contains("status 404"));
    }

    #[tokio::test]
    async fn test_jolokia_error_status_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path_contains("/read/");
                then.status(200).json_body(json!({"status": 500, "error": "boom"}));
            })
            .await;

        let client = fast_client(NullDiagnostics::shared());
        let result = client.read(&server.url("/jolokia"), "AddiService:name=A", None, None).await;
        assert!(matches!(result, Err(SourceError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_jolokia_invalid_document() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/jolokia/list");
                then.status(200).body("<html>not jolokia</html>");
            })
            .await;

        let client = fast_client(NullDiagnostics::shared());
        let result = client.list(&server.url("/jolokia"), "AddiService").await;
        assert!(matches!(result, Err(SourceError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_jolokia_retries_until_latency_elapses() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/jolokia/list");
                then.status(503);
            })
            .await;

        let diagnostics = RecordingDiagnostics::shared();
        let client = fast_client(diagnostics.clone());
        let result = client.list(&server.url("/jolokia"), "AddiService").await;

        assert!(matches!(result, Err(SourceError::Timeout { .. })));
        assert!(failing.hits_async().await > 1);
        assert_eq!(diagnostics.at("error").len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_times_out() {
        let client = fast_client(NullDiagnostics::shared());
        let result = client.list("http://127.0.0.1:1/jolokia", "AddiService").await;
        match result {
            Err(SourceError::Timeout { url, last_error, .. }) => {
                assert_eq!(url, "http://127.0.0.1:1/jolokia/list");
                assert!(!last_error.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collection_runs_until_run_time() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.json"), NullDiagnostics::shared());
        let config = CollectorConfig {
            targets: vec![HarvestTarget::new("http://host/jolokia", "AddiService")],
            interval: Duration::from_millis(50),
            run_time: Some(Duration::from_millis(180)),
        };

        let cycles = run_collection(&store, &addi_source(), &config).await.unwrap();
        assert!(cycles >= 2);
        assert_eq!(store.load().unwrap().len(), cycles);
    }

    #[tokio::test]
    async fn test_collection_requires_targets() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("dump.json"), NullDiagnostics::shared());
        let result = run_collection(&store, &addi_source(), &CollectorConfig::default()).await;
        assert!(matches!(
            result,
            Err(PerfdumpError::Config(ConfigError::MissingField { .. }))
        ));
    }
}
