//! # txmetrics engine
//!
//! Streaming aggregation of transaction events into cardinality-bounded
//! duration histograms, harvested on wall-clock aligned intervals and handed
//! to a downstream publisher.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              TXMETRICS ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  INGEST → INTERVAL SLOTS (active / standby tables) → HARVEST → PUBLISHER    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every configured interval (the base interval plus any roll-up intervals)
//! owns its own pair of aggregation tables and sees the raw event stream, so
//! each roll-up applies admission control to raw events rather than to
//! already-overflowed base data.
//!
//! ## Features
//!
//! - **Admission control**: distinct services, groups per service and total
//!   groups are capped per table
//! - **Overflow buckets**: rejected groups are merged into per-service or
//!   global `_other` records that keep counts and durations
//! - **Weighted histograms**: HDR-style buckets at 1-5 significant figures
//!   with fractional representative counts
//! - **Double-buffered harvest**: writers never wait for a drain or a publish

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};
use arc_swap::ArcSwap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{format_compact, CompactString};
use smallvec::SmallVec;
use hashbrown::hash_map::Entry as FastEntry;
use hashbrown::{Equivalent, HashMap as FastHashMap};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashSet;
use xxhash_rust::xxh3::Xxh3;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, SecondsFormat, Utc};

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{providers::{Env, Format, Toml}, Figment};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{IntCounter, IntCounterVec, Opts, Registry as PrometheusRegistry};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "txmetrics-engine";
pub const ENGINE_FULL_NAME: &str = "Transaction Metrics Aggregation Engine";

// ----------------------------------------------------------------------------
// Overflow & Output Naming
// ----------------------------------------------------------------------------

/// Sentinel used as transaction name (and service name for the global
/// bucket) of overflow records.
pub const OVERFLOW_BUCKET_NAME: &str = "_other";

/// Sample carrying the number of distinct groups merged into an overflow record.
pub const OVERFLOW_COUNT_SAMPLE: &str = "transaction.aggregation.overflow_count";

/// Metricset name attached to every exported record.
pub const METRICSET_NAME: &str = "transaction";

// ----------------------------------------------------------------------------
// Histogram Resolution
// ----------------------------------------------------------------------------

pub const MIN_SIGNIFICANT_FIGURES: u8 = 1;
pub const MAX_SIGNIFICANT_FIGURES: u8 = 5;

/// Durations are recorded in microseconds and clamped to one hour.
pub const HIGHEST_TRACKABLE_MICROS: u64 = 3_600_000_000;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ROLLUP_INTERVAL_SECS: [u64; 2] = [600, 3600];
pub const DEFAULT_MAX_TRANSACTION_GROUPS: usize = 10_000;
pub const DEFAULT_MAX_TRANSACTION_GROUPS_PER_SERVICE: usize = 1_000;
pub const DEFAULT_MAX_SERVICES: usize = 1_000;
pub const DEFAULT_SIGNIFICANT_FIGURES: u8 = 2;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Events decoded from the CLI input are ingested in batches of this size.
pub const INGEST_BATCH_SIZE: usize = 1024;

/// Prefix for environment overrides (`TXMETRICS_AGGREGATION__MAX_SERVICES=...`).
pub const ENV_PREFIX: &str = "TXMETRICS_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Events flowing in, the keys they are grouped by, and the summary records
// flowing out.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0.div_euclid(1_000_000_000)
    }

    /// Round down to the start of the enclosing interval, counted from the epoch.
    /// A 30s interval truncates to :00 and :30 of every minute.
    #[inline]
    pub fn truncate(&self, interval: Duration) -> Self {
        let step = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
        if step <= 0 {
            return *self;
        }
        Self(self.0 - self.0.rem_euclid(step))
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Time from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(Timestamp::from_datetime)
    }
}

/// Microseconds recorded for a duration, clamped to the trackable range.
#[inline]
pub fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros())
        .unwrap_or(u64::MAX)
        .min(HIGHEST_TRACKABLE_MICROS)
}

/// Label attached to records of one interval: whole seconds as `"30s"`,
/// anything finer in humantime form (`"200ms"`).
pub fn interval_label(interval: Duration) -> CompactString {
    if interval.subsec_nanos() == 0 {
        format_compact!("{}s", interval.as_secs())
    } else {
        CompactString::from(humantime::format_duration(interval).to_string())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Grouping Dimensions
// ----------------------------------------------------------------------------

fn is_blank(value: &CompactString) -> bool {
    value.is_empty()
}

/// Declare the fixed set of contextual string fields that take part in
/// grouping, together with name-based access used by decoders and tests.
macro_rules! grouping_dimensions {
    ($($(#[$doc:meta])* $field:ident),+ $(,)?) => {
        /// Contextual fields of a transaction that take part in grouping.
        ///
        /// The list is fixed at compile time; every field is part of the
        /// group key and is carried through to exported records.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(default)]
        pub struct Dimensions {
            $(
                $(#[$doc])*
                #[serde(skip_serializing_if = "is_blank")]
                pub $field: CompactString,
            )+
            /// Whether the FaaS invocation was a cold start.
            #[serde(skip_serializing_if = "Option::is_none")]
            pub faas_coldstart: Option<bool>,
        }

        impl Dimensions {
            /// Names of the string dimensions in declaration order.
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field)),+];

            /// Mutable access to a string dimension by name.
            pub fn field_mut(&mut self, name: &str) -> Option<&mut CompactString> {
                match name {
                    $(stringify!($field) => Some(&mut self.$field),)+
                    _ => None,
                }
            }
        }
    };
}

grouping_dimensions! {
    agent_name,
    /// Service name; with the environment it forms the [`ServiceIdentity`].
    service_name,
    service_environment,
    service_version,
    service_node_name,
    service_language_name,
    service_language_version,
    service_runtime_name,
    service_runtime_version,
    container_id,
    kubernetes_pod_name,
    host_hostname,
    host_os_platform,
    cloud_provider,
    cloud_region,
    cloud_availability_zone,
    cloud_account_id,
    cloud_account_name,
    cloud_project_id,
    cloud_project_name,
    cloud_machine_type,
    cloud_service_name,
    faas_id,
    faas_trigger_type,
    faas_name,
    faas_version,
}

// ----------------------------------------------------------------------------
// 3.3 Labels
// ----------------------------------------------------------------------------

/// A string label. Only labels marked `global` are grouped on and exported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelValue {
    pub value: CompactString,
    #[serde(default)]
    pub global: bool,
}

impl LabelValue {
    pub fn global(value: impl Into<CompactString>) -> Self {
        Self { value: value.into(), global: true }
    }

    pub fn local(value: impl Into<CompactString>) -> Self {
        Self { value: value.into(), global: false }
    }
}

/// A numeric label. Only labels marked `global` are grouped on and exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericLabelValue {
    pub value: f64,
    #[serde(default)]
    pub global: bool,
}

impl NumericLabelValue {
    pub fn global(value: f64) -> Self {
        Self { value, global: true }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Transaction Events (input)
// ----------------------------------------------------------------------------

/// One observed transaction, already normalised by the intake layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionEvent {
    /// Event time; ingestion time is used when absent.
    #[serde(rename = "@timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    pub name: CompactString,
    #[serde(rename = "type")]
    pub transaction_type: CompactString,
    pub result: CompactString,
    pub outcome: CompactString,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// How many real transactions this sampled event stands for.
    pub representative_count: f64,
    /// Parent span id; transactions without one are trace roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CompactString>,
    pub dimensions: Dimensions,
    pub labels: BTreeMap<CompactString, LabelValue>,
    pub numeric_labels: BTreeMap<CompactString, NumericLabelValue>,
}

impl Default for TransactionEvent {
    fn default() -> Self {
        Self {
            timestamp: None,
            name: CompactString::default(),
            transaction_type: CompactString::default(),
            result: CompactString::default(),
            outcome: CompactString::default(),
            duration: Duration::ZERO,
            representative_count: 1.0,
            parent_id: None,
            dimensions: Dimensions::default(),
            labels: BTreeMap::new(),
            numeric_labels: BTreeMap::new(),
        }
    }
}

impl TransactionEvent {
    /// Create an event for the named transaction with weight 1.
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, name: impl Into<CompactString>) -> Self {
        self.dimensions.service_name = name.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_representative_count(mut self, count: f64) -> Self {
        self.representative_count = count;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<CompactString>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<CompactString>, value: LabelValue) -> Self {
        self.labels.insert(key.into(), value);
        self
    }

    pub fn with_numeric_label(mut self, key: impl Into<CompactString>, value: NumericLabelValue) -> Self {
        self.numeric_labels.insert(key.into(), value);
        self
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent_id.as_deref().map_or(true, str::is_empty)
    }
}

/// Events exchanged with batch processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "processor", rename_all = "snake_case")]
pub enum ApmEvent {
    Transaction(TransactionEvent),
    Metricset(Box<TransactionMetrics>),
    Span(JsonValue),
    #[serde(rename = "error")]
    ErrorEvent(JsonValue),
}

impl ApmEvent {
    pub fn as_metricset(&self) -> Option<&TransactionMetrics> {
        match self {
            ApmEvent::Metricset(metrics) => Some(metrics),
            _ => None,
        }
    }
}

/// A batch of events handed to a [`BatchProcessor`].
pub type Batch = Vec<ApmEvent>;

// ----------------------------------------------------------------------------
// 3.5 Group & Service Identity
// ----------------------------------------------------------------------------

/// The identity the per-service group limit is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: CompactString,
    pub environment: CompactString,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<CompactString>, environment: impl Into<CompactString>) -> Self {
        Self { name: name.into(), environment: environment.into() }
    }
}

/// Everything two transactions must share to be aggregated together.
///
/// Equality covers every field; non-global labels never make it into the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub transaction_name: CompactString,
    pub transaction_type: CompactString,
    pub transaction_result: CompactString,
    pub event_outcome: CompactString,
    pub root: bool,
    pub dimensions: Dimensions,
    pub labels: BTreeMap<CompactString, CompactString>,
    pub numeric_labels: BTreeMap<CompactString, OrderedFloat<f64>>,
}

impl GroupKey {
    pub fn from_event(event: &TransactionEvent) -> Self {
        Self {
            transaction_name: event.name.clone(),
            transaction_type: event.transaction_type.clone(),
            transaction_result: event.result.clone(),
            event_outcome: event.outcome.clone(),
            root: event.is_root(),
            dimensions: event.dimensions.clone(),
            labels: event
                .labels
                .iter()
                .filter(|(_, label)| label.global)
                .map(|(key, label)| (key.clone(), label.value.clone()))
                .collect(),
            numeric_labels: event
                .numeric_labels
                .iter()
                .filter(|(_, label)| label.global)
                .map(|(key, label)| (key.clone(), OrderedFloat(label.value)))
                .collect(),
        }
    }

    pub fn service(&self) -> ServiceIdentity {
        ServiceIdentity::new(
            self.dimensions.service_name.clone(),
            self.dimensions.service_environment.clone(),
        )
    }

    /// 64-bit xxh3 digest of the key within one time bucket; used to count
    /// distinct keys merged into overflow records.
    pub fn digest_at(&self, timestamp: Timestamp) -> u64 {
        let mut hasher = Xxh3::new();
        timestamp.hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.digest()
    }
}

/// A group key scoped to one truncated timestamp; the key of a table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TimedKey {
    timestamp: Timestamp,
    key: GroupKey,
}

/// Borrowed form of [`TimedKey`] for lookups without cloning the key.
/// Field order matches `TimedKey` so both hash identically.
#[derive(Debug, Clone, Copy, Hash)]
struct TimedKeyRef<'a> {
    timestamp: Timestamp,
    key: &'a GroupKey,
}

impl Equivalent<TimedKey> for TimedKeyRef<'_> {
    fn equivalent(&self, other: &TimedKey) -> bool {
        self.timestamp == other.timestamp && *self.key == other.key
    }
}

// ----------------------------------------------------------------------------
// 3.6 Transaction Metrics (output)
// ----------------------------------------------------------------------------

/// Integer snapshot of a duration histogram: ascending bucket values in
/// microseconds paired with their counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub values: Vec<f64>,
    pub counts: Vec<u64>,
}

impl HistogramSnapshot {
    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub count: u64,
    /// Sum of weighted durations in microseconds.
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsetSample {
    pub name: CompactString,
    pub value: f64,
}

/// One exported summary: a group record or an overflow record of one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionMetrics {
    #[serde(rename = "@timestamp")]
    pub timestamp: Timestamp,
    pub metricset_name: CompactString,
    /// Interval label, e.g. `"30s"`.
    pub interval: CompactString,
    pub doc_count: u64,
    pub transaction_name: CompactString,
    #[serde(skip_serializing_if = "is_blank")]
    pub transaction_type: CompactString,
    #[serde(skip_serializing_if = "is_blank")]
    pub transaction_result: CompactString,
    pub transaction_root: bool,
    #[serde(skip_serializing_if = "is_blank")]
    pub event_outcome: CompactString,
    pub dimensions: Dimensions,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<CompactString, CompactString>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub numeric_labels: BTreeMap<CompactString, f64>,
    pub duration_histogram: HistogramSnapshot,
    pub duration_summary: DurationSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<MetricsetSample>,
}

impl TransactionMetrics {
    pub fn is_overflow(&self) -> bool {
        self.transaction_name == OVERFLOW_BUCKET_NAME
            && self.samples.iter().any(|s| s.name == OVERFLOW_COUNT_SAMPLE)
    }

    /// Distinct groups merged into this record, for overflow records.
    pub fn overflow_count(&self) -> Option<u64> {
        self.samples
            .iter()
            .find(|s| s.name == OVERFLOW_COUNT_SAMPLE)
            .map(|s| s.value as u64)
    }

    pub fn service(&self) -> ServiceIdentity {
        ServiceIdentity::new(
            self.dimensions.service_name.clone(),
            self.dimensions.service_environment.clone(),
        )
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING
// ============================================================================

/// Top-level error type for the engine
#[derive(Error, Debug)]
pub enum TxMetricsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxMetricsError {
    /// Returns true if the engine can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TxMetricsError::Publish(_) | TxMetricsError::Io(_))
    }

    /// Returns the error category for structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            TxMetricsError::Config(_) => "config",
            TxMetricsError::Publish(_) => "publish",
            TxMetricsError::Lifecycle(_) => "lifecycle",
            TxMetricsError::Io(_) => "io",
            TxMetricsError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for engine operations
pub type TxMetricsResult<T> = Result<T, TxMetricsError>;

/// Configuration errors. Only raised while building or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid aggregator config: {field} {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("failed to create aggregator metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ConfigError {
    pub fn invalid_value(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue { field, message: message.into() }
    }

    /// Name of the offending field for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ConfigError::InvalidValue { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Failures reported by a [`BatchProcessor`].
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("batch processor closed")]
    Closed,

    #[error("batch rejected: {message}")]
    Rejected { message: String },

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write batch: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    pub fn rejected(message: impl Into<String>) -> Self {
        PublishError::Rejected { message: message.into() }
    }
}

/// Misuse of the aggregator lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("aggregator is already running")]
    AlreadyRunning,

    #[error("aggregator did not stop within {deadline:?}")]
    StopDeadlineExceeded { deadline: Duration },
}

// ============================================================================
// SECTION 5: CONFIGURATION
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Aggregator Configuration
// ----------------------------------------------------------------------------

/// Runtime configuration of an [`Aggregator`].
///
/// Zero values mean "unspecified" and fail validation; use
/// [`AggregationSettings::into_config`] to start from the defaults.
#[derive(Clone, Default)]
pub struct AggregatorConfig {
    /// Receives every harvested batch. Required.
    pub publisher: Option<Arc<dyn BatchProcessor>>,
    /// Receives batches passed through [`Aggregator::process_batch`].
    /// Defaults to [`NopProcessor`].
    pub downstream: Option<Arc<dyn BatchProcessor>>,
    pub interval: Duration,
    pub rollup_intervals: Vec<Duration>,
    pub max_transaction_groups: usize,
    pub max_transaction_groups_per_service: usize,
    pub max_services: usize,
    pub histogram_significant_figures: u8,
}

impl Debug for AggregatorConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorConfig")
            .field("publisher", &self.publisher.is_some())
            .field("downstream", &self.downstream.is_some())
            .field("interval", &self.interval)
            .field("rollup_intervals", &self.rollup_intervals)
            .field("max_transaction_groups", &self.max_transaction_groups)
            .field("max_transaction_groups_per_service", &self.max_transaction_groups_per_service)
            .field("max_services", &self.max_services)
            .field("histogram_significant_figures", &self.histogram_significant_figures)
            .finish()
    }
}

impl AggregatorConfig {
    /// Check every field in a fixed order and report the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.is_none() {
            return Err(ConfigError::invalid_value("publisher", "unspecified"));
        }
        if self.max_transaction_groups == 0 {
            return Err(ConfigError::invalid_value("max_transaction_groups", "unspecified or zero"));
        }
        if self.max_transaction_groups_per_service == 0 {
            return Err(ConfigError::invalid_value(
                "max_transaction_groups_per_service",
                "unspecified or zero",
            ));
        }
        if self.max_services == 0 {
            return Err(ConfigError::invalid_value("max_services", "unspecified or zero"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid_value("interval", "unspecified or zero"));
        }
        if let Some(index) = self.rollup_intervals.iter().position(Duration::is_zero) {
            return Err(ConfigError::invalid_value(
                "rollup_intervals",
                format!("entry {index} is zero"),
            ));
        }
        HistogramLayout::new(self.histogram_significant_figures)?;
        Ok(())
    }

    /// Table limits shared by every interval slot.
    pub fn limits(&self) -> TableLimits {
        TableLimits {
            max_transaction_groups: self.max_transaction_groups,
            max_transaction_groups_per_service: self.max_transaction_groups_per_service,
            max_services: self.max_services,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Engine Configuration (file + environment)
// ----------------------------------------------------------------------------

/// Complete engine configuration as loaded from TOML and the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub aggregation: AggregationSettings,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file, with `TXMETRICS_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let config: EngineConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aggregation.validate()
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&EngineConfig::default())
            .unwrap_or_else(|e| format!("# failed to render default configuration: {e}\n"))
    }
}

/// Serde helpers for a list of humantime durations (`["10m", "1h"]`).
mod humantime_list {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|d| humantime::format_duration(*d).to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|raw| humantime::parse_duration(raw).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Aggregation knobs as they appear in the `[aggregation]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_rollup_intervals", with = "humantime_list")]
    pub rollup_intervals: Vec<Duration>,

    #[serde(default = "default_max_transaction_groups")]
    pub max_transaction_groups: usize,

    #[serde(default = "default_max_transaction_groups_per_service")]
    pub max_transaction_groups_per_service: usize,

    #[serde(default = "default_max_services")]
    pub max_services: usize,

    #[serde(default = "default_significant_figures")]
    pub histogram_significant_figures: u8,

    /// How long shutdown waits for the final flush.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_INTERVAL_SECS)
}
fn default_rollup_intervals() -> Vec<Duration> {
    DEFAULT_ROLLUP_INTERVAL_SECS.iter().map(|s| Duration::from_secs(*s)).collect()
}
fn default_max_transaction_groups() -> usize {
    DEFAULT_MAX_TRANSACTION_GROUPS
}
fn default_max_transaction_groups_per_service() -> usize {
    DEFAULT_MAX_TRANSACTION_GROUPS_PER_SERVICE
}
fn default_max_services() -> usize {
    DEFAULT_MAX_SERVICES
}
fn default_significant_figures() -> u8 {
    DEFAULT_SIGNIFICANT_FIGURES
}
fn default_stop_timeout() -> Duration {
    Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS)
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            rollup_intervals: default_rollup_intervals(),
            max_transaction_groups: default_max_transaction_groups(),
            max_transaction_groups_per_service: default_max_transaction_groups_per_service(),
            max_services: default_max_services(),
            histogram_significant_figures: default_significant_figures(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl AggregationSettings {
    /// Attach collaborators and produce a validated [`AggregatorConfig`].
    pub fn into_config(
        &self,
        publisher: Arc<dyn BatchProcessor>,
        downstream: Option<Arc<dyn BatchProcessor>>,
    ) -> Result<AggregatorConfig, ConfigError> {
        let config = AggregatorConfig {
            publisher: Some(publisher),
            downstream,
            interval: self.interval,
            rollup_intervals: self.rollup_intervals.clone(),
            max_transaction_groups: self.max_transaction_groups,
            max_transaction_groups_per_service: self.max_transaction_groups_per_service,
            max_services: self.max_services,
            histogram_significant_figures: self.histogram_significant_figures,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.into_config(Arc::new(NopProcessor), None).map(|_| ())
    }
}

/// Output encoding of published metricsets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON document per line
    #[default]
    Ndjson,
    /// Indented JSON, one document after another
    Pretty,
}

/// Where the CLI writes harvested metricsets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Output file; stdout when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ============================================================================
// SECTION 6: LOGGING
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            colors: true,
            source_location: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Compact,
    Pretty,
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr so stdout stays free for published metricsets.
pub fn init_logging(config: &LoggingConfig) -> TxMetricsResult<()> {
    let level = config.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };

    result.map_err(|e| TxMetricsError::Internal(format!("Failed to install logger: {e}")))?;

    info!(
        target: "txmetrics::engine",
        level = %level,
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}

// ============================================================================
// SECTION 7: WEIGHTED HISTOGRAM
// ============================================================================
// Log-linear buckets with the HDR index layout (lowest discernible value
// 1µs). Each bucket holds an f64 weight so sampled transactions can stand
// for more than one real transaction.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Bucket Layout
// ----------------------------------------------------------------------------

/// Index math for a given number of significant figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramLayout {
    significant_figures: u8,
    sub_bucket_half_count_magnitude: u32,
    sub_bucket_half_count: u64,
    sub_bucket_mask: u64,
    leading_zero_count_base: u32,
}

impl HistogramLayout {
    pub fn new(significant_figures: u8) -> Result<Self, ConfigError> {
        if !(MIN_SIGNIFICANT_FIGURES..=MAX_SIGNIFICANT_FIGURES).contains(&significant_figures) {
            return Err(ConfigError::invalid_value(
                "histogram_significant_figures",
                format!(
                    "({significant_figures}) outside range [{MIN_SIGNIFICANT_FIGURES},{MAX_SIGNIFICANT_FIGURES}]"
                ),
            ));
        }

        let largest_single_unit = 2 * 10u64.pow(u32::from(significant_figures));
        // ceil(log2(largest_single_unit))
        let sub_bucket_count_magnitude = u64::BITS - (largest_single_unit - 1).leading_zeros();
        let half_magnitude = sub_bucket_count_magnitude.max(1) - 1;
        let sub_bucket_count = 1u64 << (half_magnitude + 1);

        Ok(Self {
            significant_figures,
            sub_bucket_half_count_magnitude: half_magnitude,
            sub_bucket_half_count: sub_bucket_count / 2,
            sub_bucket_mask: sub_bucket_count - 1,
            leading_zero_count_base: u64::BITS - half_magnitude - 1,
        })
    }

    #[inline]
    pub fn significant_figures(&self) -> u8 {
        self.significant_figures
    }

    /// Bucket index of a value in microseconds.
    #[inline]
    pub fn index_of(&self, value: u64) -> u32 {
        let bucket = self.leading_zero_count_base - (value | self.sub_bucket_mask).leading_zeros();
        let sub_bucket = value >> bucket;
        ((u64::from(bucket) << self.sub_bucket_half_count_magnitude) + sub_bucket) as u32
    }

    /// Largest value that maps to the same bucket as `index`.
    pub fn highest_equivalent_value(&self, index: u32) -> u64 {
        let index = u64::from(index);
        let mut bucket = (index >> self.sub_bucket_half_count_magnitude) as i64 - 1;
        let mut sub_bucket = (index & (self.sub_bucket_half_count - 1)) + self.sub_bucket_half_count;
        if bucket < 0 {
            sub_bucket -= self.sub_bucket_half_count;
            bucket = 0;
        }
        let lowest = sub_bucket << bucket;
        lowest + (1u64 << bucket) - 1
    }
}

// ----------------------------------------------------------------------------
// 7.2 Histogram
// ----------------------------------------------------------------------------

/// Sparse weighted histogram; buckets are kept sorted by index.
#[derive(Debug, Clone)]
pub struct WeightedHistogram {
    layout: HistogramLayout,
    buckets: SmallVec<[(u32, f64); 4]>,
    total_weight: f64,
}

impl WeightedHistogram {
    pub fn new(layout: HistogramLayout) -> Self {
        Self {
            layout,
            buckets: SmallVec::new(),
            total_weight: 0.0,
        }
    }

    /// Record a duration (microseconds, clamped to one hour) with a weight.
    #[inline]
    pub fn record(&mut self, micros: u64, weight: f64) {
        let index = self.layout.index_of(micros.min(HIGHEST_TRACKABLE_MICROS));
        match self.buckets.binary_search_by_key(&index, |(i, _)| *i) {
            Ok(pos) => self.buckets[pos].1 += weight,
            Err(pos) => self.buckets.insert(pos, (index, weight)),
        }
        self.total_weight += weight;
    }

    #[inline]
    pub fn record_duration(&mut self, duration: Duration, weight: f64) {
        self.record(duration_micros(duration), weight);
    }

    /// Round each bucket half away from zero; zero-count buckets are dropped.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut snapshot = HistogramSnapshot {
            values: Vec::with_capacity(self.buckets.len()),
            counts: Vec::with_capacity(self.buckets.len()),
        };
        for &(index, weight) in &self.buckets {
            let count = weight.round();
            if count < 1.0 {
                continue;
            }
            snapshot.values.push(self.layout.highest_equivalent_value(index) as f64);
            snapshot.counts.push(count as u64);
        }
        snapshot
    }

    #[inline]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn layout(&self) -> HistogramLayout {
        self.layout
    }
}

// ============================================================================
// SECTION 8: AGGREGATION TABLE
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Limits, Admission & Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLimits {
    pub max_transaction_groups: usize,
    pub max_transaction_groups_per_service: usize,
    pub max_services: usize,
}

/// Why an observation was routed into an overflow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverflowReason {
    PerServiceTransactionGroups,
    TransactionGroups,
    Services,
}

impl OverflowReason {
    pub const ALL: [OverflowReason; 3] = [
        OverflowReason::PerServiceTransactionGroups,
        OverflowReason::TransactionGroups,
        OverflowReason::Services,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowReason::PerServiceTransactionGroups => "per_service_txn_groups",
            OverflowReason::TransactionGroups => "txn_groups",
            OverflowReason::Services => "services",
        }
    }

    fn slot(&self) -> usize {
        match self {
            OverflowReason::PerServiceTransactionGroups => 0,
            OverflowReason::TransactionGroups => 1,
            OverflowReason::Services => 2,
        }
    }
}

impl Display for OverflowReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one table insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accumulated into an existing group record.
    Accumulated,
    /// A new group record was created.
    Created,
    /// Merged into an overflow record; `bucket_created` is set when this
    /// observation created that record.
    Overflowed { reason: OverflowReason, bucket_created: bool },
}

/// Monotonic aggregation counters, shared by every table of an aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorMetrics {
    active_groups: IntCounter,
    overflowed: IntCounterVec,
    overflowed_by_reason: [IntCounter; 3],
    skipped_events: IntCounter,
    publish_failures: IntCounter,
}

impl AggregatorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let active_groups = IntCounter::with_opts(Opts::new(
            "txmetrics_active_groups_total",
            "Group records created, overflow records included",
        ))?;
        let overflowed = IntCounterVec::new(
            Opts::new(
                "txmetrics_overflowed_total",
                "Observations merged into overflow records",
            ),
            &["reason"],
        )?;
        let overflowed_by_reason = [
            overflowed.get_metric_with_label_values(&[OverflowReason::ALL[0].as_str()])?,
            overflowed.get_metric_with_label_values(&[OverflowReason::ALL[1].as_str()])?,
            overflowed.get_metric_with_label_values(&[OverflowReason::ALL[2].as_str()])?,
        ];
        let skipped_events = IntCounter::with_opts(Opts::new(
            "txmetrics_skipped_events_total",
            "Events dropped before aggregation",
        ))?;
        let publish_failures = IntCounter::with_opts(Opts::new(
            "txmetrics_publish_failures_total",
            "Harvested batches the publisher rejected",
        ))?;

        Ok(Self {
            active_groups,
            overflowed,
            overflowed_by_reason,
            skipped_events,
            publish_failures,
        })
    }

    /// Register every counter with a prometheus registry.
    pub fn register(&self, registry: &PrometheusRegistry) -> prometheus::Result<()> {
        registry.register(Box::new(self.active_groups.clone()))?;
        registry.register(Box::new(self.overflowed.clone()))?;
        registry.register(Box::new(self.skipped_events.clone()))?;
        registry.register(Box::new(self.publish_failures.clone()))?;
        Ok(())
    }

    fn observe_admission(&self, admission: Admission) {
        match admission {
            Admission::Accumulated => {}
            Admission::Created => self.active_groups.inc(),
            Admission::Overflowed { reason, bucket_created } => {
                self.overflowed_by_reason[reason.slot()].inc();
                if bucket_created {
                    self.active_groups.inc();
                }
            }
        }
    }

    pub fn record_skipped_event(&self) {
        self.skipped_events.inc();
    }

    fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn snapshot(&self) -> MonitoringSnapshot {
        let [per_service, txn_groups, services] = &self.overflowed_by_reason;
        let overflowed_per_service_txn_groups = per_service.get();
        let overflowed_txn_groups = txn_groups.get();
        let overflowed_services = services.get();
        MonitoringSnapshot {
            active_groups: self.active_groups.get(),
            overflowed_per_service_txn_groups,
            overflowed_txn_groups,
            overflowed_services,
            overflowed_total: overflowed_per_service_txn_groups + overflowed_txn_groups + overflowed_services,
            skipped_events: self.skipped_events.get(),
            publish_failures: self.publish_failures.get(),
        }
    }
}

/// Point-in-time copy of [`AggregatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitoringSnapshot {
    pub active_groups: u64,
    pub overflowed_per_service_txn_groups: u64,
    pub overflowed_txn_groups: u64,
    pub overflowed_services: u64,
    pub overflowed_total: u64,
    pub skipped_events: u64,
    pub publish_failures: u64,
}

// ----------------------------------------------------------------------------
// 8.2 Records
// ----------------------------------------------------------------------------

/// One observation as seen by a table: timestamp already truncated to the
/// table's interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub timestamp: Timestamp,
    pub micros: u64,
    pub weight: f64,
}

#[derive(Debug)]
struct GroupRecord {
    histogram: WeightedHistogram,
    duration_sum_micros: f64,
}

impl GroupRecord {
    fn new(layout: HistogramLayout) -> Self {
        Self {
            histogram: WeightedHistogram::new(layout),
            duration_sum_micros: 0.0,
        }
    }

    #[inline]
    fn record(&mut self, micros: u64, weight: f64) {
        self.histogram.record(micros, weight);
        self.duration_sum_micros += micros as f64 * weight;
    }

    /// Base output record; `None` when every bucket rounds to zero.
    fn to_metrics(&self, timestamp: Timestamp, interval: &CompactString) -> Option<TransactionMetrics> {
        let duration_histogram = self.histogram.snapshot();
        let doc_count = duration_histogram.total_count();
        if doc_count == 0 {
            return None;
        }
        Some(TransactionMetrics {
            timestamp,
            metricset_name: CompactString::from(METRICSET_NAME),
            interval: interval.clone(),
            doc_count,
            duration_histogram,
            duration_summary: DurationSummary {
                count: doc_count,
                sum: self.duration_sum_micros,
            },
            ..TransactionMetrics::default()
        })
    }
}

#[derive(Debug)]
struct OverflowRecord {
    timestamp: Timestamp,
    record: GroupRecord,
    merged_keys: AHashSet<u64>,
}

impl OverflowRecord {
    fn new(timestamp: Timestamp, layout: HistogramLayout) -> Self {
        Self {
            timestamp,
            record: GroupRecord::new(layout),
            merged_keys: AHashSet::new(),
        }
    }

    fn to_metrics(&self, interval: &CompactString, service: ServiceIdentity) -> Option<TransactionMetrics> {
        let mut metrics = self.record.to_metrics(self.timestamp, interval)?;
        metrics.transaction_name = CompactString::from(OVERFLOW_BUCKET_NAME);
        metrics.dimensions.service_name = service.name;
        metrics.dimensions.service_environment = service.environment;
        metrics.samples.push(MetricsetSample {
            name: CompactString::from(OVERFLOW_COUNT_SAMPLE),
            value: self.merged_keys.len() as f64,
        });
        Some(metrics)
    }
}

/// Merge into an overflow record, creating it on first use.
fn merge_overflow(
    bucket: &mut Option<OverflowRecord>,
    reason: OverflowReason,
    layout: HistogramLayout,
    key: &GroupKey,
    observation: Observation,
) -> Admission {
    let bucket_created = bucket.is_none();
    let record = bucket.get_or_insert_with(|| OverflowRecord::new(observation.timestamp, layout));
    record.merged_keys.insert(key.digest_at(observation.timestamp));
    record.record.record(observation.micros, observation.weight);
    Admission::Overflowed { reason, bucket_created }
}

#[derive(Debug, Default)]
struct ServiceEntry {
    groups: FastHashMap<TimedKey, Mutex<GroupRecord>>,
    overflow: Option<OverflowRecord>,
}

#[derive(Debug, Default)]
struct TableState {
    services: FastHashMap<ServiceIdentity, ServiceEntry>,
    global_overflow: Option<OverflowRecord>,
    total_groups: usize,
}

impl TableState {
    /// Admission under the write lock.
    fn admit(
        &mut self,
        limits: &TableLimits,
        layout: HistogramLayout,
        key: &GroupKey,
        service: &ServiceIdentity,
        observation: Observation,
    ) -> Admission {
        let TableState { services, global_overflow, total_groups } = self;
        let service_count = services.len();

        let entry = match services.entry(service.clone()) {
            FastEntry::Occupied(occupied) => occupied.into_mut(),
            FastEntry::Vacant(vacant) => {
                if service_count >= limits.max_services {
                    return merge_overflow(global_overflow, OverflowReason::Services, layout, key, observation);
                }
                vacant.insert(ServiceEntry::default())
            }
        };

        let lookup = TimedKeyRef { timestamp: observation.timestamp, key };
        if let Some(record) = entry.groups.get_mut(&lookup) {
            record.get_mut().record(observation.micros, observation.weight);
            return Admission::Accumulated;
        }

        let reason = if entry.groups.len() >= limits.max_transaction_groups_per_service {
            Some(OverflowReason::PerServiceTransactionGroups)
        } else if *total_groups >= limits.max_transaction_groups {
            Some(OverflowReason::TransactionGroups)
        } else {
            None
        };
        if let Some(reason) = reason {
            return merge_overflow(&mut entry.overflow, reason, layout, key, observation);
        }

        let mut record = GroupRecord::new(layout);
        record.record(observation.micros, observation.weight);
        entry.groups.insert(
            TimedKey { timestamp: observation.timestamp, key: key.clone() },
            Mutex::new(record),
        );
        *total_groups += 1;
        Admission::Created
    }
}

// ----------------------------------------------------------------------------
// 8.3 Table
// ----------------------------------------------------------------------------

/// Occupancy of a table, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub services: usize,
    pub groups: usize,
    pub max_groups_per_service: usize,
    pub overflow_records: usize,
}

/// Cardinality-bounded set of group records, partitioned by service.
///
/// Inserts for existing groups take the read lock and the record's own
/// mutex; creating groups or merging into overflow records takes the write
/// lock. Draining requires exclusive ownership.
pub struct AggregationTable {
    limits: TableLimits,
    layout: HistogramLayout,
    metrics: Arc<AggregatorMetrics>,
    state: RwLock<TableState>,
}

impl Debug for AggregationTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationTable")
            .field("limits", &self.limits)
            .field("layout", &self.layout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AggregationTable {
    pub fn new(limits: TableLimits, layout: HistogramLayout, metrics: Arc<AggregatorMetrics>) -> Self {
        Self {
            limits,
            layout,
            metrics,
            state: RwLock::new(TableState::default()),
        }
    }

    pub fn insert(&self, key: &GroupKey, service: &ServiceIdentity, observation: Observation) -> Admission {
        {
            let state = self.state.read();
            let lookup = TimedKeyRef { timestamp: observation.timestamp, key };
            if let Some(record) = state
                .services
                .get(service)
                .and_then(|entry| entry.groups.get(&lookup))
            {
                record.lock().record(observation.micros, observation.weight);
                return Admission::Accumulated;
            }
        }

        let admission = self
            .state
            .write()
            .admit(&self.limits, self.layout, key, service, observation);
        self.metrics.observe_admission(admission);

        if let Admission::Overflowed { reason, bucket_created: true } = admission {
            debug!(
                target: "txmetrics::table",
                service = %service.name,
                reason = %reason,
                "overflow bucket opened"
            );
        }
        admission
    }

    /// Export every record and leave the table empty, keeping its allocations.
    pub fn drain(&mut self, interval: &CompactString) -> Vec<TransactionMetrics> {
        let state = self.state.get_mut();
        let mut out = Vec::with_capacity(state.total_groups + state.services.len() + 1);

        for (service, entry) in state.services.drain() {
            for (timed, record) in entry.groups {
                let record = record.into_inner();
                if let Some(metrics) = record.to_metrics(timed.timestamp, interval) {
                    out.push(group_metrics(metrics, timed.key));
                }
            }
            if let Some(overflow) = entry.overflow {
                out.extend(overflow.to_metrics(interval, service));
            }
        }

        if let Some(overflow) = state.global_overflow.take() {
            let sentinel = ServiceIdentity::new(OVERFLOW_BUCKET_NAME, "");
            out.extend(overflow.to_metrics(interval, sentinel));
        }

        state.total_groups = 0;
        out
    }

    pub fn stats(&self) -> TableStats {
        let state = self.state.read();
        let overflow_records = state.services.values().filter(|e| e.overflow.is_some()).count()
            + usize::from(state.global_overflow.is_some());
        TableStats {
            services: state.services.len(),
            groups: state.total_groups,
            max_groups_per_service: state.services.values().map(|e| e.groups.len()).max().unwrap_or(0),
            overflow_records,
        }
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.services.is_empty() && state.global_overflow.is_none()
    }

    pub fn limits(&self) -> TableLimits {
        self.limits
    }
}

/// Fill the key fields of a group record's output.
fn group_metrics(mut metrics: TransactionMetrics, key: GroupKey) -> TransactionMetrics {
    metrics.transaction_name = key.transaction_name;
    metrics.transaction_type = key.transaction_type;
    metrics.transaction_result = key.transaction_result;
    metrics.transaction_root = key.root;
    metrics.event_outcome = key.event_outcome;
    metrics.dimensions = key.dimensions;
    metrics.labels = key.labels;
    metrics.numeric_labels = key
        .numeric_labels
        .into_iter()
        .map(|(name, value)| (name, value.into_inner()))
        .collect();
    metrics
}

// ============================================================================
// SECTION 9: INTERVAL SLOTS
// ============================================================================

/// A table pair bound to one cadence.
///
/// The active table sits behind an [`ArcSwap`]; harvest swaps the empty
/// standby in and drains the retired table once no writer holds it.
pub struct IntervalSlot {
    interval: Duration,
    label: CompactString,
    limits: TableLimits,
    layout: HistogramLayout,
    metrics: Arc<AggregatorMetrics>,
    active: ArcSwap<AggregationTable>,
    standby: Mutex<Option<AggregationTable>>,
}

impl Debug for IntervalSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalSlot")
            .field("interval", &self.interval)
            .field("label", &self.label)
            .field("active", &self.active.load().stats())
            .finish()
    }
}

impl IntervalSlot {
    pub fn new(
        interval: Duration,
        limits: TableLimits,
        layout: HistogramLayout,
        metrics: Arc<AggregatorMetrics>,
    ) -> Self {
        let active = AggregationTable::new(limits, layout, metrics.clone());
        let standby = AggregationTable::new(limits, layout, metrics.clone());
        Self {
            interval,
            label: interval_label(interval),
            limits,
            layout,
            metrics,
            active: ArcSwap::from_pointee(active),
            standby: Mutex::new(Some(standby)),
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Insert into the current active table.
    #[inline]
    pub fn ingest(
        &self,
        key: &GroupKey,
        service: &ServiceIdentity,
        timestamp: Timestamp,
        micros: u64,
        weight: f64,
    ) -> Admission {
        let observation = Observation {
            timestamp: timestamp.truncate(self.interval),
            micros,
            weight,
        };
        let table = self.active.load_full();
        table.insert(key, service, observation)
    }

    /// Swap tables and drain the retired one.
    ///
    /// Spins until writers that loaded the retired table before the swap
    /// are done with it; those writers never block, so the wait is short.
    pub fn harvest(&self) -> Vec<TransactionMetrics> {
        let mut retired = self.retire_active();
        let table = loop {
            match Arc::try_unwrap(retired) {
                Ok(table) => break table,
                Err(shared) => {
                    retired = shared;
                    std::thread::yield_now();
                }
            }
        };
        self.drain_retired(table)
    }

    /// [`IntervalSlot::harvest`] for async callers; yields to the runtime
    /// instead of the thread while writers finish with the retired table.
    pub async fn harvest_async(&self) -> Vec<TransactionMetrics> {
        let mut retired = self.retire_active();
        let table = loop {
            match Arc::try_unwrap(retired) {
                Ok(table) => break table,
                Err(shared) => {
                    retired = shared;
                    tokio::task::yield_now().await;
                }
            }
        };
        self.drain_retired(table)
    }

    fn retire_active(&self) -> Arc<AggregationTable> {
        let fresh = self
            .standby
            .lock()
            .take()
            .unwrap_or_else(|| AggregationTable::new(self.limits, self.layout, self.metrics.clone()));
        self.active.swap(Arc::new(fresh))
    }

    fn drain_retired(&self, mut table: AggregationTable) -> Vec<TransactionMetrics> {
        let records = table.drain(&self.label);
        *self.standby.lock() = Some(table);
        records
    }

    /// The first aligned boundary strictly after `after`'s bucket start.
    #[inline]
    pub fn next_boundary(&self, after: Timestamp) -> Timestamp {
        after.truncate(self.interval).add_duration(self.interval)
    }

    pub fn active_stats(&self) -> TableStats {
        self.active.load().stats()
    }
}

// ============================================================================
// SECTION 10: BATCH PROCESSORS
// ============================================================================

/// Consumer of event batches: the publisher of harvested metricsets and the
/// downstream of [`Aggregator::process_batch`].
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), PublishError>;
}

/// Accepts and discards every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopProcessor;

#[async_trait]
impl BatchProcessor for NopProcessor {
    async fn process_batch(&self, _batch: &mut Batch) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Adapts a synchronous closure into a [`BatchProcessor`].
pub struct ProcessBatchFn<F>(pub F);

impl<F> Debug for ProcessBatchFn<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ProcessBatchFn")
    }
}

#[async_trait]
impl<F> BatchProcessor for ProcessBatchFn<F>
where
    F: Fn(&mut Batch) -> Result<(), PublishError> + Send + Sync,
{
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), PublishError> {
        (self.0)(batch)
    }
}

/// Forwards a copy of every batch over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelProcessor {
    tx: mpsc::Sender<Batch>,
}

impl ChannelProcessor {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BatchProcessor for ChannelProcessor {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), PublishError> {
        self.tx.send(batch.clone()).await.map_err(|_| PublishError::Closed)
    }
}

/// Writes every event of a batch as JSON to an async writer.
pub struct JsonLinesPublisher<W> {
    writer: TokioMutex<W>,
    format: OutputFormat,
}

impl<W> Debug for JsonLinesPublisher<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesPublisher").field("format", &self.format).finish()
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self { writer: TokioMutex::new(writer), format }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> BatchProcessor for JsonLinesPublisher<W> {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), PublishError> {
        let mut buf = Vec::with_capacity(batch.len() * 512);
        for event in batch.iter() {
            match self.format {
                OutputFormat::Ndjson => serde_json::to_writer(&mut buf, event)?,
                OutputFormat::Pretty => serde_json::to_writer_pretty(&mut buf, event)?,
            }
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// SECTION 11: AGGREGATOR
// ============================================================================

/// Lifecycle of an [`Aggregator`]; transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Idle,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Lifecycle state plus the signal raised once the final flush is done.
///
/// Shared with the detached flush spawned by stopping an idle aggregator.
#[derive(Debug)]
struct Lifecycle {
    state: AtomicU8,
    stopped: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(LifecycleState::Idle as u8),
            stopped,
        }
    }

    #[inline]
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// Mark stopped without signalling; the flush may still be in flight.
    fn abandon(&self) {
        self.state.store(LifecycleState::Stopped as u8, AtomicOrdering::Release);
    }

    fn finish(&self) {
        self.abandon();
        self.stopped.send_replace(true);
        info!(target: "txmetrics::aggregator", "aggregator stopped");
    }

    /// Wait for [`Lifecycle::finish`], giving up after `deadline`.
    async fn wait_finished(&self, deadline: Duration) -> bool {
        let mut stopped = self.stopped.subscribe();
        let finished = tokio::time::timeout(deadline, stopped.wait_for(|done| *done))
            .await
            .is_ok();
        finished
    }
}

/// Transaction metrics aggregator.
///
/// Every event is fanned out to one [`IntervalSlot`] per configured interval.
/// [`Aggregator::run`] harvests each slot on wall-clock aligned boundaries
/// and hands non-empty harvests to the publisher.
pub struct Aggregator {
    slots: Vec<IntervalSlot>,
    publisher: Arc<dyn BatchProcessor>,
    downstream: Arc<dyn BatchProcessor>,
    metrics: Arc<AggregatorMetrics>,
    lifecycle: Arc<Lifecycle>,
    shutdown: CancellationToken,
}

impl Debug for Aggregator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("slots", &self.slots)
            .field("state", &self.state())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let limits = config.limits();
        let layout = HistogramLayout::new(config.histogram_significant_figures)?;
        let metrics = Arc::new(AggregatorMetrics::new()?);

        let AggregatorConfig { publisher, downstream, interval, rollup_intervals, .. } = config;
        let publisher = publisher.ok_or_else(|| ConfigError::invalid_value("publisher", "unspecified"))?;
        let downstream = downstream.unwrap_or_else(|| Arc::new(NopProcessor));

        let slots: Vec<IntervalSlot> = std::iter::once(interval)
            .chain(rollup_intervals)
            .map(|cadence| IntervalSlot::new(cadence, limits, layout, metrics.clone()))
            .collect();

        info!(
            target: "txmetrics::aggregator",
            intervals = ?slots.iter().map(IntervalSlot::label).collect::<Vec<_>>(),
            max_transaction_groups = limits.max_transaction_groups,
            max_transaction_groups_per_service = limits.max_transaction_groups_per_service,
            max_services = limits.max_services,
            significant_figures = layout.significant_figures(),
            "aggregator created"
        );

        Ok(Self {
            slots,
            publisher,
            downstream,
            metrics,
            lifecycle: Arc::new(Lifecycle::new()),
            shutdown: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn metrics(&self) -> &Arc<AggregatorMetrics> {
        &self.metrics
    }

    pub fn slots(&self) -> &[IntervalSlot] {
        &self.slots
    }

    /// Aggregate one transaction into every interval slot.
    ///
    /// Returns `false` when the event was skipped: non-positive or non-finite
    /// representative count, or the aggregator has stopped.
    pub fn ingest(&self, event: &TransactionEvent) -> bool {
        if self.state() == LifecycleState::Stopped {
            trace!(target: "txmetrics::aggregator", name = %event.name, "event after stop ignored");
            return false;
        }

        let weight = event.representative_count;
        if !weight.is_finite() || weight <= 0.0 {
            self.metrics.record_skipped_event();
            debug!(
                target: "txmetrics::aggregator",
                name = %event.name,
                representative_count = weight,
                "skipping transaction with non-positive representative count"
            );
            return false;
        }

        let key = GroupKey::from_event(event);
        let service = key.service();
        let timestamp = event.timestamp.unwrap_or_else(Timestamp::now);
        let micros = duration_micros(event.duration);

        for slot in &self.slots {
            slot.ingest(&key, &service, timestamp, micros, weight);
        }
        true
    }

    /// Aggregate the transactions of a batch, then forward it unmodified.
    pub async fn process_batch(&self, batch: &mut Batch) -> Result<(), PublishError> {
        for event in batch.iter() {
            if let ApmEvent::Transaction(transaction) = event {
                self.ingest(transaction);
            }
        }
        self.downstream.process_batch(batch).await
    }

    /// Drive harvests until [`Aggregator::stop`] is called, then flush.
    pub async fn run(&self) -> Result<(), LifecycleError> {
        if !self.lifecycle.transition(LifecycleState::Idle, LifecycleState::Running) {
            return match self.state() {
                LifecycleState::Running => Err(LifecycleError::AlreadyRunning),
                _ => Ok(()),
            };
        }

        info!(target: "txmetrics::aggregator", slots = self.slots.len(), "aggregator running");

        join_all(self.slots.iter().map(|slot| self.run_slot(slot))).await;

        debug!(target: "txmetrics::aggregator", "final flush");
        self.flush().await;
        self.lifecycle.finish();
        Ok(())
    }

    async fn run_slot(&self, slot: &IntervalSlot) {
        let mut boundary = slot.next_boundary(Timestamp::now());
        loop {
            let wait = boundary.duration_since(Timestamp::now());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.harvest_and_publish(slot).await;
            boundary = slot.next_boundary(boundary.max(Timestamp::now()));
        }
    }

    async fn harvest_and_publish(&self, slot: &IntervalSlot) {
        if let Some(batch) = harvest_batch(slot).await {
            publish_batch(self.publisher.as_ref(), &self.metrics, slot.label(), batch).await;
        }
    }

    async fn flush(&self) {
        join_all(self.slots.iter().map(|slot| self.harvest_and_publish(slot))).await;
    }

    /// Harvest every slot and hand the batches to a task that outlives
    /// [`Aggregator::stop`]'s deadline.
    async fn spawn_final_flush(&self) {
        let mut batches = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if let Some(batch) = harvest_batch(slot).await {
                batches.push((CompactString::from(slot.label()), batch));
            }
        }

        let publisher = self.publisher.clone();
        let metrics = self.metrics.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            join_all(
                batches
                    .into_iter()
                    .map(|(label, batch)| {
                        let publisher = publisher.clone();
                        let metrics = metrics.clone();
                        async move { publish_batch(publisher.as_ref(), &metrics, &label, batch).await }
                    }),
            )
            .await;
            lifecycle.finish();
        });
    }

    /// Stop harvesting, flush every slot and wait up to `deadline` for the
    /// final publish.
    ///
    /// The aggregator is `Stopped` afterwards even when the deadline is
    /// exceeded; a publish still in flight then completes in the background.
    pub async fn stop(&self, deadline: Duration) -> Result<(), LifecycleError> {
        if self.lifecycle.transition(LifecycleState::Idle, LifecycleState::Stopping) {
            info!(target: "txmetrics::aggregator", "stopping idle aggregator");
            self.shutdown.cancel();
            self.spawn_final_flush().await;
        } else if self.lifecycle.transition(LifecycleState::Running, LifecycleState::Stopping) {
            info!(target: "txmetrics::aggregator", "stopping aggregator");
        }
        self.shutdown.cancel();

        if self.lifecycle.wait_finished(deadline).await {
            return Ok(());
        }

        warn!(
            target: "txmetrics::aggregator",
            deadline = ?deadline,
            "final flush did not complete before deadline"
        );
        self.lifecycle.abandon();
        Err(LifecycleError::StopDeadlineExceeded { deadline })
    }
}

/// Harvest a slot into a publishable batch; `None` when nothing was aggregated.
async fn harvest_batch(slot: &IntervalSlot) -> Option<Batch> {
    let records = slot.harvest_async().await;
    if records.is_empty() {
        trace!(target: "txmetrics::aggregator", interval = slot.label(), "nothing to publish");
        return None;
    }
    Some(
        records
            .into_iter()
            .map(|metrics| ApmEvent::Metricset(Box::new(metrics)))
            .collect(),
    )
}

async fn publish_batch(
    publisher: &dyn BatchProcessor,
    metrics: &AggregatorMetrics,
    interval: &str,
    mut batch: Batch,
) {
    let count = batch.len();
    debug!(
        target: "txmetrics::aggregator",
        interval,
        metricsets = count,
        "publishing transaction metrics"
    );

    if let Err(err) = publisher.process_batch(&mut batch).await {
        metrics.record_publish_failure();
        warn!(
            target: "txmetrics::aggregator",
            interval,
            metricsets = count,
            error = %err,
            "failed to publish transaction metrics"
        );
    }
}

// ============================================================================
// SECTION 12: CLI & MAIN ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 CLI Definition
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "txmetrics",
    author,
    version,
    about = "Cardinality-bounded transaction metrics aggregation",
    long_about = "Reads transaction events as NDJSON, aggregates them into duration \
                  histograms per group and interval, and writes the harvested \
                  metricsets as NDJSON."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "txmetrics.toml", env = "TXMETRICS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "TXMETRICS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "TXMETRICS_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Aggregate events until EOF or Ctrl-C
    Run {
        /// NDJSON event file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 12.2 Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> TxMetricsResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{s}"),
                    Err(e) => println!("Failed to serialize: {e}"),
                }
            }

            let aggregation = &config.aggregation;
            println!("\n📊 Configuration Summary:");
            println!("  • Interval: {}", interval_label(aggregation.interval));
            let rollups: Vec<_> = aggregation.rollup_intervals.iter().map(|d| interval_label(*d)).collect();
            println!("  • Roll-ups: {}", rollups.join(", "));
            println!("  • Max transaction groups: {}", aggregation.max_transaction_groups);
            println!("  • Max groups per service: {}", aggregation.max_transaction_groups_per_service);
            println!("  • Max services: {}", aggregation.max_services);
            println!("  • Significant figures: {}", aggregation.histogram_significant_figures);
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {e}");
            Err(TxMetricsError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> TxMetricsResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            std::fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{ENGINE_FULL_NAME} v{ENGINE_VERSION}");
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Bounded transaction groups with overflow buckets");
    println!("  • Weighted HDR duration histograms");
    println!("  • Aligned multi-interval roll-ups");
}

// ----------------------------------------------------------------------------
// 12.3 Pipeline
// ----------------------------------------------------------------------------

/// Decode NDJSON events and feed them to the aggregator in batches.
/// Returns the number of lines that could not be decoded.
async fn ingest_lines<R>(aggregator: &Aggregator, reader: R) -> TxMetricsResult<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut batch: Batch = Vec::with_capacity(INGEST_BATCH_SIZE);
    let mut rejected = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ApmEvent>(&line) {
            Ok(event) => batch.push(event),
            Err(e) => {
                rejected += 1;
                aggregator.metrics().record_skipped_event();
                warn!(target: "txmetrics::cli", line = line_no, error = %e, "skipping undecodable event");
            }
        }
        if batch.len() >= INGEST_BATCH_SIZE {
            aggregator.process_batch(&mut batch).await?;
            batch.clear();
        }
    }

    if !batch.is_empty() {
        aggregator.process_batch(&mut batch).await?;
    }
    Ok(rejected)
}

async fn run_pipeline(config: EngineConfig, input: Option<PathBuf>) -> AnyhowResult<()> {
    let publisher: Arc<dyn BatchProcessor> = match &config.output.path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            Arc::new(JsonLinesPublisher::new(file, config.output.format))
        }
        None => Arc::new(JsonLinesPublisher::new(tokio::io::stdout(), config.output.format)),
    };

    let aggregator = Arc::new(Aggregator::new(config.aggregation.into_config(publisher, None)?)?);
    let registry = PrometheusRegistry::new();
    aggregator.metrics().register(&registry)?;

    let runner = tokio::spawn({
        let aggregator = aggregator.clone();
        async move { aggregator.run().await }
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input file {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    tokio::select! {
        result = ingest_lines(&aggregator, reader) => {
            let rejected = result?;
            info!(target: "txmetrics::cli", rejected, "input exhausted");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(target: "txmetrics::cli", "interrupt received");
        }
    }

    if let Err(e) = aggregator.stop(config.aggregation.stop_timeout).await {
        warn!(target: "txmetrics::cli", error = %e, "shutdown incomplete");
    }
    runner.await??;

    let snapshot = aggregator.metrics().snapshot();
    info!(
        target: "txmetrics::cli",
        active_groups = snapshot.active_groups,
        overflowed = snapshot.overflowed_total,
        skipped = snapshot.skipped_events,
        publish_failures = snapshot.publish_failures,
        "aggregation finished"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 12.4 Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!(target: "txmetrics::engine", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!(target: "txmetrics::engine", "Config file not found at {}, using defaults", cli.config.display());
    }

    let input = match cli.command {
        Some(Commands::Run { input }) => input,
        _ => None,
    };
    run_pipeline(config, input).await
}

// ============================================================================
// SECTION 13: TESTS
// ============================================================================




#[cfg(test)]
mod admission_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_admission_bound_and_count_conservation(
            max_services in 1usize..4,
            per_service in 1usize..6,
            max_groups in 1usize..12,
            events in proptest::collection::vec((0u8..6, 0u8..10), 1..200),
        ) {
            let metrics = Arc::new(AggregatorMetrics::new().unwrap());
            let limits = TableLimits {
                max_transaction_groups: max_groups,
                max_transaction_groups_per_service: per_service,
                max_services,
            };
            let mut table = AggregationTable::new(limits, HistogramLayout::new(2).unwrap(), metrics.clone());

            for (svc, name) in &events {
                let event = TransactionEvent::new(format!("txn-{name}")).with_service(format!("svc-{svc}"));
                let key = GroupKey::from_event(&event);
                table.insert(&key, &key.service(), Observation {
                    timestamp: Timestamp::EPOCH,
                    micros: 500,
                    weight: 1.0,
                });
                let stats = table.stats();
                prop_assert!(stats.groups <= max_groups);
                prop_assert!(stats.services <= max_services);
                prop_assert!(stats.max_groups_per_service <= per_service);
            }

            let records = table.drain(&CompactString::from("1s"));
            let total: u64 = records.iter().map(|r| r.doc_count).sum();
            prop_assert_eq!(total, events.len() as u64);
            prop_assert_eq!(metrics.snapshot().active_groups, records.len() as u64);
        }
    }
}


#[cfg(test)]
mod aggregator_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use test_case::test_case;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn base_config(publisher: Arc<dyn BatchProcessor>, interval: Duration) -> AggregatorConfig {
        AggregatorConfig {
            publisher: Some(publisher),
            interval,
            max_transaction_groups: 1_000,
            max_transaction_groups_per_service: 1_000,
            max_services: 100,
            histogram_significant_figures: 2,
            ..AggregatorConfig::default()
        }
    }

    fn metricsets(batch: &Batch) -> Vec<TransactionMetrics> {
        batch.iter().filter_map(ApmEvent::as_metricset).cloned().collect()
    }

    async fn recv_batch(rx: &mut mpsc::Receiver<Batch>) -> Batch {
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("publisher channel closed")
    }

    #[test]
    fn test_config_validation_order() {
        let publisher: Arc<dyn BatchProcessor> = Arc::new(NopProcessor);
        let mut config = AggregatorConfig::default();
        let expect = |config: &AggregatorConfig, message: &str| {
            let err = Aggregator::new(config.clone()).unwrap_err();
            assert_eq!(err.to_string(), format!("invalid aggregator config: {message}"));
        };

        expect(&config, "publisher unspecified");
        config.publisher = Some(publisher);
        expect(&config, "max_transaction_groups unspecified or zero");
        config.max_transaction_groups = 1;
        expect(&config, "max_transaction_groups_per_service unspecified or zero");
        config.max_transaction_groups_per_service = 1;
        expect(&config, "max_services unspecified or zero");
        config.max_services = 1;
        expect(&config, "interval unspecified or zero");
        config.interval = Duration::from_secs(1);
        config.rollup_intervals = vec![Duration::from_secs(10), Duration::ZERO];
        expect(&config, "rollup_intervals entry 1 is zero");
        config.rollup_intervals = vec![Duration::from_secs(10)];
        expect(&config, "histogram_significant_figures (0) outside range [1,5]");
        config.histogram_significant_figures = 6;
        expect(&config, "histogram_significant_figures (6) outside range [1,5]");
        config.histogram_significant_figures = 5;
        assert!(Aggregator::new(config).is_ok());
    }

    #[tokio::test]
    async fn test_non_positive_weights_are_skipped() {
        let (publisher, mut rx) = ChannelProcessor::new(4);
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(1))).unwrap();

        for count in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let event = TransactionEvent::new("txn").with_representative_count(count);
            assert!(!aggregator.ingest(&event));
        }
        assert_eq!(aggregator.metrics().snapshot().skipped_events, 4);

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    /// Publisher that takes `delay` per batch before reporting delivery.
    #[derive(Debug)]
    struct SlowProcessor {
        delay: Duration,
        delivered: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BatchProcessor for SlowProcessor {
        async fn process_batch(&self, _batch: &mut Batch) -> Result<(), PublishError> {
            tokio::time::sleep(self.delay).await;
            self.delivered.store(true, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test_case(0, 500 ; "even split")]
    #[test_case(400, 1_500 ; "weighted fast transactions")]
    #[tokio::test]
    async fn test_rollups_aggregate_independently(weighted_fast: usize, fast_count: u64) {
        let (publisher, mut rx) = ChannelProcessor::new(8);
        let mut config = base_config(Arc::new(publisher), Duration::from_millis(10));
        config.rollup_intervals = vec![Duration::from_millis(200), Duration::from_secs(1)];
        config.histogram_significant_figures = 1;
        let aggregator = Arc::new(Aggregator::new(config).unwrap());

        let now = Timestamp::now();
        for i in 0..1000 {
            let (name, duration) = if i % 2 == 0 {
                ("fast", Duration::from_millis(100))
            } else {
                ("slow", Duration::from_secs(1))
            };
            let event = TransactionEvent::new(name)
                .with_service("api")
                .with_duration(duration)
                .with_timestamp(now)
                .with_label("team", LabelValue::global("core"));
            assert!(aggregator.ingest(&event));
        }
        for _ in 0..weighted_fast {
            let event = TransactionEvent::new("fast")
                .with_service("api")
                .with_duration(Duration::from_millis(100))
                .with_timestamp(now)
                .with_representative_count(2.5)
                .with_label("team", LabelValue::global("core"));
            aggregator.ingest(&event);
        }

        let runner = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.run().await }
        });
        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        runner.await.unwrap().unwrap();

        let mut by_interval = BTreeMap::new();
        for _ in 0..3 {
            let batch = recv_batch(&mut rx).await;
            let records = metricsets(&batch);
            let interval = records[0].interval.clone();
            assert!(records.iter().all(|r| r.interval == interval));
            assert!(by_interval.insert(interval, records).is_none());
        }
        assert!(rx.try_recv().is_err());

        for (label, cadence) in [
            ("10ms", Duration::from_millis(10)),
            ("200ms", Duration::from_millis(200)),
            ("1s", Duration::from_secs(1)),
        ] {
            let records = &by_interval[label];
            assert_eq!(records.len(), 2, "interval {label}");
            for record in records {
                assert_eq!(record.timestamp, now.truncate(cadence));
                assert_eq!(record.labels.get("team").map(CompactString::as_str), Some("core"));
                let expected = if record.transaction_name == "fast" { fast_count } else { 500 };
                assert_eq!(record.doc_count, expected, "interval {label}");
                assert_eq!(record.duration_histogram.total_count(), expected);
            }
        }
        assert_eq!(aggregator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_stop_deadline_leaves_handoff_running() {
        let delivered = Arc::new(AtomicBool::new(false));
        let publisher = SlowProcessor { delay: Duration::from_millis(200), delivered: delivered.clone() };
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap();
        assert!(aggregator.ingest(&TransactionEvent::new("txn")));

        let deadline = Duration::from_millis(20);
        assert_eq!(
            aggregator.stop(deadline).await,
            Err(LifecycleError::StopDeadlineExceeded { deadline })
        );
        assert_eq!(aggregator.state(), LifecycleState::Stopped);
        assert!(!aggregator.ingest(&TransactionEvent::new("txn")));
        assert!(!delivered.load(AtomicOrdering::SeqCst));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(delivered.load(AtomicOrdering::SeqCst));
        assert_eq!(aggregator.stop(deadline).await, Ok(()));
    }

    #[tokio::test]
    async fn test_running_stop_deadline_leaves_handoff_running() {
        let delivered = Arc::new(AtomicBool::new(false));
        let publisher = SlowProcessor { delay: Duration::from_millis(200), delivered: delivered.clone() };
        let aggregator = Arc::new(
            Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap(),
        );
        let runner = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.run().await }
        });
        while aggregator.state() != LifecycleState::Running {
            tokio::task::yield_now().await;
        }
        assert!(aggregator.ingest(&TransactionEvent::new("txn")));

        let deadline = Duration::from_millis(20);
        assert_eq!(
            aggregator.stop(deadline).await,
            Err(LifecycleError::StopDeadlineExceeded { deadline })
        );
        assert_eq!(aggregator.state(), LifecycleState::Stopped);

        tokio::time::timeout(RECV_TIMEOUT, runner).await.unwrap().unwrap().unwrap();
        assert!(delivered.load(AtomicOrdering::SeqCst));
        assert_eq!(aggregator.stop(deadline).await, Ok(()));
    }

    #[tokio::test]
    async fn test_timestamps_bucketed_per_interval() {
        let (publisher, mut rx) = ChannelProcessor::new(4);
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(30))).unwrap();

        for secs in [0, 15, 30] {
            aggregator.ingest(&TransactionEvent::new("txn").with_timestamp(Timestamp::from_secs(secs)));
        }
        aggregator.stop(RECV_TIMEOUT).await.unwrap();

        let mut records = metricsets(&recv_batch(&mut rx).await);
        records.sort_by_key(|r| r.timestamp);
        let summary: Vec<_> = records.iter().map(|r| (r.timestamp, r.doc_count)).collect();
        assert_eq!(
            summary,
            vec![(Timestamp::from_secs(0), 2), (Timestamp::from_secs(30), 1)]
        );
    }

    #[tokio::test]
    async fn test_every_grouping_field_splits_groups() {
        let (publisher, mut rx) = ChannelProcessor::new(4);
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap();

        let mut event = TransactionEvent::default().with_timestamp(Timestamp::EPOCH);
        let mut expected = 0usize;
        let mut ingest_twice = |event: &TransactionEvent| {
            assert!(aggregator.ingest(event));
            assert!(aggregator.ingest(event));
            expected += 1;
        };

        for value in ["something", "anything"] {
            event.name = value.into();
            ingest_twice(&event);
            event.transaction_type = value.into();
            ingest_twice(&event);
            event.result = value.into();
            ingest_twice(&event);
            event.outcome = value.into();
            ingest_twice(&event);
        }
        for field in Dimensions::FIELDS {
            for value in ["something", "anything"] {
                *event.dimensions.field_mut(field).unwrap() = value.into();
                ingest_twice(&event);
            }
        }
        for coldstart in [false, true] {
            event.dimensions.faas_coldstart = Some(coldstart);
            ingest_twice(&event);
        }
        for value in ["something", "anything"] {
            event.labels.insert("tier".into(), LabelValue::global(value));
            ingest_twice(&event);
        }
        for value in [1.0, 2.0] {
            event.numeric_labels.insert("weight".into(), NumericLabelValue::global(value));
            ingest_twice(&event);
        }
        event.parent_id = Some("parent".into());
        ingest_twice(&event);

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        let records = metricsets(&recv_batch(&mut rx).await);
        assert_eq!(records.len(), expected);
        assert!(records.iter().all(|r| r.doc_count == 2 && !r.is_overflow()));
        assert_eq!(aggregator.metrics().snapshot().overflowed_total, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_and_schedule_continues() {
        let (tx, mut rx) = mpsc::channel::<usize>(8);
        let publisher = ProcessBatchFn(move |batch: &mut Batch| -> Result<(), PublishError> {
            let _ = tx.try_send(batch.len());
            Err(PublishError::rejected("report failed"))
        });
        let aggregator = Arc::new(
            Aggregator::new(base_config(Arc::new(publisher), Duration::from_millis(10))).unwrap(),
        );
        let runner = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.run().await }
        });

        for _ in 0..2 {
            aggregator.ingest(&TransactionEvent::new("txn").with_duration(Duration::from_millis(5)));
            let published = tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await.unwrap();
            assert_eq!(published, Some(1));
        }

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(aggregator.metrics().snapshot().publish_failures, 2);
    }

    #[tokio::test]
    async fn test_groups_reset_after_each_publish() {
        let (publisher, mut rx) = ChannelProcessor::new(8);
        let aggregator = Arc::new(
            Aggregator::new(base_config(Arc::new(publisher), Duration::from_millis(10))).unwrap(),
        );
        let runner = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.run().await }
        });

        for round in 1..=5u64 {
            aggregator.ingest(&TransactionEvent::new("txn").with_service("api"));
            let records = metricsets(&recv_batch(&mut rx).await);
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].doc_count, 1);
            let snapshot = aggregator.metrics().snapshot();
            assert_eq!(snapshot.active_groups, round);
            assert_eq!(snapshot.overflowed_total, 0);
        }

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_process_batch_forwards_and_propagates_errors() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let downstream = ProcessBatchFn({
            let forwarded = forwarded.clone();
            move |batch: &mut Batch| -> Result<(), PublishError> {
                forwarded.fetch_add(batch.len(), AtomicOrdering::SeqCst);
                Err(PublishError::rejected("downstream unavailable"))
            }
        });
        let mut config = base_config(Arc::new(NopProcessor), Duration::from_secs(60));
        config.downstream = Some(Arc::new(downstream));
        let aggregator = Aggregator::new(config).unwrap();

        let mut batch: Batch = vec![
            ApmEvent::Transaction(TransactionEvent::new("txn").with_service("api")),
            ApmEvent::Span(serde_json::json!({ "name": "SELECT" })),
        ];
        let err = aggregator.process_batch(&mut batch).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected { .. }));
        assert_eq!(forwarded.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(aggregator.metrics().snapshot().active_groups, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lifecycle_transitions() {
        let (publisher, _rx) = ChannelProcessor::new(8);
        let aggregator = Arc::new(Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap());
        assert_eq!(aggregator.state(), LifecycleState::Idle);

        let runner = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.run().await }
        });
        for _ in 0..500 {
            if aggregator.state() == LifecycleState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(aggregator.state(), LifecycleState::Running);
        assert_eq!(aggregator.run().await, Err(LifecycleError::AlreadyRunning));

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(aggregator.state(), LifecycleState::Stopped);

        assert!(aggregator.stop(RECV_TIMEOUT).await.is_ok());
        assert_eq!(aggregator.run().await, Ok(()));
        assert!(!aggregator.ingest(&TransactionEvent::new("late")));
    }

    #[tokio::test]
    async fn test_stop_on_idle_flushes_inline() {
        let (publisher, mut rx) = ChannelProcessor::new(4);
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap();
        aggregator.ingest(&TransactionEvent::new("txn").with_timestamp(Timestamp::EPOCH));

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        assert_eq!(aggregator.state(), LifecycleState::Stopped);
        let batch = rx.try_recv().unwrap();
        assert_eq!(metricsets(&batch)[0].transaction_name, "txn");
    }

    #[tokio::test]
    async fn test_ingest_lines_skips_undecodable() {
        let (publisher, mut rx) = ChannelProcessor::new(4);
        let aggregator = Aggregator::new(base_config(Arc::new(publisher), Duration::from_secs(60))).unwrap();
        let input = concat!(
            r#"{"processor":"transaction","name":"GET /","duration":"150ms","@timestamp":"2024-01-01T00:00:10Z","dimensions":{"service_name":"api"}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"processor":"transaction","name":"GET /","duration":"250ms","@timestamp":"2024-01-01T00:00:20Z","dimensions":{"service_name":"api"}}"#,
            "\n",
        );

        let rejected = ingest_lines(&aggregator, BufReader::new(input.as_bytes())).await.unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(aggregator.metrics().snapshot().skipped_events, 1);

        aggregator.stop(RECV_TIMEOUT).await.unwrap();
        let records = metricsets(&recv_batch(&mut rx).await);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].doc_count, 2);
        assert_eq!(records[0].duration_summary.sum, 400_000.0);
        assert_eq!(records[0].timestamp, Timestamp::from_secs(1_704_067_200));
    }

    #[tokio::test]
    async fn test_json_lines_publisher_writes_one_line_per_event() {
        let publisher = JsonLinesPublisher::new(Vec::<u8>::new(), OutputFormat::Ndjson);
        let record = TransactionMetrics {
            transaction_name: "txn".into(),
            interval: "1m".into(),
            doc_count: 3,
            ..TransactionMetrics::default()
        };
        let mut batch: Batch = vec![
            ApmEvent::Metricset(Box::new(record.clone())),
            ApmEvent::Metricset(Box::new(record)),
        ];
        publisher.process_batch(&mut batch).await.unwrap();

        let output = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["processor"], "metricset");
        assert_eq!(value["transaction_name"], "txn");
        assert_eq!(value["doc_count"], 3);
    }
}
