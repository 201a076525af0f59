//! Scan metrics and their JSON form.
//!
//! [`ScanMetrics`] is the live, thread-safe set of timers and counters a
//! scan records into. [`ScanMetrics::result`] freezes it into a
//! [`ScanMetricsResult`], which is what gets reported and serialized.
//!
//! JSON layout of a result (metric names are the keys; metrics that were
//! never recorded are omitted):
//!
//! ```json
//! {
//!   "total-planning-duration": { "count": 1, "time-unit": "nanoseconds", "total-duration": 2644235116 },
//!   "result-data-files": { "unit": "count", "value": 1 },
//!   "total-file-size-in-bytes": { "unit": "bytes", "value": 10 }
//! }
//! ```
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

/// Metric name: time spent planning the scan.
pub const TOTAL_PLANNING_DURATION: &str = "total-planning-duration";
/// Metric name: data files returned.
pub const RESULT_DATA_FILES: &str = "result-data-files";
/// Metric name: delete files returned.
pub const RESULT_DELETE_FILES: &str = "result-delete-files";
/// Metric name: manifests with data files.
pub const TOTAL_DATA_MANIFESTS: &str = "total-data-manifests";
/// Metric name: manifests with delete files.
pub const TOTAL_DELETE_MANIFESTS: &str = "total-delete-manifests";
/// Metric name: data manifests read.
pub const SCANNED_DATA_MANIFESTS: &str = "scanned-data-manifests";
/// Metric name: data manifests skipped.
pub const SKIPPED_DATA_MANIFESTS: &str = "skipped-data-manifests";
/// Metric name: bytes in returned data files.
pub const TOTAL_FILE_SIZE_IN_BYTES: &str = "total-file-size-in-bytes";
/// Metric name: bytes in returned delete files.
pub const TOTAL_DELETE_FILE_SIZE_IN_BYTES: &str = "total-delete-file-size-in-bytes";

/// Errors raised while encoding or decoding metrics JSON.
#[derive(Debug, Snafu)]
pub enum MetricsJsonError {
    /// Not valid JSON, or JSON of the wrong shape.
    #[snafu(display("Invalid scan metrics JSON: {source}"))]
    Json {
        /// JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Unit a timer reports its total duration in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanoseconds,
    /// Microseconds.
    Microseconds,
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl TimeUnit {
    fn nanos(self) -> u128 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60 * 1_000_000_000,
            TimeUnit::Hours => 3_600 * 1_000_000_000,
            TimeUnit::Days => 86_400 * 1_000_000_000,
        }
    }

    /// Whole units in `duration`.
    pub fn convert(self, duration: Duration) -> u64 {
        u64::try_from(duration.as_nanos() / self.nanos()).unwrap_or(u64::MAX)
    }

    /// Duration of `amount` units.
    pub fn duration(self, amount: u64) -> Duration {
        let nanos = u128::from(amount) * self.nanos();
        let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
        Duration::new(secs, (nanos % 1_000_000_000) as u32)
    }
}

/// Unit of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    /// Unitless.
    Undefined,
    /// A number of things.
    Count,
    /// A number of bytes.
    Bytes,
}

/// Frozen value of a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerResult {
    /// Metric name.
    pub name: String,
    /// Unit `total_duration` is reported in.
    pub time_unit: TimeUnit,
    /// Sum of all recorded durations.
    pub total_duration: Duration,
    /// Number of recordings.
    pub count: u64,
}

/// Frozen value of a counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterResult {
    /// Metric name.
    pub name: String,
    /// Unit of `value`.
    pub unit: MetricUnit,
    /// Counter value.
    pub value: u64,
}

/// Live counter. A no-op counter ignores increments and has no result.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    unit: MetricUnit,
    value: Option<AtomicU64>,
}

impl Counter {
    fn new(name: &'static str, unit: MetricUnit) -> Self {
        Self {
            name,
            unit,
            value: Some(AtomicU64::new(0)),
        }
    }

    fn noop(name: &'static str, unit: MetricUnit) -> Self {
        Self {
            name,
            unit,
            value: None,
        }
    }

    /// Add one.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Add `amount`.
    pub fn increment_by(&self, amount: u64) {
        if let Some(value) = &self.value {
            value.fetch_add(amount, Ordering::Relaxed);
        }
    }

    /// Current value, or `None` for a no-op counter.
    pub fn result(&self) -> Option<CounterResult> {
        self.value.as_ref().map(|v| CounterResult {
            name: self.name.to_string(),
            unit: self.unit,
            value: v.load(Ordering::Relaxed),
        })
    }
}

#[derive(Debug, Default)]
struct TimerState {
    total_nanos: AtomicU64,
    count: AtomicU64,
}

/// Live timer recording in nanoseconds. A no-op timer has no result.
#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    state: Option<TimerState>,
}

impl Timer {
    /// Record one duration.
    pub fn record(&self, duration: Duration) {
        if let Some(state) = &self.state {
            let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
            state.total_nanos.fetch_add(nanos, Ordering::Relaxed);
            state.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value, or `None` for a no-op timer.
    pub fn result(&self) -> Option<TimerResult> {
        self.state.as_ref().map(|s| TimerResult {
            name: self.name.to_string(),
            time_unit: TimeUnit::Nanoseconds,
            total_duration: Duration::from_nanos(s.total_nanos.load(Ordering::Relaxed)),
            count: s.count.load(Ordering::Relaxed),
        })
    }
}

/// Live metrics of one scan.
#[derive(Debug)]
pub struct ScanMetrics {
    /// Planning time.
    pub total_planning_duration: Timer,
    /// Data files returned.
    pub result_data_files: Counter,
    /// Delete files returned.
    pub result_delete_files: Counter,
    /// Manifests with data files.
    pub total_data_manifests: Counter,
    /// Manifests with delete files.
    pub total_delete_manifests: Counter,
    /// Data manifests read.
    pub scanned_data_manifests: Counter,
    /// Data manifests skipped.
    pub skipped_data_manifests: Counter,
    /// Bytes in returned data files.
    pub total_file_size_in_bytes: Counter,
    /// Bytes in returned delete files.
    pub total_delete_file_size_in_bytes: Counter,
}

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    /// Metrics that record.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Metrics that record nothing and report nothing.
    pub fn noop() -> Self {
        Self::build(false)
    }

    fn build(live: bool) -> Self {
        let counter = |name, unit| {
            if live {
                Counter::new(name, unit)
            } else {
                Counter::noop(name, unit)
            }
        };
        Self {
            total_planning_duration: Timer {
                name: TOTAL_PLANNING_DURATION,
                state: live.then(TimerState::default),
            },
            result_data_files: counter(RESULT_DATA_FILES, MetricUnit::Count),
            result_delete_files: counter(RESULT_DELETE_FILES, MetricUnit::Count),
            total_data_manifests: counter(TOTAL_DATA_MANIFESTS, MetricUnit::Count),
            total_delete_manifests: counter(TOTAL_DELETE_MANIFESTS, MetricUnit::Count),
            scanned_data_manifests: counter(SCANNED_DATA_MANIFESTS, MetricUnit::Count),
            skipped_data_manifests: counter(SKIPPED_DATA_MANIFESTS, MetricUnit::Count),
            total_file_size_in_bytes: counter(TOTAL_FILE_SIZE_IN_BYTES, MetricUnit::Bytes),
            total_delete_file_size_in_bytes: counter(
                TOTAL_DELETE_FILE_SIZE_IN_BYTES,
                MetricUnit::Bytes,
            ),
        }
    }

    /// Freeze the current values.
    pub fn result(&self) -> ScanMetricsResult {
        ScanMetricsResult {
            total_planning_duration: self.total_planning_duration.result(),
            result_data_files: self.result_data_files.result(),
            result_delete_files: self.result_delete_files.result(),
            total_data_manifests: self.total_data_manifests.result(),
            total_delete_manifests: self.total_delete_manifests.result(),
            scanned_data_manifests: self.scanned_data_manifests.result(),
            skipped_data_manifests: self.skipped_data_manifests.result(),
            total_file_size_in_bytes: self.total_file_size_in_bytes.result(),
            total_delete_file_size_in_bytes: self.total_delete_file_size_in_bytes.result(),
        }
    }
}

/// Frozen scan metrics. `None` marks a metric that was never recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MetricsRecord", into = "MetricsRecord")]
pub struct ScanMetricsResult {
    /// Planning time.
    pub total_planning_duration: Option<TimerResult>,
    /// Data files returned.
    pub result_data_files: Option<CounterResult>,
    /// Delete files returned.
    pub result_delete_files: Option<CounterResult>,
    /// Manifests with data files.
    pub total_data_manifests: Option<CounterResult>,
    /// Manifests with delete files.
    pub total_delete_manifests: Option<CounterResult>,
    /// Data manifests read.
    pub scanned_data_manifests: Option<CounterResult>,
    /// Data manifests skipped.
    pub skipped_data_manifests: Option<CounterResult>,
    /// Bytes in returned data files.
    pub total_file_size_in_bytes: Option<CounterResult>,
    /// Bytes in returned delete files.
    pub total_delete_file_size_in_bytes: Option<CounterResult>,
}

impl ScanMetricsResult {
    /// Compact JSON object keyed by metric name.
    pub fn to_json_string(&self) -> Result<String, MetricsJsonError> {
        serde_json::to_string(self).context(JsonSnafu)
    }

    /// Parse the JSON produced by [`ScanMetricsResult::to_json_string`].
    /// Missing keys become `None`; unknown keys are ignored.
    pub fn from_json_str(json: &str) -> Result<Self, MetricsJsonError> {
        serde_json::from_str(json).context(JsonSnafu)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TimerRecord {
    count: u64,
    time_unit: TimeUnit,
    total_duration: u64,
}

impl From<TimerResult> for TimerRecord {
    fn from(timer: TimerResult) -> Self {
        Self {
            count: timer.count,
            time_unit: timer.time_unit,
            total_duration: timer.time_unit.convert(timer.total_duration),
        }
    }
}

impl TimerRecord {
    fn named(self, name: &str) -> TimerResult {
        TimerResult {
            name: name.to_string(),
            time_unit: self.time_unit,
            total_duration: self.time_unit.duration(self.total_duration),
            count: self.count,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CounterRecord {
    unit: MetricUnit,
    value: u64,
}

impl From<CounterResult> for CounterRecord {
    fn from(counter: CounterResult) -> Self {
        Self {
            unit: counter.unit,
            value: counter.value,
        }
    }
}

impl CounterRecord {
    fn named(self, name: &str) -> CounterResult {
        CounterResult {
            name: name.to_string(),
            unit: self.unit,
            value: self.value,
        }
    }
}

/// JSON form of [`ScanMetricsResult`]. Metric names live in the keys.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MetricsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_planning_duration: Option<TimerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_data_files: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_delete_files: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_data_manifests: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_delete_manifests: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scanned_data_manifests: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skipped_data_manifests: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_file_size_in_bytes: Option<CounterRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_delete_file_size_in_bytes: Option<CounterRecord>,
}

impl From<ScanMetricsResult> for MetricsRecord {
    fn from(result: ScanMetricsResult) -> Self {
        Self {
            total_planning_duration: result.total_planning_duration.map(Into::into),
            result_data_files: result.result_data_files.map(Into::into),
            result_delete_files: result.result_delete_files.map(Into::into),
            total_data_manifests: result.total_data_manifests.map(Into::into),
            total_delete_manifests: result.total_delete_manifests.map(Into::into),
            scanned_data_manifests: result.scanned_data_manifests.map(Into::into),
            skipped_data_manifests: result.skipped_data_manifests.map(Into::into),
            total_file_size_in_bytes: result.total_file_size_in_bytes.map(Into::into),
            total_delete_file_size_in_bytes: result.total_delete_file_size_in_bytes.map(Into::into),
        }
    }
}

impl From<MetricsRecord> for ScanMetricsResult {
    fn from(record: MetricsRecord) -> Self {
        let counter = |c: Option<CounterRecord>, name: &str| c.map(|c| c.named(name));
        Self {
            total_planning_duration: record
                .total_planning_duration
                .map(|t| t.named(TOTAL_PLANNING_DURATION)),
            result_data_files: counter(record.result_data_files, RESULT_DATA_FILES),
            result_delete_files: counter(record.result_delete_files, RESULT_DELETE_FILES),
            total_data_manifests: counter(record.total_data_manifests, TOTAL_DATA_MANIFESTS),
            total_delete_manifests: counter(record.total_delete_manifests, TOTAL_DELETE_MANIFESTS),
            scanned_data_manifests: counter(record.scanned_data_manifests, SCANNED_DATA_MANIFESTS),
            skipped_data_manifests: counter(record.skipped_data_manifests, SKIPPED_DATA_MANIFESTS),
            total_file_size_in_bytes: counter(
                record.total_file_size_in_bytes,
                TOTAL_FILE_SIZE_IN_BYTES,
            ),
            total_delete_file_size_in_bytes: counter(
                record.total_delete_file_size_in_bytes,
                TOTAL_DELETE_FILE_SIZE_IN_BYTES,
            ),
        }
    }
}

/// What a scan of a table planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScanReport {
    /// Table name.
    pub table_name: String,
    /// Scanned snapshot; `None` for a table without snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
    /// Planning metrics.
    pub metrics: ScanMetricsResult,
}

impl ScanReport {
    /// Assemble a report.
    pub fn new(
        table_name: impl Into<String>,
        snapshot_id: Option<i64>,
        metrics: ScanMetricsResult,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            snapshot_id,
            metrics,
        }
    }
}
