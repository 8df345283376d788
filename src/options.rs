use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How records sharing a primary key are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeEngine {
    Deduplicate,
    PartialUpdate,
    Aggregation,
}

/// How a changelog stream is produced for a primary-key table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangelogProducer {
    None,
    Input,
    Lookup,
    FullCompaction,
}

/// Whether a table without a primary key keeps a changelog of value
/// counts or is a plain append stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    AppendOnly,
    ChangeLog,
}

/// Where a streaming or batch read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    Default,
    LatestFull,
    Latest,
    CompactedFull,
    FromTimestamp,
    FromSnapshot,
}

const KNOWN_KEYS: &[&str] = &[
    "bucket",
    "write-mode",
    "bucket-key",
    "file.format",
    "manifest.format",
    "manifest.target-file-size",
    "manifest.merge-min-count",
    "write-buffer-size",
    "page-size",
    "write-buffer-spillable",
    "num-levels",
    "num-sorted-run.compaction-trigger",
    "num-sorted-run.stop-trigger",
    "target-file-size",
    "sort-spill-threshold",
    "split.target-size",
    "split.open-file-cost",
    "compaction.max-size-amplification-percent",
    "compaction.size-ratio",
    "merge-engine",
    "partial-update.ignore-delete",
    "sequence.field",
    "changelog-producer",
    "changelog-producer.compaction-interval",
    "snapshot.time-retained",
    "snapshot.num-retained.min",
    "snapshot.num-retained.max",
    "partition.expiration-time",
    "partition.expiration-check-interval",
    "partition.timestamp-pattern",
    "partition.timestamp-formatter",
    "partition.default-name",
    "scan.mode",
    "scan.timestamp-millis",
    "scan.snapshot-id",
    "continuous.discovery-interval",
    "write-only",
    "commit.force-compact",
    "commit.max-retries",
];

/// Parsed table options. Construction is strict: an unrecognized key or a
/// malformed value fails with [`Error::ConfigInvalid`] naming the key.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    raw: HashMap<String, String>,

    pub bucket: usize,
    pub bucket_key: Vec<String>,
    pub write_mode: WriteMode,
    pub file_format: String,
    pub manifest_format: String,
    pub manifest_target_file_size: u64,
    pub manifest_merge_min_count: usize,

    pub write_buffer_size: u64,
    pub page_size: u64,
    write_buffer_spillable: Option<bool>,

    pub num_levels: usize,
    pub num_sorted_run_compaction_trigger: usize,
    pub num_sorted_run_stop_trigger: usize,
    pub target_file_size: u64,
    pub sort_spill_threshold: Option<usize>,
    pub split_target_size: u64,
    pub split_open_file_cost: u64,

    pub max_size_amplification_percent: u64,
    pub sorted_run_size_ratio: u64,

    pub merge_engine: MergeEngine,
    pub partial_update_ignore_delete: bool,
    pub field_aggregates: HashMap<String, String>,
    pub field_ignore_retract: HashMap<String, bool>,
    pub sequence_field: Option<String>,

    pub changelog_producer: ChangelogProducer,
    pub changelog_compaction_interval: Duration,

    pub snapshot_time_retained: Duration,
    pub snapshot_num_retained_min: usize,
    pub snapshot_num_retained_max: usize,

    pub partition_expiration_time: Option<Duration>,
    pub partition_expiration_check_interval: Duration,
    pub partition_timestamp_pattern: Option<String>,
    pub partition_timestamp_formatter: Option<String>,
    pub partition_default_name: String,

    pub scan_mode: ScanMode,
    pub scan_timestamp_millis: Option<i64>,
    pub scan_snapshot_id: Option<i64>,
    pub continuous_discovery_interval: Duration,

    pub write_only: bool,
    pub commit_force_compact: bool,
    pub commit_max_retries: usize,
}

impl CoreOptions {
    pub fn defaults() -> Self {
        Self::from_map(HashMap::new()).expect("defaults must parse")
    }

    pub fn from_map(map: HashMap<String, String>) -> Result<Self> {
        for key in map.keys() {
            if !Self::is_known_key(key) {
                return Err(Error::ConfigInvalid(format!("unrecognized option '{key}'")));
            }
        }

        let mut field_aggregates = HashMap::new();
        let mut field_ignore_retract = HashMap::new();
        for (key, value) in &map {
            if let Some(rest) = key.strip_prefix("fields.") {
                if let Some(field) = rest.strip_suffix(".aggregate-function") {
                    field_aggregates.insert(field.to_string(), value.clone());
                } else if let Some(field) = rest.strip_suffix(".ignore-retract") {
                    field_ignore_retract.insert(field.to_string(), parse_bool(key, value)?);
                }
            }
        }

        let get = |key: &str| map.get(key).map(String::as_str);

        let num_sorted_run_compaction_trigger =
            parse_or("num-sorted-run.compaction-trigger", get("num-sorted-run.compaction-trigger"), 5, parse_usize)?;
        let num_sorted_run_stop_trigger =
            parse_or("num-sorted-run.stop-trigger", get("num-sorted-run.stop-trigger"), 10, parse_usize)?;
        if num_sorted_run_stop_trigger < num_sorted_run_compaction_trigger {
            return Err(Error::ConfigInvalid(
                "'num-sorted-run.stop-trigger' must not be less than \
                 'num-sorted-run.compaction-trigger'"
                    .to_string(),
            ));
        }

        let options = CoreOptions {
            bucket: parse_or("bucket", get("bucket"), 1, parse_usize)?,
            write_mode: match get("write-mode").unwrap_or("change-log") {
                "change-log" => WriteMode::ChangeLog,
                "append-only" => WriteMode::AppendOnly,
                other => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown value '{other}' for 'write-mode'"
                    )))
                }
            },
            bucket_key: get("bucket-key")
                .map(parse_csv)
                .unwrap_or_default(),
            file_format: get("file.format").unwrap_or("parquet").to_string(),
            manifest_format: get("manifest.format").unwrap_or("json").to_string(),
            manifest_target_file_size: parse_or("manifest.target-file-size", get("manifest.target-file-size"),
                8 * 1024 * 1024,
                parse_mem_size,
            )?,
            manifest_merge_min_count: parse_or("manifest.merge-min-count", get("manifest.merge-min-count"), 30, parse_usize)?,
            write_buffer_size: parse_or("write-buffer-size", get("write-buffer-size"),
                256 * 1024 * 1024,
                parse_mem_size,
            )?,
            page_size: parse_or("page-size", get("page-size"), 64 * 1024, parse_mem_size)?,
            write_buffer_spillable: get("write-buffer-spillable")
                .map(|v| parse_bool("write-buffer-spillable", v))
                .transpose()?,
            num_levels: parse_or("num-levels", get("num-levels"), 6, parse_usize)?,
            num_sorted_run_compaction_trigger,
            num_sorted_run_stop_trigger,
            target_file_size: parse_or("target-file-size", get("target-file-size"), 128 * 1024 * 1024, parse_mem_size)?,
            sort_spill_threshold: get("sort-spill-threshold")
                .map(|v| parse_usize("sort-spill-threshold", v))
                .transpose()?,
            split_target_size: parse_or("split.target-size", get("split.target-size"), 128 * 1024 * 1024, parse_mem_size)?,
            split_open_file_cost: parse_or("split.open-file-cost", get("split.open-file-cost"), 4 * 1024 * 1024, parse_mem_size)?,
            max_size_amplification_percent: parse_or("compaction.max-size-amplification-percent", get("compaction.max-size-amplification-percent"),
                200,
                parse_u64,
            )?,
            sorted_run_size_ratio: parse_or("compaction.size-ratio", get("compaction.size-ratio"), 1, parse_u64)?,
            merge_engine: match get("merge-engine").unwrap_or("deduplicate") {
                "deduplicate" => MergeEngine::Deduplicate,
                "partial-update" => MergeEngine::PartialUpdate,
                "aggregation" => MergeEngine::Aggregation,
                other => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown value '{other}' for 'merge-engine'"
                    )))
                }
            },
            partial_update_ignore_delete: parse_or("partial-update.ignore-delete", get("partial-update.ignore-delete"),
                false,
                parse_bool,
            )?,
            field_aggregates,
            field_ignore_retract,
            sequence_field: get("sequence.field").map(str::to_string),
            changelog_producer: match get("changelog-producer").unwrap_or("none") {
                "none" => ChangelogProducer::None,
                "input" => ChangelogProducer::Input,
                "lookup" => ChangelogProducer::Lookup,
                "full-compaction" => ChangelogProducer::FullCompaction,
                other => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown value '{other}' for 'changelog-producer'"
                    )))
                }
            },
            changelog_compaction_interval: parse_or("changelog-producer.compaction-interval", get("changelog-producer.compaction-interval"),
                Duration::from_secs(30 * 60),
                parse_duration,
            )?,
            snapshot_time_retained: parse_or("snapshot.time-retained", get("snapshot.time-retained"),
                Duration::from_secs(3600),
                parse_duration,
            )?,
            snapshot_num_retained_min: parse_or("snapshot.num-retained.min", get("snapshot.num-retained.min"), 10, parse_usize)?,
            snapshot_num_retained_max: parse_or("snapshot.num-retained.max", get("snapshot.num-retained.max"),
                i32::MAX as usize,
                parse_usize,
            )?,
            partition_expiration_time: get("partition.expiration-time")
                .map(|v| parse_duration("partition.expiration-time", v))
                .transpose()?,
            partition_expiration_check_interval: parse_or("partition.expiration-check-interval", get("partition.expiration-check-interval"),
                Duration::from_secs(3600),
                parse_duration,
            )?,
            partition_timestamp_pattern: get("partition.timestamp-pattern").map(str::to_string),
            partition_timestamp_formatter: get("partition.timestamp-formatter").map(str::to_string),
            partition_default_name: get("partition.default-name")
                .unwrap_or("__DEFAULT_PARTITION__")
                .to_string(),
            scan_mode: match get("scan.mode").unwrap_or("default") {
                "default" => ScanMode::Default,
                "latest-full" => ScanMode::LatestFull,
                "latest" => ScanMode::Latest,
                "compacted-full" => ScanMode::CompactedFull,
                "from-timestamp" => ScanMode::FromTimestamp,
                "from-snapshot" => ScanMode::FromSnapshot,
                other => {
                    return Err(Error::ConfigInvalid(format!(
                        "unknown value '{other}' for 'scan.mode'"
                    )))
                }
            },
            scan_timestamp_millis: get("scan.timestamp-millis")
                .map(|v| parse_i64("scan.timestamp-millis", v))
                .transpose()?,
            scan_snapshot_id: get("scan.snapshot-id")
                .map(|v| parse_i64("scan.snapshot-id", v))
                .transpose()?,
            continuous_discovery_interval: parse_or("continuous.discovery-interval", get("continuous.discovery-interval"),
                Duration::from_secs(10),
                parse_duration,
            )?,
            write_only: parse_or("write-only", get("write-only"), false, parse_bool)?,
            commit_force_compact: parse_or("commit.force-compact", get("commit.force-compact"), false, parse_bool)?,
            commit_max_retries: parse_or("commit.max-retries", get("commit.max-retries"), 10, parse_usize)?,
            raw: map,
        };

        if options.bucket == 0 {
            return Err(Error::ConfigInvalid("'bucket' must be at least 1".to_string()));
        }
        if options.num_levels < 2 {
            return Err(Error::ConfigInvalid("'num-levels' must be at least 2".to_string()));
        }
        if options.snapshot_num_retained_min == 0 {
            return Err(Error::ConfigInvalid(
                "'snapshot.num-retained.min' must be at least 1".to_string(),
            ));
        }
        if options.snapshot_num_retained_max < options.snapshot_num_retained_min {
            return Err(Error::ConfigInvalid(
                "'snapshot.num-retained.max' must not be less than 'snapshot.num-retained.min'"
                    .to_string(),
            ));
        }
        if options.manifest_format != "json" {
            return Err(Error::ConfigInvalid(format!(
                "unknown value '{}' for 'manifest.format'",
                options.manifest_format
            )));
        }
        Ok(options)
    }

    fn is_known_key(key: &str) -> bool {
        if KNOWN_KEYS.contains(&key) {
            return true;
        }
        key.strip_prefix("fields.")
            .map(|rest| rest.ends_with(".aggregate-function") || rest.ends_with(".ignore-retract"))
            .unwrap_or(false)
    }

    /// Spill defaults to on for object stores, off locally.
    pub fn write_buffer_spillable(&self, is_object_store: bool) -> bool {
        self.write_buffer_spillable.unwrap_or(is_object_store)
    }

    pub fn to_map(&self) -> &HashMap<String, String> {
        &self.raw
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self::defaults()
    }
}

fn parse_or<T>(
    key: &str,
    value: Option<&str>,
    default: T,
    parse: impl Fn(&str, &str) -> Result<T>,
) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => parse(key, v),
    }
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::ConfigInvalid(format!(
            "invalid boolean '{other}' for '{key}'"
        ))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid integer '{value}' for '{key}'")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid integer '{value}' for '{key}'")))
}

fn parse_i64(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid integer '{value}' for '{key}'")))
}

/// Parse sizes like `128mb`, `8 kb`, `1gb` or plain byte counts.
fn parse_mem_size(key: &str, value: &str) -> Result<u64> {
    let text = value.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid size '{value}' for '{key}'")))?;
    let factor = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::ConfigInvalid(format!(
                "invalid size unit '{other}' for '{key}'"
            )))
        }
    };
    Ok(number * factor)
}

/// Parse durations like `10s`, `30 min`, `1h`, `7d` or `250ms`.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let text = value.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid duration '{value}' for '{key}'")))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(number),
        "" | "s" | "sec" => Duration::from_secs(number),
        "min" | "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 3600),
        "d" => Duration::from_secs(number * 86400),
        other => {
            return Err(Error::ConfigInvalid(format!(
                "invalid duration unit '{other}' for '{key}'"
            )))
        }
    };
    Ok(duration)
}
