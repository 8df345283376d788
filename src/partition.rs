use chrono::{NaiveDate, NaiveDateTime};
use tracing::info;

use crate::{
    commit::{FileStoreCommit, ManifestCommittable, MAINTENANCE_COMMIT_IDENTIFIER},
    error::{Error, Result},
    predicate::Predicate,
    row::{Datum, Row},
    scan::FileStoreScan,
    schema::RowType,
};

/// Directory segments for one partition value, `k1=v1/k2=v2/...`; a NULL
/// value renders as the configured default partition name.
pub fn partition_path(partition: &Row, partition_type: &RowType, default_name: &str) -> Vec<String> {
    partition_type
        .fields()
        .iter()
        .zip(partition.fields())
        .map(|(field, datum)| {
            let value = if datum.is_null() {
                default_name.to_string()
            } else {
                datum.to_string()
            };
            format!("{}={}", field.name, value)
        })
        .collect()
}

/// Extracts a timestamp from partition values using the
/// `partition.timestamp-pattern` / `partition.timestamp-formatter` pair.
///
/// The pattern substitutes `$column` placeholders (`$dt $hh:00:00`); when
/// absent, the single partition column's value is used directly. The
/// formatter follows the date-pattern letters of the original system
/// (`yyyy-MM-dd HH:mm:ss`).
pub struct PartitionTimeExtractor {
    pattern: Option<String>,
    format: String,
    date_only: bool,
}

impl PartitionTimeExtractor {
    pub fn new(pattern: Option<String>, formatter: Option<String>) -> Self {
        let formatter = formatter.unwrap_or_else(|| "yyyy-MM-dd".to_string());
        let date_only = !formatter.contains("HH");
        PartitionTimeExtractor {
            pattern,
            format: to_chrono_format(&formatter),
            date_only,
        }
    }

    pub fn extract(&self, partition_keys: &[String], values: &[Datum]) -> Result<NaiveDateTime> {
        let text = match &self.pattern {
            None => {
                let datum = values.first().ok_or_else(|| {
                    Error::ConfigInvalid("partition expiration needs a partition column".to_string())
                })?;
                datum.to_string()
            }
            Some(pattern) => {
                let mut text = pattern.clone();
                // longer names first so `$dth` never matches `$dt`
                let mut order: Vec<usize> = (0..partition_keys.len()).collect();
                order.sort_by_key(|i| std::cmp::Reverse(partition_keys[*i].len()));
                for i in order {
                    text = text.replace(
                        &format!("${}", partition_keys[i]),
                        &values[i].to_string(),
                    );
                }
                text
            }
        };

        if self.date_only {
            let date = NaiveDate::parse_from_str(&text, &self.format).map_err(|err| {
                Error::ConfigInvalid(format!("cannot parse partition time '{text}': {err}"))
            })?;
            Ok(date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        } else {
            NaiveDateTime::parse_from_str(&text, &self.format).map_err(|err| {
                Error::ConfigInvalid(format!("cannot parse partition time '{text}': {err}"))
            })
        }
    }
}

fn to_chrono_format(java_format: &str) -> String {
    java_format
        .replace("yyyy", "%Y")
        .replace("MM", "%m")
        .replace("dd", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S")
}

/// Drops whole partitions whose extracted timestamp fell out of the
/// expiration window, via one OVERWRITE commit per check.
pub struct PartitionExpire {
    partition_keys: Vec<String>,
    expiration: chrono::Duration,
    check_interval: chrono::Duration,
    extractor: PartitionTimeExtractor,
    scan: FileStoreScan,
    commit: FileStoreCommit,
    last_check: NaiveDateTime,
}

impl PartitionExpire {
    pub fn new(
        partition_type: &RowType,
        expiration: std::time::Duration,
        check_interval: std::time::Duration,
        extractor: PartitionTimeExtractor,
        scan: FileStoreScan,
        commit: FileStoreCommit,
    ) -> Self {
        PartitionExpire {
            partition_keys: partition_type
                .fields()
                .iter()
                .map(|f| f.name.clone())
                .collect(),
            expiration: chrono::Duration::from_std(expiration)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            check_interval: chrono::Duration::from_std(check_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            extractor,
            scan,
            commit,
            last_check: chrono::Utc::now().naive_utc(),
        }
    }

    pub fn expire(&mut self) -> Result<()> {
        self.expire_at(chrono::Utc::now().naive_utc())
    }

    /// Runs on the check-interval clock; `now` is injectable for tests.
    pub fn expire_at(&mut self, now: NaiveDateTime) -> Result<()> {
        if now <= self.last_check + self.check_interval {
            return Ok(());
        }
        self.do_expire(now - self.expiration)?;
        self.last_check = now;
        Ok(())
    }

    fn do_expire(&self, expire_before: NaiveDateTime) -> Result<()> {
        let mut expired: Vec<Row> = Vec::new();
        for partition in self.scan.list_partitions()? {
            let time = self
                .extractor
                .extract(&self.partition_keys, partition.fields())?;
            if time < expire_before {
                expired.push(partition);
            }
        }
        if expired.is_empty() {
            return Ok(());
        }
        info!(partitions = expired.len(), "expiring partitions");

        let filter = Predicate::or(
            expired
                .into_iter()
                .map(|partition| {
                    Predicate::and(
                        partition
                            .fields()
                            .iter()
                            .enumerate()
                            .map(|(i, datum)| {
                                Predicate::equal(i, self.partition_keys[i].clone(), datum.clone())
                            })
                            .collect(),
                    )
                })
                .collect(),
        );

        // the sentinel identifier keeps maintenance commits out of the
        // idempotence bookkeeping of real writers
        let committable = ManifestCommittable::new(MAINTENANCE_COMMIT_IDENTIFIER);
        self.commit.overwrite(Some(filter), &committable)
    }
}
