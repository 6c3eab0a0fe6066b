// Per-device bookkeeping for write-on-change history.
//
// The ledger remembers which bucket was written last and what went into
// it, so repeated observations inside one bucket cost nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::{FieldValue, TrackedField};

/// Start of the bucket containing `at`, in epoch seconds.
pub fn bucket_of(at: DateTime<Utc>, width_secs: i64) -> i64 {
    let width = width_secs.max(1);
    at.timestamp().div_euclid(width) * width
}

/// What an accepted value does to the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWrite {
    /// First value in a newer bucket: a record with the full current
    /// state was written.
    NewBucket,
    /// Same bucket, different value: merged into the existing record.
    Merged,
    /// Older than the last written bucket: merged into that older record
    /// without moving the ledger.
    Late,
    /// Same bucket, same value as already written.
    Skipped,
}

#[derive(Debug, Default)]
pub(crate) struct BucketLedger {
    last_saved: Option<i64>,
    written: BTreeMap<TrackedField, FieldValue>,
}

impl BucketLedger {
    /// Seed from a stored bucket after a restart.
    pub(crate) fn from_record(bucket: i64, fields: BTreeMap<TrackedField, FieldValue>) -> Self {
        Self {
            last_saved: Some(bucket),
            written: fields,
        }
    }

    pub(crate) fn last_saved(&self) -> Option<i64> {
        self.last_saved
    }

    pub(crate) fn plan(&self, bucket: i64, field: TrackedField, value: FieldValue) -> HistoryWrite {
        match self.last_saved {
            Some(last) if bucket == last => {
                if self.written.get(&field) == Some(&value) {
                    HistoryWrite::Skipped
                } else {
                    HistoryWrite::Merged
                }
            }
            Some(last) if bucket < last => HistoryWrite::Late,
            _ => HistoryWrite::NewBucket,
        }
    }

    /// Record a completed write. `snapshot` is what a new bucket was
    /// written with.
    pub(crate) fn commit(
        &mut self,
        bucket: i64,
        write: HistoryWrite,
        field: TrackedField,
        value: FieldValue,
        snapshot: &BTreeMap<TrackedField, FieldValue>,
    ) {
        match write {
            HistoryWrite::NewBucket => {
                self.last_saved = Some(bucket);
                self.written.clone_from(snapshot);
            }
            HistoryWrite::Merged => {
                self.written.insert(field, value);
            }
            HistoryWrite::Late | HistoryWrite::Skipped => {}
        }
    }
}
