//! Sequence-gap detection and one-at-a-time recovery.
//!
//! [`RecordSet`] keys decoded records by sequence number. [`reconcile`] walks
//! `1..=max` over a snapshot of the set's gaps, asks a [`Recover`]
//! implementation for every hole in ascending order, and merges what came
//! back once the walk is finished.
//!
//! Gaps are kept as runs ([`Gap`]), never as one entry per missing sequence:
//! a single garbled frame can claim a sequence near `i32::MAX`.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::Record;

/// A run of consecutive missing sequences, `first..=last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub first: i32,
    pub last: i32,
}

impl Gap {
    pub fn new(first: i32, last: i32) -> Self {
        Self { first, last }
    }

    /// Number of sequences in the run.
    pub fn len(&self) -> u64 {
        (i64::from(self.last) - i64::from(self.first) + 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn sequences(&self) -> std::ops::RangeInclusive<i32> {
        self.first..=self.last
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}..={}", self.first, self.last)
        }
    }
}

/// Total number of sequences covered by `gaps`.
pub fn gap_count(gaps: &[Gap]) -> u64 {
    gaps.iter().map(Gap::len).sum()
}

/// Records keyed by their own sequence number.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<i32, Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record` under its sequence. The first record seen for a sequence
    /// wins; returns `false` if one was already present.
    pub fn insert(&mut self, record: Record) -> bool {
        match self.records.entry(record.sequence) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, sequence: i32) -> Option<&Record> {
        self.records.get(&sequence)
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.records.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest sequence present.
    pub fn max_sequence(&self) -> Option<i32> {
        self.records.keys().next_back().copied()
    }

    /// Runs of missing sequences in `[1, max]`, ascending. Records above
    /// `max` are ignored.
    pub fn gaps_within(&self, max: i32) -> impl Iterator<Item = Gap> + '_ {
        let present = (max >= 1).then(|| self.records.range(1..=max)).into_iter().flatten();
        present
            .map(|(&seq, _)| i64::from(seq))
            // sentinel one past the bound closes a trailing run
            .chain(std::iter::once(i64::from(max) + 1))
            .scan(0i64, |prev, seq| {
                let gap = (seq > *prev + 1).then(|| Gap::new((*prev + 1) as i32, (seq - 1) as i32));
                *prev = seq;
                Some(gap)
            })
            .flatten()
    }

    /// Runs of missing sequences in `[1, max_sequence]`, ascending.
    pub fn gaps(&self) -> impl Iterator<Item = Gap> + '_ {
        self.gaps_within(self.max_sequence().unwrap_or(0))
    }

    /// Every sequence in `[1, max_sequence]` with no record, ascending, lazily.
    pub fn missing(&self) -> impl Iterator<Item = i32> + '_ {
        self.gaps().flat_map(|gap| gap.sequences())
    }

    /// `true` when `[1, max_sequence]` has no holes.
    pub fn is_complete(&self) -> bool {
        self.gaps().next().is_none()
    }

    /// Records in ascending sequence order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

/// Source of individual records by sequence number.
///
/// Errors for which [`Error::is_recoverable`](crate::Error::is_recoverable)
/// holds leave that sequence unfilled; any other error aborts reconciliation.
pub trait Recover {
    fn fetch_by_sequence(&mut self, sequence: i32) -> Result<Record>;
}

impl<F> Recover for F
where
    F: FnMut(i32) -> Result<Record>,
{
    fn fetch_by_sequence(&mut self, sequence: i32) -> Result<Record> {
        self(sequence)
    }
}

/// Counters from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Recovery requests issued, one per missing sequence.
    pub requested: u64,
    pub recovered: u64,
    /// Runs still absent after the pass, within the range that was walked.
    pub unresolved: Vec<Gap>,
    /// Responses whose decoded sequence differed from the one requested.
    pub mismatched: u64,
    /// Requests the recovery channel could not address at all.
    pub out_of_range: u64,
}

/// Fills every gap in `[1, max_sequence]` using `source`, one request at a
/// time in ascending order.
///
/// The walk is bounded by the highest sequence present before the call.
/// Recovered records are keyed by their decoded sequence, even when that
/// falls outside the walked range. A response for a sequence that is already
/// present does not replace the existing record.
///
/// # Errors
/// Returns the first non-recoverable error from `source`; the set is left
/// as it was before the call.
pub fn reconcile<R: Recover + ?Sized>(
    set: &mut RecordSet,
    source: &mut R,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();
    let Some(max) = set.max_sequence() else {
        debug!("no records to reconcile");
        return Ok(stats);
    };
    let gaps: Vec<Gap> = set.gaps_within(max).collect();
    if gaps.is_empty() {
        debug!(max, "no gaps");
        return Ok(stats);
    }
    info!(missing = gap_count(&gaps), runs = gaps.len(), max, "recovering missing sequences");

    let mut recovered = Vec::new();
    for sequence in gaps.iter().flat_map(Gap::sequences) {
        debug!(sequence, "missing packet detected");
        stats.requested += 1;
        match source.fetch_by_sequence(sequence) {
            Ok(record) => {
                if record.sequence != sequence {
                    warn!(
                        requested = sequence,
                        received = record.sequence,
                        "recovered packet carries a different sequence"
                    );
                    stats.mismatched += 1;
                }
                debug!(sequence = record.sequence, "retrieved missing packet");
                recovered.push(record);
            }
            Err(Error::SequenceOutOfRange(_)) => {
                // one summary line below instead of one per sequence
                stats.out_of_range += 1;
            }
            Err(e) if e.is_recoverable() => {
                warn!(sequence, error = %e, "leaving sequence unfilled");
            }
            Err(e) => return Err(e),
        }
    }
    if stats.out_of_range > 0 {
        warn!(count = stats.out_of_range, "sequences beyond the resend field left unfilled");
    }

    for record in recovered {
        let sequence = record.sequence;
        if set.insert(record) {
            stats.recovered += 1;
        } else {
            debug!(sequence, "ignoring recovered duplicate");
        }
    }
    stats.unresolved = set.gaps_within(max).collect();
    info!(
        requested = stats.requested,
        recovered = stats.recovered,
        unresolved = gap_count(&stats.unresolved),
        "reconciliation finished"
    );
    Ok(stats)
}
