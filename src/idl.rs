//! Candidate sets: index-derived sets of entry identifiers.
//!
//! A set is either an explicit ascending, duplicate-free list bounded by a
//! maximum cardinality, or an inclusive range standing for every identifier
//! in the interval. Once an explicit list would grow past its bound it
//! degrades to the range covering it; a range is always a superset of the
//! exact answer, which is fine because candidates are re-tested against the
//! full filter.

use crate::types::EntryId;

/// Default bound on explicit candidate lists.
pub const DEFAULT_MAX_IDS: usize = 1 << 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CandidateSet {
    /// Ascending, duplicate-free identifiers.
    Ids(Vec<EntryId>),
    /// Every identifier in `[first, last]`.
    Range { first: EntryId, last: EntryId },
}

impl CandidateSet {
    pub fn empty() -> Self {
        CandidateSet::Ids(Vec::new())
    }

    pub fn singleton(id: EntryId) -> Self {
        CandidateSet::Ids(vec![id])
    }

    /// Range over `[first, last]`; an inverted interval is empty.
    pub fn range(first: EntryId, last: EntryId) -> Self {
        if first > last {
            CandidateSet::empty()
        } else {
            CandidateSet::Range { first, last }
        }
    }

    /// The whole identifier space.
    pub fn all() -> Self {
        CandidateSet::Range {
            first: EntryId(1),
            last: EntryId(u64::MAX),
        }
    }

    /// Build from arbitrary identifiers, sorting and deduplicating.
    pub fn from_ids(ids: impl IntoIterator<Item = EntryId>, max_ids: usize) -> Self {
        let mut ids: Vec<EntryId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self::bounded(ids, max_ids)
    }

    fn bounded(ids: Vec<EntryId>, max_ids: usize) -> Self {
        if ids.len() > max_ids {
            match (ids.first(), ids.last()) {
                (Some(&first), Some(&last)) => CandidateSet::Range { first, last },
                _ => CandidateSet::empty(),
            }
        } else {
            CandidateSet::Ids(ids)
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, CandidateSet::Range { .. })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CandidateSet::Ids(ids) => ids.is_empty(),
            CandidateSet::Range { first, last } => first > last,
        }
    }

    /// Cardinality; a range counts every identifier it covers.
    pub fn len(&self) -> u64 {
        match self {
            CandidateSet::Ids(ids) => ids.len() as u64,
            CandidateSet::Range { first, last } => {
                if first > last {
                    0
                } else {
                    (last.0 - first.0).saturating_add(1)
                }
            }
        }
    }

    pub fn first(&self) -> Option<EntryId> {
        match self {
            CandidateSet::Ids(ids) => ids.first().copied(),
            CandidateSet::Range { first, last } => (first <= last).then_some(*first),
        }
    }

    pub fn last(&self) -> Option<EntryId> {
        match self {
            CandidateSet::Ids(ids) => ids.last().copied(),
            CandidateSet::Range { first, last } => (first <= last).then_some(*last),
        }
    }

    /// Membership: binary search on the list form, interval test on the range.
    pub fn contains(&self, id: EntryId) -> bool {
        match self {
            CandidateSet::Ids(ids) => ids.binary_search(&id).is_ok(),
            CandidateSet::Range { first, last } => *first <= id && id <= *last,
        }
    }

    /// Insert one identifier, degrading to a range past `max_ids`.
    pub fn insert(&mut self, id: EntryId, max_ids: usize) {
        match self {
            CandidateSet::Ids(ids) => {
                if let Err(pos) = ids.binary_search(&id) {
                    ids.insert(pos, id);
                    if ids.len() > max_ids {
                        let taken = std::mem::take(ids);
                        *self = Self::bounded(taken, max_ids);
                    }
                }
            }
            CandidateSet::Range { first, last } => {
                if first > last {
                    *first = id;
                    *last = id;
                } else {
                    *first = (*first).min(id);
                    *last = (*last).max(id);
                }
            }
        }
    }

    pub fn intersection(&self, other: &CandidateSet) -> CandidateSet {
        match (self, other) {
            (CandidateSet::Ids(a), CandidateSet::Ids(b)) => {
                let mut out = Vec::with_capacity(a.len().min(b.len()));
                let (mut i, mut j) = (0, 0);
                while i < a.len() && j < b.len() {
                    match a[i].cmp(&b[j]) {
                        std::cmp::Ordering::Less => i += 1,
                        std::cmp::Ordering::Greater => j += 1,
                        std::cmp::Ordering::Equal => {
                            out.push(a[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
                CandidateSet::Ids(out)
            }
            (CandidateSet::Ids(ids), range @ CandidateSet::Range { .. })
            | (range @ CandidateSet::Range { .. }, CandidateSet::Ids(ids)) => {
                CandidateSet::Ids(ids.iter().copied().filter(|id| range.contains(*id)).collect())
            }
            (
                CandidateSet::Range { first: f1, last: l1 },
                CandidateSet::Range { first: f2, last: l2 },
            ) => CandidateSet::range((*f1).max(*f2), (*l1).min(*l2)),
        }
    }

    /// Union; a range on either side yields the covering range.
    pub fn union(&self, other: &CandidateSet, max_ids: usize) -> CandidateSet {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        match (self, other) {
            (CandidateSet::Ids(a), CandidateSet::Ids(b)) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                let (mut i, mut j) = (0, 0);
                while i < a.len() && j < b.len() {
                    match a[i].cmp(&b[j]) {
                        std::cmp::Ordering::Less => {
                            out.push(a[i]);
                            i += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            out.push(b[j]);
                            j += 1;
                        }
                        std::cmp::Ordering::Equal => {
                            out.push(a[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
                out.extend_from_slice(&a[i..]);
                out.extend_from_slice(&b[j..]);
                Self::bounded(out, max_ids)
            }
            _ => match (
                self.first().zip(self.last()),
                other.first().zip(other.last()),
            ) {
                (Some((f1, l1)), Some((f2, l2))) => CandidateSet::Range {
                    first: f1.min(f2),
                    last: l1.max(l2),
                },
                _ => CandidateSet::empty(),
            },
        }
    }
}

/// Growable stack of scratch candidate sets used during index evaluation.
///
/// The builder reserves `depth + 1` frames up front; evaluation may still
/// push past the reservation without corrupting anything, and `peak()`
/// reports how many frames were live at once.
#[derive(Debug, Default)]
pub struct ScratchStack {
    frames: Vec<CandidateSet>,
    reserved: usize,
    peak: usize,
}

impl ScratchStack {
    pub fn with_depth(frames: usize) -> Self {
        Self {
            frames: Vec::with_capacity(frames),
            reserved: frames,
            peak: 0,
        }
    }

    pub fn push(&mut self, set: CandidateSet) {
        self.frames.push(set);
        self.peak = self.peak.max(self.frames.len());
    }

    pub fn pop(&mut self) -> Option<CandidateSet> {
        self.frames.pop()
    }

    /// The innermost live frame.
    pub fn top_mut(&mut self) -> Option<&mut CandidateSet> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}
