#![forbid(unsafe_code)]
//! Per-partition slice mapping: virtual slice to physical slice resolution.
//!
//! A partition's address space is tracked as a sparse, ordered set of
//! [`SliceExtent`]s, each a virtually contiguous run whose physical slices
//! may be arbitrary. [`SliceMap`] keeps the extents disjoint and merges
//! abutting runs, so per-partition memory is proportional to the number of
//! contiguous runs rather than the number of slices, and the I/O path can
//! detect virtual contiguity with one ordered lookup.
//!
//! Allocation failure is modeled with `Vec::try_reserve` at the points that
//! can grow storage (append, split, merge); everything else is infallible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use svol_error::{Result, VolError};
use svol_types::Pslice;

// ── SliceExtent ─────────────────────────────────────────────────────────────

/// A virtually contiguous run of slices starting at `start`, mapping
/// `start + i` to `pslices[i]`. The physical slices need not be contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceExtent {
    start: u64,
    pslices: Vec<Pslice>,
}

impl SliceExtent {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            start,
            pslices: Vec::new(),
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last mapped virtual slice.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.len() as u64
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pslices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pslices.is_empty()
    }

    /// Physical slice backing `vslice`, if it falls inside this extent.
    #[must_use]
    pub fn get(&self, vslice: u64) -> Option<Pslice> {
        if vslice < self.start {
            return None;
        }
        usize::try_from(vslice - self.start)
            .ok()
            .and_then(|i| self.pslices.get(i))
            .copied()
    }

    /// Extend the virtual end by one slice, mapping it to `pslice`.
    pub fn push_back(&mut self, pslice: Pslice) -> Result<()> {
        self.pslices
            .try_reserve(1)
            .map_err(|_| VolError::NoMemory)?;
        self.pslices.push(pslice);
        Ok(())
    }

    /// Drop the last virtual mapping. The extent may become empty.
    pub fn pop_back(&mut self) -> Option<Pslice> {
        self.pslices.pop()
    }

    /// Split after `vslice`: the receiver keeps `[start, vslice + 1)` and
    /// the returned extent covers `[vslice + 1, end)`. If `vslice` is the
    /// last mapped slice the returned extent is empty.
    ///
    /// Requires `start <= vslice < end`.
    pub fn split(&mut self, vslice: u64) -> Result<Self> {
        debug_assert!(self.start <= vslice);
        debug_assert!(vslice < self.end());

        let keep = usize::try_from(vslice + 1 - self.start).map_err(|_| VolError::NoMemory)?;
        let tail_len = self.pslices.len() - keep;
        let mut tail = Vec::new();
        tail.try_reserve(tail_len).map_err(|_| VolError::NoMemory)?;
        tail.extend_from_slice(&self.pslices[keep..]);
        self.pslices.truncate(keep);
        Ok(Self {
            start: vslice + 1,
            pslices: tail,
        })
    }

    /// Append all of `other`'s mappings. Requires `self.end() == other.start()`.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        debug_assert_eq!(self.end(), other.start());
        self.pslices
            .try_reserve(other.len())
            .map_err(|_| VolError::NoMemory)?;
        self.pslices.extend_from_slice(&other.pslices);
        Ok(())
    }

    /// Iterate `(vslice, pslice)` pairs in virtual order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Pslice)> + '_ {
        self.pslices
            .iter()
            .enumerate()
            .map(move |(i, p)| (self.start + i as u64, *p))
    }
}

// ── SliceMap ────────────────────────────────────────────────────────────────

/// Result of a contiguous-run query: the length of the maximal run starting
/// at the queried slice that is uniformly allocated or uniformly free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRange {
    pub count: u64,
    pub allocated: bool,
}

/// Ordered map from extent starting vslice to extent.
///
/// Invariants: extents have pairwise disjoint, non-empty virtual ranges, and
/// abutting extents are merged whenever the merge allocation succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMap {
    extents: BTreeMap<u64, SliceExtent>,
}

impl SliceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Number of distinct extents (contiguous virtual runs).
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// Total mapped slices across all extents.
    #[must_use]
    pub fn slice_count(&self) -> u64 {
        self.extents.values().map(|e| e.len() as u64).sum()
    }

    /// Physical slice backing `vslice`, or `None` when free.
    #[must_use]
    pub fn lookup(&self, vslice: u64) -> Option<Pslice> {
        self.extents
            .range(..=vslice)
            .next_back()
            .and_then(|(_, extent)| extent.get(vslice))
    }

    /// Map `vslice` to `pslice`. Requires `vslice` to be free.
    ///
    /// Appends to the extent ending exactly at `vslice` when one exists,
    /// otherwise inserts a fresh single-slice extent. An abutting successor
    /// is then merged opportunistically; failure to merge is not an error,
    /// it just leaves two adjacent extents.
    pub fn set(&mut self, vslice: u64, pslice: Pslice) -> Result<()> {
        debug_assert!(self.lookup(vslice).is_none());

        let appended = match self.extents.range_mut(..=vslice).next_back() {
            Some((&key, extent)) if extent.end() == vslice => {
                extent.push_back(pslice)?;
                key
            }
            _ => {
                let mut extent = SliceExtent::new(vslice);
                extent.push_back(pslice)?;
                self.extents.insert(vslice, extent);
                vslice
            }
        };

        if let Some((&next_key, _)) = self.extents.range(vslice + 1..).next()
            && next_key == vslice + 1
        {
            let next = self
                .extents
                .remove(&next_key)
                .unwrap_or_else(|| unreachable!("key observed under the same borrow"));
            let extent = self
                .extents
                .get_mut(&appended)
                .unwrap_or_else(|| unreachable!("appended extent cannot vanish"));
            if extent.merge(&next).is_err() {
                // Merge is best-effort; keep the two extents separate.
                self.extents.insert(next_key, next);
            }
        }

        debug_assert_eq!(self.lookup(vslice), Some(pslice));
        Ok(())
    }

    /// Unmap `vslice`. Requires `vslice` to be allocated.
    ///
    /// Freeing mid-extent splits the run; the split is the only fallible
    /// step, and on failure the map is unchanged.
    pub fn free(&mut self, vslice: u64) -> Result<Pslice> {
        let (&key, extent) = self
            .extents
            .range_mut(..=vslice)
            .next_back()
            .filter(|(_, extent)| extent.get(vslice).is_some())
            .ok_or(VolError::InvalidArgs("vslice is not allocated"))?;

        if vslice + 1 != extent.end() {
            let tail = extent.split(vslice)?;
            debug_assert!(!tail.is_empty());
            self.extents.insert(tail.start(), tail);
        }
        let extent = self
            .extents
            .get_mut(&key)
            .unwrap_or_else(|| unreachable!("extent held before split"));
        let pslice = extent
            .pop_back()
            .unwrap_or_else(|| unreachable!("extent covering vslice is non-empty"));
        if extent.is_empty() {
            self.extents.remove(&key);
        }
        Ok(pslice)
    }

    /// Length of the maximal uniformly allocated or uniformly free run
    /// starting at `vslice`, capped at `vslice_max`.
    #[must_use]
    pub fn range_query(&self, vslice: u64, vslice_max: u64) -> SliceRange {
        debug_assert!(vslice < vslice_max);

        if let Some((_, extent)) = self.extents.range(..=vslice).next_back()
            && extent.get(vslice).is_some()
        {
            return SliceRange {
                count: extent.end() - vslice,
                allocated: true,
            };
        }

        let count = self
            .extents
            .range(vslice + 1..)
            .next()
            .map_or(vslice_max - vslice, |(&next_start, _)| next_start - vslice);
        SliceRange {
            count,
            allocated: false,
        }
    }

    /// Remove and return the lowest extent. Used when tearing down a whole
    /// partition without per-slice splitting.
    pub fn pop_first_extent(&mut self) -> Option<SliceExtent> {
        self.extents.pop_first().map(|(_, extent)| extent)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
