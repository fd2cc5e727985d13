use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Result, TreeError};
use crate::model::{PageNr, RecordAddress, RecordNr};

/// Contiguous run of records within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRange {
    pub page_nr: PageNr,
    pub record_nr: RecordNr,
    pub length: u16,
}

impl StorageRange {
    pub fn new(page_nr: PageNr, record_nr: RecordNr, length: u16) -> Self {
        Self {
            page_nr,
            record_nr,
            length,
        }
    }
}

/// Ordered set of ranges that together store one node's record. The node's
/// address is the first record of the first range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAllocation {
    pub ranges: SmallVec<[StorageRange; 2]>,
}

impl NodeAllocation {
    pub fn new(ranges: impl IntoIterator<Item = StorageRange>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    pub fn single(range: StorageRange) -> Self {
        let mut ranges = SmallVec::new();
        ranges.push(range);
        Self { ranges }
    }

    pub fn address(&self) -> RecordAddress {
        let first = &self.ranges[0];
        RecordAddress::new(first.page_nr, first.record_nr)
    }

    pub fn total_records(&self) -> u32 {
        self.ranges.iter().map(|r| r.length as u32).sum()
    }

    /// The record slot at the given position within the allocation.
    pub fn record_at(&self, index: u32) -> Result<RecordAddress> {
        let mut remaining = index;
        for range in &self.ranges {
            if remaining < range.length as u32 {
                return Ok(RecordAddress::new(
                    range.page_nr,
                    range.record_nr + remaining as u16,
                ));
            }
            remaining -= range.length as u32;
        }
        Err(TreeError::Corrupt(format!(
            "record index {index} outside allocation of {} records",
            self.total_records()
        )))
    }

    /// Shrinks the allocation to `keep` records, returning the trimmed tail
    /// ranges for release.
    pub fn trim(&mut self, keep: u32) -> Vec<StorageRange> {
        let mut tail = Vec::new();
        let mut remaining = keep;
        let mut kept = SmallVec::new();
        for range in self.ranges.drain(..) {
            if remaining == 0 {
                tail.push(range);
            } else if (range.length as u32) <= remaining {
                remaining -= range.length as u32;
                kept.push(range);
            } else {
                let keep_len = remaining as u16;
                kept.push(StorageRange::new(range.page_nr, range.record_nr, keep_len));
                tail.push(StorageRange::new(
                    range.page_nr,
                    range.record_nr + keep_len,
                    range.length - keep_len,
                ));
                remaining = 0;
            }
        }
        self.ranges = kept;
        tail
    }
}

/// In-memory allocator of record ranges. The table is rebuilt from a
/// reachability walk at open; its on-disk persistence belongs to
/// collaborators.
#[derive(Debug)]
pub struct FreeSpaceTable {
    page_size: u16,
    page_count: u32,
    free: Vec<StorageRange>,
    allocated_records: u64,
}

impl FreeSpaceTable {
    pub fn new(page_size: u16) -> Self {
        Self {
            page_size,
            page_count: 0,
            free: Vec::new(),
            allocated_records: 0,
        }
    }

    /// Reconstructs the table for an existing file: every record of every page
    /// not covered by `used` is free.
    pub fn rebuild(page_size: u16, page_count: u32, used: &[StorageRange]) -> Self {
        let mut table = Self::new(page_size);
        table.page_count = page_count;
        table.free = (0..page_count)
            .map(|page_nr| StorageRange::new(page_nr, 0, page_size))
            .collect();
        for range in used {
            table.carve(*range);
            table.allocated_records += range.length as u64;
        }
        table.coalesce();
        table
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn allocated_records(&self) -> u64 {
        self.allocated_records
    }

    pub fn free_records(&self) -> u64 {
        self.free.iter().map(|r| r.length as u64).sum()
    }

    /// Hands out ranges summing to exactly `records`. Prefers the tightest
    /// single contiguous run; falls back to gathering fragments, then to
    /// appending fresh pages.
    pub fn allocate(&mut self, records: u32) -> Result<NodeAllocation> {
        self.allocate_with_min_first(records, 1)
    }

    /// Like `allocate`, but guarantees the first range spans at least
    /// `min_first` records. Record headers must fit inside the first range,
    /// since header continuation follows it sequentially.
    pub fn allocate_with_min_first(
        &mut self,
        records: u32,
        min_first: u16,
    ) -> Result<NodeAllocation> {
        if records == 0 {
            return Err(TreeError::InvalidArgument(
                "cannot allocate zero records".into(),
            ));
        }
        if min_first > self.page_size || min_first as u32 > records {
            return Err(TreeError::InvalidArgument(
                "first-range requirement exceeds page or allocation size".into(),
            ));
        }

        // Best fit over existing holes.
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.length as u32 >= records)
            .min_by_key(|(_, r)| r.length);
        if let Some((index, _)) = best {
            let range = self.free[index];
            let taken = StorageRange::new(range.page_nr, range.record_nr, records as u16);
            if range.length as u32 == records {
                self.free.remove(index);
            } else {
                self.free[index] = StorageRange::new(
                    range.page_nr,
                    range.record_nr + records as u16,
                    range.length - records as u16,
                );
            }
            self.allocated_records += records as u64;
            trace!(records, page_nr = taken.page_nr, record_nr = taken.record_nr, "allocated contiguous");
            return Ok(NodeAllocation::single(taken));
        }

        // Gather fragments, largest first, then append pages for the rest.
        let mut ranges: SmallVec<[StorageRange; 2]> = SmallVec::new();
        let mut remaining = records;
        self.free.sort_by(|a, b| b.length.cmp(&a.length));
        let first_hole_suffices = self
            .free
            .first()
            .map(|range| range.length >= min_first)
            .unwrap_or(false);
        if !first_hole_suffices {
            // Lead with a fresh page so the first range is long enough.
            let page_nr = self.page_count;
            self.page_count += 1;
            let take = remaining.min(self.page_size as u32) as u16;
            ranges.push(StorageRange::new(page_nr, 0, take));
            if take < self.page_size {
                self.free
                    .push(StorageRange::new(page_nr, take, self.page_size - take));
                self.free.sort_by(|a, b| b.length.cmp(&a.length));
            }
            remaining -= take as u32;
        }
        while remaining > 0 {
            let Some(range) = self.free.first().copied() else {
                break;
            };
            if range.length as u32 <= remaining {
                self.free.remove(0);
                remaining -= range.length as u32;
                ranges.push(range);
            } else {
                self.free[0] = StorageRange::new(
                    range.page_nr,
                    range.record_nr + remaining as u16,
                    range.length - remaining as u16,
                );
                ranges.push(StorageRange::new(
                    range.page_nr,
                    range.record_nr,
                    remaining as u16,
                ));
                remaining = 0;
            }
        }
        while remaining > 0 {
            let page_nr = self.page_count;
            self.page_count += 1;
            let take = remaining.min(self.page_size as u32) as u16;
            ranges.push(StorageRange::new(page_nr, 0, take));
            if take < self.page_size {
                self.free
                    .push(StorageRange::new(page_nr, take, self.page_size - take));
            }
            remaining -= take as u32;
        }
        self.coalesce();
        self.allocated_records += records as u64;
        trace!(records, fragments = ranges.len(), "allocated fragmented");
        Ok(NodeAllocation { ranges })
    }

    /// Returns ranges to the free set, coalescing adjacent runs.
    pub fn release(&mut self, ranges: &[StorageRange]) {
        for range in ranges {
            if range.length == 0 {
                continue;
            }
            self.allocated_records = self
                .allocated_records
                .saturating_sub(range.length as u64);
            self.free.push(*range);
        }
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.free
            .sort_by_key(|r| (r.page_nr, r.record_nr));
        let mut merged: Vec<StorageRange> = Vec::with_capacity(self.free.len());
        for range in self.free.drain(..) {
            match merged.last_mut() {
                Some(last)
                    if last.page_nr == range.page_nr
                        && last.record_nr + last.length == range.record_nr =>
                {
                    last.length += range.length;
                }
                _ => merged.push(range),
            }
        }
        self.free = merged;
    }

    /// Removes a used run from the free set during rebuild.
    fn carve(&mut self, used: StorageRange) {
        let mut result = Vec::with_capacity(self.free.len() + 1);
        for range in self.free.drain(..) {
            if range.page_nr != used.page_nr {
                result.push(range);
                continue;
            }
            let range_end = range.record_nr + range.length;
            let used_end = used.record_nr + used.length;
            if used_end <= range.record_nr || used.record_nr >= range_end {
                result.push(range);
                continue;
            }
            if used.record_nr > range.record_nr {
                result.push(StorageRange::new(
                    range.page_nr,
                    range.record_nr,
                    used.record_nr - range.record_nr,
                ));
            }
            if used_end < range_end {
                result.push(StorageRange::new(range.page_nr, used_end, range_end - used_end));
            }
        }
        self.free = result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_pages_when_empty() {
        let mut fst = FreeSpaceTable::new(16);
        let alloc = fst.allocate(4).expect("allocate");
        assert_eq!(alloc.ranges.len(), 1);
        assert_eq!(alloc.address(), RecordAddress::new(0, 0));
        assert_eq!(fst.page_count(), 1);
        assert_eq!(fst.allocated_records(), 4);
        assert_eq!(fst.free_records(), 12);
    }

    #[test]
    fn best_fit_prefers_tightest_hole() {
        let mut fst = FreeSpaceTable::rebuild(
            16,
            2,
            &[StorageRange::new(0, 0, 4), StorageRange::new(0, 8, 8)],
        );
        // Free holes: 4 records at 0:4, all 16 of page 1.
        let alloc = fst.allocate(3).expect("allocate");
        assert_eq!(alloc.ranges[0], StorageRange::new(0, 4, 3));
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut fst = FreeSpaceTable::new(16);
        let a = fst.allocate(16).expect("fill page");
        assert_eq!(fst.free_records(), 0);
        fst.release(&a.ranges);
        assert_eq!(fst.free_records(), 16);
        // The whole page is one hole again.
        let b = fst.allocate(16).expect("reallocate");
        assert_eq!(b.ranges.len(), 1);
        assert_eq!(b.address(), RecordAddress::new(0, 0));
    }

    #[test]
    fn gathers_fragments_before_growing() {
        let mut fst = FreeSpaceTable::new(8);
        let keep = fst.allocate(8).expect("page 0");
        let _spacer = fst.allocate(8).expect("page 1");
        fst.release(&keep.ranges);
        // Page 0 is free (8 records); ask for 12: 8 from the hole + 4 fresh.
        let alloc = fst.allocate(12).expect("allocate");
        assert_eq!(alloc.total_records(), 12);
        assert!(alloc.ranges.len() >= 2);
        assert_eq!(fst.page_count(), 3);
    }

    #[test]
    fn never_hands_out_used_records() {
        let mut fst = FreeSpaceTable::new(8);
        let a = fst.allocate(5).expect("a");
        let b = fst.allocate(5).expect("b");
        let mut seen = std::collections::HashSet::new();
        for alloc in [&a, &b] {
            for range in &alloc.ranges {
                for i in 0..range.length {
                    assert!(seen.insert((range.page_nr, range.record_nr + i)));
                }
            }
        }
    }

    #[test]
    fn trim_returns_tail_for_release() {
        let mut fst = FreeSpaceTable::new(16);
        let mut alloc = fst.allocate(10).expect("allocate");
        let tail = alloc.trim(6);
        assert_eq!(alloc.total_records(), 6);
        assert_eq!(tail.iter().map(|r| r.length as u32).sum::<u32>(), 4);
        fst.release(&tail);
        assert_eq!(fst.allocated_records(), 6);
        assert_eq!(fst.free_records(), 10);
    }

    #[test]
    fn min_first_skips_short_leading_holes() {
        let mut fst = FreeSpaceTable::new(8);
        let keep = fst.allocate(3).expect("head of page 0");
        let _spacer = fst.allocate(5).expect("rest of page 0");
        fst.release(&keep.ranges);
        // Only a 3-record hole is free; a 4-record first range forces a
        // fresh page to lead the allocation.
        let alloc = fst.allocate_with_min_first(6, 4).expect("allocate");
        assert!(alloc.ranges[0].length >= 4);
        assert_eq!(alloc.total_records(), 6);
        assert!(matches!(
            fst.allocate_with_min_first(4, 9),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn record_at_walks_ranges() {
        let alloc = NodeAllocation::new([
            StorageRange::new(0, 14, 2),
            StorageRange::new(3, 0, 4),
        ]);
        assert_eq!(alloc.record_at(0).expect("first"), RecordAddress::new(0, 14));
        assert_eq!(alloc.record_at(1).expect("second"), RecordAddress::new(0, 15));
        assert_eq!(alloc.record_at(2).expect("third"), RecordAddress::new(3, 0));
        assert_eq!(alloc.record_at(5).expect("last"), RecordAddress::new(3, 3));
        assert!(alloc.record_at(6).is_err());
    }

    #[test]
    fn rebuild_marks_used_ranges() {
        let used = [StorageRange::new(0, 2, 6), StorageRange::new(1, 0, 16)];
        let fst = FreeSpaceTable::rebuild(16, 2, &used);
        assert_eq!(fst.allocated_records(), 22);
        assert_eq!(fst.free_records(), 32 - 22);
    }
}
