//! Page allocator and boot scanner
//!
//! The in-memory page table mirrors what the headers on flash say, plus
//! which pages are reserved by open write handles. It is rebuilt on every
//! mount by [`scan`], which walks the pool in physical order and applies
//! "newest wins" to every file name and every chunk copy.

use heapless::Vec;
use strata_hal::FlashDriver;

use crate::config::MAX_PAGES;
use crate::directory::{DirEntry, Directory};
use crate::error::Error;
use crate::layout::{PageHeader, PageState, DEAD_MARK_OFFSET, HEAD_DATA_OFFSET, MARK_SET};
use crate::region::RegionMap;

/// In-memory state of one pool page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slot {
    /// Erased and available
    Erased,
    /// Allocated to an uncommitted chain of an open write handle
    Reserved { file: u32, index: u16 },
    /// Committed chunk of a live file
    Live { file: u32, index: u16 },
    /// Superseded chunk still readable by an open handle
    Dead { file: u32, index: u16 },
    /// Written but unowned; reclaimable by erasing its sector
    Garbage,
}

/// Page table with a circular allocation frontier
#[derive(Debug, Clone)]
pub struct PageTable {
    slots: Vec<Slot, MAX_PAGES>,
    erased: u32,
    cursor: u32,
}

impl PageTable {
    /// A table of `total` erased pages
    pub fn new(total: u32) -> Self {
        let mut slots = Vec::new();
        // Page count is validated against MAX_PAGES by the config
        let _ = slots.resize(total as usize, Slot::Erased);
        Self {
            slots,
            erased: total,
            cursor: 0,
        }
    }

    /// Number of pages
    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Whether the table has no pages
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// State of `page`
    pub fn get(&self, page: u32) -> Slot {
        self.slots.get(page as usize).copied().unwrap_or(Slot::Garbage)
    }

    /// Set the state of `page`
    pub fn set(&mut self, page: u32, slot: Slot) {
        if let Some(current) = self.slots.get_mut(page as usize) {
            match (*current == Slot::Erased, slot == Slot::Erased) {
                (true, false) => self.erased -= 1,
                (false, true) => self.erased += 1,
                _ => {}
            }
            *current = slot;
        }
    }

    /// Erased pages available
    pub fn erased_count(&self) -> u32 {
        self.erased
    }

    /// Iterate over `(page, slot)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u32, Slot)> + '_ {
        self.slots.iter().enumerate().map(|(i, s)| (i as u32, *s))
    }

    /// Highest-numbered page that is not erased
    pub fn last_written_page(&self) -> Option<u32> {
        self.slots
            .iter()
            .rposition(|s| *s != Slot::Erased)
            .map(|i| i as u32)
    }

    /// Place the allocation frontier just after the last written page
    pub fn reset_cursor(&mut self) {
        self.cursor = match self.last_written_page() {
            Some(last) if last + 1 < self.len() => last + 1,
            _ => 0,
        };
    }

    /// Take the next erased page at or after the frontier, skipping `exclude`
    pub fn next_erased(&mut self, exclude: Option<core::ops::Range<u32>>) -> Option<u32> {
        let total = self.len();
        if total == 0 {
            return None;
        }
        for step in 0..total {
            let page = (self.cursor + step) % total;
            if exclude.as_ref().is_some_and(|r| r.contains(&page)) {
                continue;
            }
            if self.slots[page as usize] == Slot::Erased {
                self.cursor = (page + 1) % total;
                return Some(page);
            }
        }
        None
    }

    /// Page holding chunk `index` of `file`
    ///
    /// Live and reserved copies are preferred over superseded ones.
    pub fn find(&self, file: u32, index: u16) -> Option<u32> {
        let mut fallback = None;
        for (page, slot) in self.iter() {
            match slot {
                Slot::Live { file: f, index: i } | Slot::Reserved { file: f, index: i }
                    if f == file && i == index =>
                {
                    return Some(page);
                }
                Slot::Dead { file: f, index: i } if f == file && i == index => {
                    fallback.get_or_insert(page);
                }
                _ => {}
            }
        }
        fallback
    }

    /// Count pages of `range` matching `pred`
    pub fn count_in(&self, range: core::ops::Range<u32>, pred: impl Fn(Slot) -> bool) -> u32 {
        range.filter(|&p| pred(self.get(p))).count() as u32
    }
}

/// Result of a boot scan
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Reconstructed page table
    pub pages: PageTable,
    /// Live files
    pub directory: Directory,
    /// Next unused sequence number
    pub next_sequence: u32,
    /// Retired pages whose dead marker could not be programmed
    pub stale: Vec<u32, MAX_PAGES>,
}

/// Read and decode the header of global page `page`
pub(crate) fn read_page_state<F: FlashDriver>(
    flash: &mut F,
    map: &RegionMap,
    page: u32,
) -> Result<PageState, Error> {
    let mut raw = [0u8; HEAD_DATA_OFFSET];
    flash.read(map.page_offset(page)?, &mut raw)?;
    Ok(PageHeader::decode(&raw))
}

/// Program the dead marker of global page `page`
pub(crate) fn mark_dead<F: FlashDriver>(
    flash: &mut F,
    map: &RegionMap,
    page: u32,
) -> Result<(), Error> {
    flash.program(map.page_offset(page)? + DEAD_MARK_OFFSET, &[MARK_SET])?;
    Ok(())
}

/// Pages the scan dropped from the table
struct Retired<'a, F> {
    flash: &'a mut F,
    map: &'a RegionMap,
    failed: Vec<u32, MAX_PAGES>,
}

impl<F: FlashDriver> Retired<'_, F> {
    /// Mark a superseded copy dead on flash and drop it from `pages`
    ///
    /// A failure is logged and the page is queued for another attempt.
    fn retire(&mut self, pages: &mut PageTable, page: u32) {
        if let Err(e) = mark_dead(&mut *self.flash, self.map, page) {
            warn!("scan: could not retire page {}: {:?}", page, e);
            let _ = self.failed.push(page);
        }
        pages.set(page, Slot::Garbage);
    }
}

/// Rebuild the page table and directory from flash
pub fn scan<F: FlashDriver>(flash: &mut F, map: &RegionMap) -> Result<ScanResult, Error> {
    let total = map.total_pages();
    let mut pages = PageTable::new(total);
    let mut directory = Directory::new();
    let mut generations: Vec<u32, MAX_PAGES> = Vec::new();
    let _ = generations.resize(total as usize, 0);
    let mut max_sequence = 0u32;

    // Pass 1: classify every page and pick the newest head per name
    for page in 0..total {
        let state = read_page_state(flash, map, page)?;
        let header = match state {
            PageState::Erased => continue,
            PageState::Corrupt => {
                pages.set(page, Slot::Garbage);
                continue;
            }
            PageState::Uncommitted(header) | PageState::Dead(header) => {
                max_sequence = max_sequence.max(header.file_id).max(header.generation);
                pages.set(page, Slot::Garbage);
                continue;
            }
            PageState::Written(header) => header,
        };

        max_sequence = max_sequence.max(header.file_id).max(header.generation);
        pages.set(
            page,
            Slot::Live {
                file: header.file_id,
                index: header.index,
            },
        );
        generations[page as usize] = header.generation;

        if let Some(meta) = header.meta {
            match directory.find(&meta.name) {
                Some(existing) if existing.file >= header.file_id => {}
                _ => {
                    directory.upsert(DirEntry {
                        name: meta.name,
                        file: header.file_id,
                        size: meta.size,
                        page_count: meta.page_count,
                        file_type: meta.file_type,
                    })?;
                }
            }
        }
    }

    let mut retired = Retired {
        flash,
        map,
        failed: Vec::new(),
    };

    // Pass 2: retire orphans, superseded files and out-of-range chunks
    for page in 0..total {
        if let Slot::Live { file, index } = pages.get(page) {
            let keep = directory
                .by_file(file)
                .is_some_and(|entry| index < entry.page_count);
            if !keep {
                retired.retire(&mut pages, page);
            }
        }
    }

    // Pass 3: of duplicate chunk copies (interrupted relocation) keep the newest
    for page in 0..total {
        let Slot::Live { file, index } = pages.get(page) else {
            continue;
        };
        for other in page + 1..total {
            if pages.get(other) != (Slot::Live { file, index }) {
                continue;
            }
            if generations[other as usize] > generations[page as usize] {
                retired.retire(&mut pages, page);
                break;
            }
            retired.retire(&mut pages, other);
        }
    }

    // Pass 4: a file missing any chunk never fully committed
    let mut incomplete: Vec<u32, { crate::config::MAX_FILES }> = Vec::new();
    for entry in directory.iter() {
        let present = pages.count_in(0..total, |s| matches!(s, Slot::Live { file, .. } if file == entry.file));
        if present != entry.page_count as u32 {
            let _ = incomplete.push(entry.file);
        }
    }
    for file in incomplete {
        warn!("scan: dropping incomplete file {}", file);
        directory.remove_file(file);
        for page in 0..total {
            if matches!(pages.get(page), Slot::Live { file: f, .. } if f == file) {
                retired.retire(&mut pages, page);
            }
        }
    }

    pages.reset_cursor();
    debug!(
        "scan: {} pages, {} erased, {} files",
        total,
        pages.erased_count(),
        directory.len()
    );

    Ok(ScanResult {
        pages,
        directory,
        next_sequence: max_sequence.saturating_add(1),
        stale: retired.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_circular_from_frontier() {
        let mut table = PageTable::new(8);
        table.set(0, Slot::Garbage);
        table.set(5, Slot::Live { file: 1, index: 0 });
        table.reset_cursor();

        assert_eq!(table.last_written_page(), Some(5));
        assert_eq!(table.next_erased(None), Some(6));
        assert_eq!(table.next_erased(None), Some(7));
        // Wraps past the garbage page at 0
        assert_eq!(table.next_erased(None), Some(1));
    }

    #[test]
    fn test_allocation_skips_excluded_range() {
        let mut table = PageTable::new(16);
        assert_eq!(table.next_erased(Some(0..8)), Some(8));
        assert_eq!(table.next_erased(Some(8..16)), Some(0));
    }

    #[test]
    fn test_erased_count_tracks_transitions() {
        let mut table = PageTable::new(4);
        assert_eq!(table.erased_count(), 4);
        table.set(1, Slot::Reserved { file: 3, index: 0 });
        table.set(1, Slot::Live { file: 3, index: 0 });
        assert_eq!(table.erased_count(), 3);
        table.set(1, Slot::Erased);
        assert_eq!(table.erased_count(), 4);
    }

    #[test]
    fn test_exhausted_table() {
        let mut table = PageTable::new(2);
        table.set(0, Slot::Garbage);
        table.set(1, Slot::Dead { file: 1, index: 0 });
        assert_eq!(table.next_erased(None), None);
    }

    #[test]
    fn test_find_prefers_live_copy() {
        let mut table = PageTable::new(4);
        table.set(0, Slot::Dead { file: 9, index: 1 });
        table.set(2, Slot::Live { file: 9, index: 1 });
        assert_eq!(table.find(9, 1), Some(2));

        table.set(2, Slot::Garbage);
        assert_eq!(table.find(9, 1), Some(0));
        assert_eq!(table.find(9, 2), None);
    }
}
