//! Sector garbage collector
//!
//! Pages only return to the erased state through a whole-sector erase.
//! The collector picks a sector, copies its live pages elsewhere as fresh
//! committed copies with a newer generation, marks each source dead and
//! finally erases the sector. Power loss at any point leaves at worst two
//! committed copies of a chunk, which the boot scan resolves by generation.

use strata_hal::{flash::ERASED_BYTE, FlashDriver, FlashError};

use crate::allocator::{self, Slot};
use crate::error::Error;
use crate::fs::{FileSystem, COPY_CHUNK};
use crate::layout::{PageState, COMMIT_MARK_OFFSET, HEAD_DATA_OFFSET, MARK_SET};

/// Work done by [`FileSystem::collect_garbage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GcReport {
    pub sectors_erased: u32,
    pub pages_relocated: u32,
}

impl<F: FlashDriver> FileSystem<F> {
    /// Reclaim every sector that currently can be reclaimed
    pub fn collect_garbage(&mut self) -> Result<GcReport, Error> {
        let mut report = GcReport::default();
        // Each pass empties one sector of reclaimable pages for good
        for _ in 0..self.map.total_sectors() {
            let Some(sector) = self.pick_victim() else {
                break;
            };
            report.pages_relocated += self.reclaim_sector(sector)?;
            report.sectors_erased += 1;
        }
        info!(
            "gc: {} sectors erased, {} pages relocated",
            report.sectors_erased,
            report.pages_relocated
        );
        Ok(report)
    }

    /// Collect until `needed` pages are erased on top of the reserve
    pub(crate) fn ensure_free(&mut self, needed: u32) -> Result<(), Error> {
        let target = needed + self.reserve();
        while self.pages.erased_count() < target {
            let Some(sector) = self.pick_victim() else {
                debug!(
                    "gc: {} pages erased, {} needed",
                    self.pages.erased_count(),
                    target
                );
                return Err(Error::OutOfStorage);
            };
            self.reclaim_sector(sector)?;
        }
        Ok(())
    }

    /// Sector with the fewest live pages among those worth erasing
    ///
    /// A sector qualifies when it holds something reclaimable, no page of it
    /// belongs to an open handle, and its live pages fit in the erased pages
    /// of the other sectors. Ties go to the lowest sector.
    pub(crate) fn pick_victim(&self) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;

        for sector in 0..self.map.total_sectors() {
            let mut live = 0;
            let mut reclaimable = 0;
            let mut erased = 0;
            let mut pinned = false;

            for page in self.map.sector_pages(sector) {
                match self.pages.get(page) {
                    Slot::Erased => erased += 1,
                    Slot::Garbage => reclaimable += 1,
                    Slot::Reserved { .. } => pinned = true,
                    Slot::Live { file, .. } => {
                        pinned |= self.handles.pins(file);
                        live += 1;
                    }
                    Slot::Dead { file, .. } => {
                        if self.handles.pins(file) {
                            pinned = true;
                        } else {
                            reclaimable += 1;
                        }
                    }
                }
            }

            let room = self.pages.erased_count() - erased;
            if pinned || reclaimable == 0 || live > room {
                continue;
            }
            if best.map_or(true, |(fewest, _)| live < fewest) {
                best = Some((live, sector));
            }
        }

        best.map(|(_, sector)| sector)
    }

    /// Move the live pages out of `sector` and erase it
    fn reclaim_sector(&mut self, sector: u32) -> Result<u32, Error> {
        let range = self.map.sector_pages(sector);
        let mut moved = 0;

        for page in range.clone() {
            if let Slot::Live { file, index } = self.pages.get(page) {
                let dest = self
                    .pages
                    .next_erased(Some(range.clone()))
                    .ok_or(Error::OutOfStorage)?;
                self.relocate(page, dest, file, index)?;
                moved += 1;
            }
        }

        self.flash.erase_sector(self.map.sector_offset(sector)?)?;
        for page in range.clone() {
            self.pages.set(page, Slot::Erased);
        }
        self.stale.retain(|page| !range.contains(page));

        debug!("gc: sector {} erased, {} pages moved", sector, moved);
        Ok(moved)
    }

    /// Copy `src` to the erased page `dest` under a new generation
    fn relocate(&mut self, src: u32, dest: u32, file: u32, index: u16) -> Result<(), Error> {
        let PageState::Written(mut header) =
            allocator::read_page_state(&mut self.flash, &self.map, src)?
        else {
            error!("gc: page {} no longer holds a committed header", src);
            return Err(Error::Flash(FlashError::Io));
        };
        header.generation = self.take_sequence();

        let src_offset = self.map.page_offset(src)?;
        let dest_offset = self.map.page_offset(dest)?;
        let page_size = self.map.page_size();

        // Until committed the copy is just garbage
        self.pages.set(dest, Slot::Garbage);

        let mut raw = [0u8; HEAD_DATA_OFFSET];
        let data_offset = header.encode(&mut raw);
        self.flash.program(dest_offset, &raw[..data_offset])?;

        let mut buf = [0u8; COPY_CHUNK];
        let mut at = data_offset as u32;
        while at < page_size {
            let n = (page_size - at).min(COPY_CHUNK as u32) as usize;
            self.flash.read(src_offset + at, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != ERASED_BYTE) {
                self.flash.program(dest_offset + at, &buf[..n])?;
            }
            at += n as u32;
        }

        self.flash
            .program(dest_offset + COMMIT_MARK_OFFSET, &[MARK_SET])?;
        self.pages.set(dest, Slot::Live { file, index });

        // Both copies are committed now; the scan keeps the newer one
        self.pages.set(src, Slot::Garbage);
        if let Err(e) = allocator::mark_dead(&mut self.flash, &self.map, src) {
            warn!("gc: could not retire page {}: {:?}", src, e);
            self.queue_stale(src);
        }

        trace!("gc: file {} chunk {} moved {} -> {}", file, index, src, dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{file_name, FlashRegion, FsConfig};
    use crate::handle::{Access, OpenFile, OpenMode};
    use crate::sim::SimFlash;

    const PPS: u32 = 8;

    /// 7 pool sectors of 8 pages, all erased
    fn empty_fs(mem: &mut [u8]) -> FileSystem<SimFlash<'_>> {
        let config = FsConfig::new(512, FlashRegion::new(0, 32 * 1024));
        FileSystem::mount(SimFlash::new(mem, 4096), config).unwrap()
    }

    fn fill(fs: &mut FileSystem<SimFlash<'_>>, sector: u32, slots: &[Slot]) {
        for (i, slot) in slots.iter().enumerate() {
            fs.pages.set(sector * PPS + i as u32, *slot);
        }
    }

    fn live(file: u32, index: u16) -> Slot {
        Slot::Live { file, index }
    }

    fn reader(file: u32) -> OpenFile {
        OpenFile {
            name: file_name("pinned").unwrap(),
            file,
            size: 10,
            page_count: 1,
            file_type: 0,
            mode: OpenMode::Read,
            access: Access::Read,
            cursor: 0,
            dirty: false,
            poisoned: None,
            cache: None,
        }
    }

    #[test]
    fn test_nothing_to_reclaim() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        assert_eq!(fs.pick_victim(), None);

        fill(&mut fs, 1, &[live(1, 0), live(1, 1)]);
        assert_eq!(fs.pick_victim(), None);
    }

    #[test]
    fn test_fewest_live_pages_wins() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        fill(&mut fs, 1, &[Slot::Garbage, live(1, 0), live(1, 1), live(1, 2)]);
        fill(&mut fs, 4, &[Slot::Garbage, live(2, 0)]);
        assert_eq!(fs.pick_victim(), Some(4));
    }

    #[test]
    fn test_tie_goes_to_lowest_sector() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        fill(&mut fs, 5, &[Slot::Garbage, live(1, 0)]);
        fill(&mut fs, 2, &[live(2, 0), Slot::Garbage]);
        assert_eq!(fs.pick_victim(), Some(2));
    }

    #[test]
    fn test_pinned_sectors_are_skipped() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        fill(&mut fs, 0, &[Slot::Garbage, Slot::Reserved { file: 9, index: 0 }]);
        fill(&mut fs, 1, &[Slot::Garbage, live(3, 0)]);
        fill(&mut fs, 2, &[Slot::Garbage, Slot::Dead { file: 4, index: 0 }]);
        fill(&mut fs, 3, &[Slot::Garbage, live(5, 0), live(5, 1)]);

        fs.handles.insert(reader(3)).unwrap();
        fs.handles.insert(reader(4)).unwrap();
        assert_eq!(fs.pick_victim(), Some(3));
    }

    #[test]
    fn test_unread_dead_pages_are_reclaimable() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        fill(&mut fs, 6, &[Slot::Dead { file: 4, index: 0 }]);
        assert_eq!(fs.pick_victim(), Some(6));
    }

    #[test]
    fn test_live_pages_must_fit_elsewhere() {
        let mut mem = [0xFFu8; 32 * 1024];
        let mut fs = empty_fs(&mut mem);
        let full = [live(1, 0); PPS as usize];
        for sector in 1..7 {
            fill(&mut fs, sector, &full);
        }
        // One erased page left outside sector 0
        fs.pages.set(6 * PPS, Slot::Erased);

        let mut mostly_live = [live(2, 0); PPS as usize];
        mostly_live[0] = Slot::Garbage;
        mostly_live[1] = Slot::Garbage;
        fill(&mut fs, 0, &mostly_live);
        assert_eq!(fs.pick_victim(), None);

        let mut one_live = [Slot::Garbage; PPS as usize];
        one_live[0] = live(2, 0);
        fill(&mut fs, 0, &one_live);
        assert_eq!(fs.pick_victim(), Some(0));
    }
}
