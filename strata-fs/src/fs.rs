//! File system operations
//!
//! [`FileSystem`] owns the flash driver and every in-memory table. All
//! operations take `&mut self` and run to completion; garbage collection
//! happens inside whichever call needs pages.
//!
//! # Commit order
//!
//! A new chain (created or overwritten file) has all of its page headers
//! programmed when the handle opens. Nothing is visible until `close`,
//! which programs the commit marker of every continuation page and then
//! the head page. Only after the head is committed is the superseded chain
//! marked dead. Removal marks the head dead first and the continuations
//! after it. Every interrupted sequence therefore scans back to either the
//! old file or the new one.

use heapless::Vec;
use strata_hal::{flash::ERASED_BYTE, FlashDriver};

use crate::allocator::{self, PageTable, Slot};
use crate::config::{file_name, FileName, FsConfig, MAX_FILES, MAX_PAGES};
use crate::directory::{DirEntry, Directory};
use crate::error::Error;
use crate::handle::{Access, Fd, HandleTable, OpenFile, OpenMode, PageCache, Whence};
use crate::layout::{
    FileMeta, PageHeader, PageLayout, PageState, COMMIT_MARK_OFFSET, FILE_TYPE_DEFAULT,
    HEAD_DATA_OFFSET, MARK_SET,
};
use crate::region::{self, RecordLog, RegionMap, RegionRecord};
use crate::watch::{EventMask, FileEvent, WatchCallback, WatchId, WatchRegistry};

/// Bytes moved per flash read when scanning or copying page contents
pub(crate) const COPY_CHUNK: usize = 64;

/// Declared attributes of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileInfo {
    pub size: u32,
    pub file_type: u8,
}

/// Page usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsStats {
    /// Pool pages across all regions
    pub total_pages: u32,
    /// Pages ready for allocation
    pub erased_pages: u32,
    /// Pages holding committed, reserved or still-referenced data
    pub live_pages: u32,
    /// Pages a sector erase would return
    pub reclaimable_pages: u32,
    /// Live files
    pub files: u32,
    /// Open handles
    pub open_handles: u32,
}

/// Result of a region map migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MigrationOutcome {
    /// Regions added to the recorded map
    pub added: u8,
}

/// Log-structured file system over a [`FlashDriver`]
pub struct FileSystem<F: FlashDriver> {
    pub(crate) flash: F,
    pub(crate) config: FsConfig,
    pub(crate) map: RegionMap,
    pub(crate) layout: PageLayout,
    pub(crate) pages: PageTable,
    pub(crate) directory: Directory,
    pub(crate) handles: HandleTable,
    /// Superseded committed pages whose dead marker could not be programmed
    pub(crate) stale: Vec<u32, MAX_PAGES>,
    watches: WatchRegistry,
    next_sequence: u32,
    last_migration: MigrationOutcome,
}

impl<F: FlashDriver> FileSystem<F> {
    /// Mount the file system described by `config` on `flash`
    ///
    /// Validates the configuration against the device, formats blank flash
    /// when `config.format_if_blank` is set, adds any new regions to the
    /// region map and rebuilds the directory from the page headers.
    pub fn mount(mut flash: F, config: FsConfig) -> Result<Self, Error> {
        let geometry = flash.geometry();
        config.validate(&geometry)?;

        let map = RegionMap::new(&config, geometry.sector_size);
        let log = region::read_log(&mut flash, map.map_offset(), map.sector_size())?;
        let total_pages = map.total_pages();

        let mut fs = Self {
            flash,
            layout: PageLayout::new(config.page_size),
            config,
            map,
            pages: PageTable::new(total_pages),
            directory: Directory::new(),
            handles: HandleTable::new(),
            stale: Vec::new(),
            watches: WatchRegistry::new(),
            next_sequence: 1,
            last_migration: MigrationOutcome::default(),
        };

        if log.latest.is_none() {
            if !fs.config.format_if_blank {
                warn!("mount: no region map found");
                return Err(Error::NotFormatted);
            }
            info!("mount: no region map found, formatting");
            fs.format_regions(false)?;
        }

        fs.last_migration = fs.migrate_regions()?;
        fs.rescan()?;

        info!(
            "mount: {} files, {}/{} pages erased",
            fs.directory.len(),
            fs.pages.erased_count(),
            fs.pages.len()
        );
        Ok(fs)
    }

    /// Drop every handle and hand the flash driver back
    pub fn unmount(self) -> F {
        debug!("unmount: {} handles dropped", self.handles.len());
        self.flash
    }

    /// Active configuration
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Erase every configured region and start empty
    ///
    /// With `full_erase == false` sectors that already read as erased are
    /// skipped. Watches stay registered.
    pub fn format(&mut self, full_erase: bool) -> Result<(), Error> {
        if !self.handles.is_empty() {
            return Err(Error::AlreadyOpen);
        }
        info!("format: full_erase={}", full_erase);
        if let Err(e) = self.format_regions(full_erase) {
            // Resynchronise the tables with whatever reached the flash
            if self.rescan().is_err() {
                self.pages = PageTable::new(self.map.total_pages());
                self.directory = Directory::new();
                self.stale.clear();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Bring the recorded region map in line with the configuration
    ///
    /// A no-op once the configured regions are all recorded.
    pub fn migrate(&mut self) -> Result<MigrationOutcome, Error> {
        self.migrate_regions()
    }

    /// What the migration run by `mount` did
    pub fn last_migration(&self) -> MigrationOutcome {
        self.last_migration
    }

    /// Open `name`
    ///
    /// `declared_size` is used when the call creates a new chain (`Write`
    /// on a missing file, or any `Overwrite`) and ignored otherwise.
    pub fn open(&mut self, name: &str, mode: OpenMode, declared_size: u32) -> Result<Fd, Error> {
        self.open_inner(name, mode, declared_size, None)
    }

    /// Open `name`, recording `file_type` in a newly created chain
    pub fn open_with_type(
        &mut self,
        name: &str,
        mode: OpenMode,
        declared_size: u32,
        file_type: u8,
    ) -> Result<Fd, Error> {
        self.open_inner(name, mode, declared_size, Some(file_type))
    }

    fn open_inner(
        &mut self,
        name: &str,
        mode: OpenMode,
        declared_size: u32,
        file_type: Option<u8>,
    ) -> Result<Fd, Error> {
        let name = file_name(name)?;
        if !self.handles.has_room() {
            return Err(Error::OutOfHandles);
        }
        let existing = self.directory.find(&name).cloned();

        let handle = match (mode, existing) {
            (OpenMode::Read | OpenMode::ReadCached, None) => return Err(Error::NotFound),
            (OpenMode::Read | OpenMode::ReadCached, Some(entry)) => {
                open_file(&entry, mode, Access::Read)
            }
            _ if self.handles.is_writing(&name) => return Err(Error::AlreadyOpen),
            (OpenMode::Write, Some(entry)) => open_file(&entry, mode, Access::InPlace),
            (_, existing) => {
                let file_type = file_type
                    .or(existing.map(|e| e.file_type))
                    .unwrap_or(FILE_TYPE_DEFAULT);
                let entry = self.create_chain(&name, declared_size, file_type)?;
                open_file(&entry, mode, Access::NewChain)
            }
        };

        let file = handle.file;
        let fd = match self.handles.insert(handle) {
            Ok(fd) => fd,
            Err(e) => {
                self.release_reserved(file, Slot::Garbage);
                return Err(e);
            }
        };
        trace!("open: '{}' as {}", name.as_str(), fd.raw());
        Ok(fd)
    }

    /// Reserve and stamp the pages of a new chain
    fn create_chain(&mut self, name: &FileName, size: u32, file_type: u8) -> Result<DirEntry, Error> {
        let page_count = self.layout.pages_for(size);
        if page_count > u16::MAX as u32 || page_count + self.reserve() > self.pages.len() {
            return Err(Error::OutOfStorage);
        }
        if self.directory.find(name).is_none() && !self.directory.has_room() {
            return Err(Error::OutOfStorage);
        }

        self.ensure_free(page_count)?;

        let file = self.take_sequence();
        for index in 0..page_count as u16 {
            match self.pages.next_erased(None) {
                Some(page) => self.pages.set(page, Slot::Reserved { file, index }),
                None => {
                    self.release_reserved(file, Slot::Erased);
                    return Err(Error::OutOfStorage);
                }
            }
        }

        let entry = DirEntry {
            name: name.clone(),
            file,
            size,
            page_count: page_count as u16,
            file_type,
        };
        if let Err(e) = self.program_headers(&entry) {
            self.release_reserved(file, Slot::Garbage);
            return Err(e);
        }

        debug!(
            "create: '{}' file {} size {} pages {}",
            name.as_str(),
            file,
            size,
            page_count
        );
        Ok(entry)
    }

    fn program_headers(&mut self, entry: &DirEntry) -> Result<(), Error> {
        let mut raw = [0u8; HEAD_DATA_OFFSET];
        for (page, slot) in self.pages.iter() {
            let Slot::Reserved { file, index } = slot else {
                continue;
            };
            if file != entry.file {
                continue;
            }
            let header = if index == 0 {
                PageHeader::head(
                    file,
                    file,
                    FileMeta {
                        name: entry.name.clone(),
                        size: entry.size,
                        page_count: entry.page_count,
                        file_type: entry.file_type,
                    },
                )
            } else {
                PageHeader::continuation(file, index, file)
            };
            let len = header.encode(&mut raw);
            self.flash.program(self.map.page_offset(page)?, &raw[..len])?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at the cursor; returns the count read
    ///
    /// A read that would pass the declared size fails whole.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Error> {
        let handle = self.handles.get_mut(fd)?;
        let start = handle.cursor;
        let end = bounded_end(start, buf.len(), handle.size)?;
        let file = handle.file;
        let mut cache = handle.cache.take();

        let result = self.transfer_in(file, start, buf, cache.as_mut());

        let handle = self.handles.get_mut(fd)?;
        handle.cache = cache;
        result?;
        handle.cursor = end;
        Ok(buf.len())
    }

    fn transfer_in(
        &mut self,
        file: u32,
        start: u32,
        buf: &mut [u8],
        mut cache: Option<&mut PageCache>,
    ) -> Result<(), Error> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.layout.locate(start + done as u32);
            let n = (pos.room as usize).min(buf.len() - done);

            let cached = match cache.as_mut() {
                Some(c) => c.get(pos.index),
                None => None,
            };
            let page = match cached {
                Some(page) => page,
                None => {
                    let page = self.pages.find(file, pos.index).ok_or(Error::InvalidHandle)?;
                    if let Some(c) = cache.as_mut() {
                        c.insert(pos.index, page);
                    }
                    page
                }
            };

            self.flash
                .read(self.map.page_offset(page)? + pos.offset, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Write `buf` at the cursor; returns the count written
    ///
    /// On an existing file opened with `Write` this clears bits in place.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, Error> {
        let handle = self.handles.get(fd)?;
        if handle.mode.is_read() {
            return Err(Error::InvalidArgument);
        }
        if let Some(e) = handle.poisoned {
            return Err(e);
        }
        let start = handle.cursor;
        let end = bounded_end(start, buf.len(), handle.size)?;
        let (file, access) = (handle.file, handle.access);

        let result = self.transfer_out(file, start, buf);

        let handle = self.handles.get_mut(fd)?;
        match result {
            Ok(()) => {
                handle.cursor = end;
                handle.dirty |= !buf.is_empty();
                Ok(buf.len())
            }
            Err(e) => {
                warn!("write: file {} failed: {:?}", file, e);
                match access {
                    Access::NewChain => handle.poisoned = Some(e),
                    _ => handle.dirty = true,
                }
                Err(e)
            }
        }
    }

    fn transfer_out(&mut self, file: u32, start: u32, buf: &[u8]) -> Result<(), Error> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.layout.locate(start + done as u32);
            let n = (pos.room as usize).min(buf.len() - done);
            let page = self.pages.find(file, pos.index).ok_or(Error::InvalidHandle)?;
            self.flash
                .program(self.map.page_offset(page)? + pos.offset, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Move the cursor; returns the new offset
    pub fn seek(&mut self, fd: Fd, offset: i32, whence: Whence) -> Result<u32, Error> {
        let handle = self.handles.get_mut(fd)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => handle.cursor as i64,
        };
        let target = base + offset as i64;
        if target < 0 || target > handle.size as i64 {
            return Err(Error::RangeError);
        }
        handle.cursor = target as u32;
        Ok(handle.cursor)
    }

    /// Declared size of the file behind `fd`; `NotFound` if `fd` is not open
    pub fn size(&self, fd: Fd) -> Result<u32, Error> {
        self.handles
            .get(fd)
            .map(|handle| handle.size)
            .map_err(|_| Error::NotFound)
    }

    /// Close `fd`, committing a new chain
    ///
    /// A new chain whose write failed is abandoned and the failure is
    /// returned; the previous version of the file stays in place.
    pub fn close(&mut self, fd: Fd) -> Result<(), Error> {
        let handle = self.handles.remove(fd)?;
        let result = match handle.access {
            Access::Read => Ok(()),
            Access::InPlace => {
                if handle.dirty && self.directory.by_file(handle.file).is_some() {
                    self.watches.notify(&handle.name, FileEvent::Modified);
                }
                Ok(())
            }
            Access::NewChain => match handle.poisoned {
                Some(e) => {
                    warn!("close: abandoning file {} after {:?}", handle.file, e);
                    self.release_reserved(handle.file, Slot::Garbage);
                    Err(e)
                }
                None => self.commit(&handle),
            },
        };
        self.release_superseded(handle.file);
        result
    }

    fn commit(&mut self, handle: &OpenFile) -> Result<(), Error> {
        let file = handle.file;
        if self.directory.find(&handle.name).is_none() && !self.directory.has_room() {
            self.release_reserved(file, Slot::Garbage);
            return Err(Error::OutOfStorage);
        }

        // Continuations first; a committed head implies a complete chain
        let order = (1..handle.page_count).chain(core::iter::once(0));
        for index in order {
            if let Err(e) = self.commit_page(file, index) {
                self.release_reserved(file, Slot::Garbage);
                return Err(e);
            }
        }

        for page in 0..self.pages.len() {
            if let Slot::Reserved { file: f, index } = self.pages.get(page) {
                if f == file {
                    self.pages.set(page, Slot::Live { file, index });
                }
            }
        }

        let replaced = self.directory.upsert(DirEntry {
            name: handle.name.clone(),
            file,
            size: handle.size,
            page_count: handle.page_count,
            file_type: handle.file_type,
        })?;
        if let Some(old) = replaced {
            // The new version is already durable; pages that cannot be
            // marked dead now are queued and retried before any removal
            let _ = self.retry_stale(None);
            let _ = self.retire_chain(&old, false);
        }

        debug!("commit: '{}' file {}", handle.name.as_str(), file);
        self.watches.notify(&handle.name, FileEvent::Modified);
        Ok(())
    }

    fn commit_page(&mut self, file: u32, index: u16) -> Result<(), Error> {
        let page = self.pages.find(file, index).ok_or(Error::InvalidHandle)?;
        self.flash
            .program(self.map.page_offset(page)? + COMMIT_MARK_OFFSET, &[MARK_SET])?;
        Ok(())
    }

    /// Close `fd`, then remove its file
    pub fn close_and_remove(&mut self, fd: Fd) -> Result<(), Error> {
        let name = self.handles.get(fd)?.name.clone();
        self.close(fd)?;
        self.remove(&name)
    }

    /// Remove `name`
    ///
    /// Handles already open on the file keep reading the removed version
    /// until they close. Fails without changing anything while an older
    /// committed head of `name` is still waiting for its dead marker.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        file_name(name)?;
        let entry = self.directory.find(name).cloned().ok_or(Error::NotFound)?;
        self.retry_stale(Some(name))?;
        self.retire_chain(&entry, true)?;
        self.directory.remove(name);
        debug!("remove: '{}' file {}", name, entry.file);
        self.watches.notify(name, FileEvent::Removed);
        Ok(())
    }

    /// Remove every file whose name satisfies `filter`
    pub fn remove_matching(&mut self, filter: &dyn Fn(&str) -> bool) -> Result<usize, Error> {
        let names = self.enumerate(Some(filter));
        for name in names.iter() {
            self.remove(name)?;
        }
        Ok(names.len())
    }

    /// Whether `name` exists
    pub fn exists(&self, name: &str) -> bool {
        self.directory.find(name).is_some()
    }

    /// Declared size and type of `name`
    pub fn file_info(&self, name: &str) -> Result<FileInfo, Error> {
        let entry = self.directory.find(name).ok_or(Error::NotFound)?;
        Ok(FileInfo {
            size: entry.size,
            file_type: entry.file_type,
        })
    }

    /// Snapshot of live file names, optionally filtered
    pub fn enumerate(&self, filter: Option<&dyn Fn(&str) -> bool>) -> Vec<FileName, MAX_FILES> {
        let mut names = Vec::new();
        for entry in self.directory.iter() {
            if filter.map_or(true, |f| f(entry.name.as_str())) {
                // The directory holds at most MAX_FILES entries
                let _ = names.push(entry.name.clone());
            }
        }
        names
    }

    /// Call `callback` with `ctx` for `mask` events on `name`
    pub fn watch(
        &mut self,
        name: &str,
        mask: EventMask,
        callback: WatchCallback,
        ctx: usize,
    ) -> Result<WatchId, Error> {
        let name = file_name(name)?;
        self.watches.add(name, mask, callback, ctx)
    }

    /// Drop a watch
    pub fn unwatch(&mut self, id: WatchId) -> Result<(), Error> {
        self.watches.remove(id)
    }

    /// Page usage snapshot
    pub fn stats(&self) -> FsStats {
        let mut stats = FsStats {
            total_pages: self.pages.len(),
            files: self.directory.len() as u32,
            open_handles: self.handles.len() as u32,
            ..FsStats::default()
        };
        for (_, slot) in self.pages.iter() {
            match slot {
                Slot::Erased => stats.erased_pages += 1,
                Slot::Live { .. } | Slot::Reserved { .. } => stats.live_pages += 1,
                Slot::Dead { file, .. } if self.handles.pins(file) => stats.live_pages += 1,
                Slot::Dead { .. } | Slot::Garbage => stats.reclaimable_pages += 1,
            }
        }
        stats
    }

    /// Approximate bytes a new file could still use
    pub fn free_bytes(&self) -> u32 {
        let stats = self.stats();
        let usable = (stats.erased_pages + stats.reclaimable_pages).saturating_sub(self.reserve());
        usable * self.layout.continuation_capacity()
    }

    /// Handles currently open
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Erased pages held back for the garbage collector
    pub(crate) fn reserve(&self) -> u32 {
        self.map.pages_per_sector()
    }

    pub(crate) fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }

    /// Turn the reserved pages of `file` into `to`
    fn release_reserved(&mut self, file: u32, to: Slot) {
        for page in 0..self.pages.len() {
            if matches!(self.pages.get(page), Slot::Reserved { file: f, .. } if f == file) {
                self.pages.set(page, to);
            }
        }
    }

    /// Superseded pages of `file` become reclaimable once nothing reads them
    fn release_superseded(&mut self, file: u32) {
        if self.handles.pins(file) {
            return;
        }
        for page in 0..self.pages.len() {
            if matches!(self.pages.get(page), Slot::Dead { file: f, .. } if f == file) {
                self.pages.set(page, Slot::Garbage);
            }
        }
    }

    /// Mark every page of `entry`'s chain dead, head first
    ///
    /// With `strict`, a failure on the head leaves the chain untouched and
    /// is returned; later failures are logged and left to the next scan.
    fn retire_chain(&mut self, entry: &DirEntry, strict: bool) -> Result<(), Error> {
        let pinned = self.handles.pins(entry.file);
        for index in 0..entry.page_count {
            let Some(page) = self.pages.find(entry.file, index) else {
                continue;
            };
            if !matches!(self.pages.get(page), Slot::Live { .. }) {
                continue;
            }
            if let Err(e) = allocator::mark_dead(&mut self.flash, &self.map, page) {
                if strict && index == 0 {
                    return Err(e);
                }
                warn!("retire: page {} of file {}: {:?}", page, entry.file, e);
                self.queue_stale(page);
            }
            let slot = if pinned {
                Slot::Dead {
                    file: entry.file,
                    index,
                }
            } else {
                Slot::Garbage
            };
            self.pages.set(page, slot);
        }
        Ok(())
    }

    /// Remember a committed page that still needs its dead marker
    pub(crate) fn queue_stale(&mut self, page: u32) {
        if !self.stale.contains(&page) {
            // At most one entry per pool page
            let _ = self.stale.push(page);
        }
    }

    /// Retry the dead markers that failed earlier
    ///
    /// Pages that still fail stay queued. With `name`, the first failure on
    /// a committed head of that name is returned, since removing the file
    /// now would let the scan bring that head back.
    fn retry_stale(&mut self, name: Option<&str>) -> Result<(), Error> {
        let mut blocking = None;
        let mut i = 0;
        while i < self.stale.len() {
            let page = self.stale[i];
            match allocator::mark_dead(&mut self.flash, &self.map, page) {
                Ok(()) => {
                    self.stale.swap_remove(i);
                }
                Err(e) => {
                    if blocking.is_none() && name.is_some_and(|n| self.is_head_named(page, n)) {
                        blocking = Some(e);
                    }
                    i += 1;
                }
            }
        }
        match blocking {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether `page` holds a committed head of `name`; unreadable counts
    fn is_head_named(&mut self, page: u32, name: &str) -> bool {
        match allocator::read_page_state(&mut self.flash, &self.map, page) {
            Ok(PageState::Written(header)) => header
                .meta
                .is_some_and(|meta| meta.name.as_str() == name),
            Ok(_) => false,
            Err(_) => true,
        }
    }

    fn rescan(&mut self) -> Result<(), Error> {
        let scanned = allocator::scan(&mut self.flash, &self.map)?;
        self.pages = scanned.pages;
        self.directory = scanned.directory;
        self.stale = scanned.stale;
        self.next_sequence = scanned.next_sequence;
        Ok(())
    }

    fn format_regions(&mut self, full_erase: bool) -> Result<(), Error> {
        // The map sector goes first so an interrupted format is redone
        self.erase_sector_if_needed(self.map.map_offset(), full_erase)?;
        for sector in 0..self.map.total_sectors() {
            let offset = self.map.sector_offset(sector)?;
            self.erase_sector_if_needed(offset, full_erase)?;
        }

        let record = RegionRecord::from_regions(&self.config.regions);
        let log = RecordLog {
            latest: None,
            next_slot: Some(0),
        };
        region::append_record(&mut self.flash, self.map.map_offset(), &log, &record)?;

        self.pages = PageTable::new(self.map.total_pages());
        self.directory = Directory::new();
        self.stale.clear();
        self.next_sequence = 1;
        Ok(())
    }

    fn erase_sector_if_needed(&mut self, offset: u32, force: bool) -> Result<(), Error> {
        if force || !self.sector_is_blank(offset)? {
            self.flash.erase_sector(offset)?;
        }
        Ok(())
    }

    fn sector_is_blank(&mut self, offset: u32) -> Result<bool, Error> {
        let sector = self.map.sector_size();
        let mut buf = [0u8; COPY_CHUNK];
        let mut at = 0;
        while at < sector {
            let n = (sector - at).min(COPY_CHUNK as u32) as usize;
            self.flash.read(offset + at, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != ERASED_BYTE) {
                return Ok(false);
            }
            at += n as u32;
        }
        Ok(true)
    }

    fn migrate_regions(&mut self) -> Result<MigrationOutcome, Error> {
        let map_offset = self.map.map_offset();
        let sector = self.map.sector_size();
        let log = region::read_log(&mut self.flash, map_offset, sector)?;
        let recorded = log.latest.as_ref().ok_or(Error::NotFormatted)?;

        if !recorded.is_prefix_of(&self.config.regions) {
            warn!(
                "migrate: {} recorded regions do not match {} configured",
                recorded.entries.len(),
                self.config.regions.len()
            );
            return Err(Error::LayoutMismatch);
        }

        let known = recorded.entries.len();
        let added = self.config.regions.len() - known;
        if added == 0 {
            return Ok(MigrationOutcome::default());
        }

        for i in known..self.config.regions.len() {
            let region = self.config.regions[i];
            let mut offset = region.offset;
            while (offset as u64) < region.end() {
                self.flash.erase_sector(offset)?;
                offset += sector;
            }
            for page in self.map.region_pages(i) {
                self.pages.set(page, Slot::Erased);
            }
            info!("migrate: region {} at {:#x} erased", i, region.offset);
        }

        // Until this record lands the old map stays in force
        let record = RegionRecord::from_regions(&self.config.regions);
        region::append_record(&mut self.flash, map_offset, &log, &record)?;

        Ok(MigrationOutcome { added: added as u8 })
    }
}

fn open_file(entry: &DirEntry, mode: OpenMode, access: Access) -> OpenFile {
    OpenFile {
        name: entry.name.clone(),
        file: entry.file,
        size: entry.size,
        page_count: entry.page_count,
        file_type: entry.file_type,
        mode,
        access,
        cursor: 0,
        dirty: false,
        poisoned: None,
        cache: (mode == OpenMode::ReadCached).then(PageCache::new),
    }
}

/// End offset of a `len`-byte transfer at `start`, or `RangeError`
fn bounded_end(start: u32, len: usize, size: u32) -> Result<u32, Error> {
    let end = start as u64 + len as u64;
    if end > size as u64 {
        return Err(Error::RangeError);
    }
    Ok(end as u32)
}
