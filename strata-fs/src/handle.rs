//! Open file handles
//!
//! Handles live in a fixed arena. An [`Fd`] carries the slot index and the
//! slot's generation at the time it was issued, so a handle that outlives
//! its `close` is rejected instead of aliasing a newer open file.

use crate::config::{FileName, MAX_HANDLES, PAGE_CACHE_SLOTS};
use crate::error::Error;

/// Open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    /// Read an existing file
    Read,
    /// Read with a page lookup cache
    ReadCached,
    /// Create, or clear bits of an existing file in place
    Write,
    /// Replace the file atomically on close
    Overwrite,
}

impl OpenMode {
    /// Whether handles in this mode only read
    pub fn is_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadCached)
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Whence {
    /// From the start of the file
    Set,
    /// From the current position
    Cur,
}

/// File handle token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fd {
    slot: u8,
    generation: u16,
}

impl Fd {
    /// Integer form for passing across FFI-like boundaries; never 0
    pub fn raw(self) -> u32 {
        ((self.generation as u32) << 8) | (self.slot as u32 + 1)
    }

    /// Rebuild a handle from [`Fd::raw`]
    pub fn from_raw(raw: u32) -> Option<Self> {
        let low = (raw & 0xFF) as u8;
        if low == 0 || raw >> 24 != 0 {
            return None;
        }
        Some(Self {
            slot: low - 1,
            generation: (raw >> 8) as u16,
        })
    }
}

/// What a handle does to flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Access {
    /// Reads a committed chain
    Read,
    /// Writes a reserved chain that becomes the file on close
    NewChain,
    /// Programs over a committed chain
    InPlace,
}

/// Direct-mapped cache from chunk index to global page number
#[derive(Debug, Clone)]
pub struct PageCache {
    entries: [Option<(u16, u32)>; PAGE_CACHE_SLOTS],
    hits: u32,
    misses: u32,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            entries: [None; PAGE_CACHE_SLOTS],
            hits: 0,
            misses: 0,
        }
    }

    /// Cached page for chunk `index`
    pub fn get(&mut self, index: u16) -> Option<u32> {
        match self.entries[index as usize % PAGE_CACHE_SLOTS] {
            Some((i, page)) if i == index => {
                self.hits += 1;
                Some(page)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Remember that chunk `index` lives in `page`
    pub fn insert(&mut self, index: u16, page: u32) {
        self.entries[index as usize % PAGE_CACHE_SLOTS] = Some((index, page));
    }

    /// (hits, misses) since the handle opened
    pub fn counters(&self) -> (u32, u32) {
        (self.hits, self.misses)
    }
}

/// State of one open handle
#[derive(Debug, Clone)]
pub struct OpenFile {
    /// Name the handle was opened with
    pub name: FileName,
    /// Chain the handle reads or writes
    pub file: u32,
    /// Declared size
    pub size: u32,
    /// Pages in the chain
    pub page_count: u16,
    /// Declared file type
    pub file_type: u8,
    /// Open mode
    pub mode: OpenMode,
    /// Flash access kind
    pub access: Access,
    /// Seek cursor, at most `size`
    pub cursor: u32,
    /// Any bytes written through this handle
    pub dirty: bool,
    /// First write failure on a new chain; the chain is abandoned on close
    pub poisoned: Option<Error>,
    /// Lookup cache for `ReadCached` handles
    pub cache: Option<PageCache>,
}

/// Arena of open handles
#[derive(Debug)]
pub struct HandleTable {
    slots: [Option<OpenFile>; MAX_HANDLES],
    generations: [u16; MAX_HANDLES],
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            generations: [0; MAX_HANDLES],
        }
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no handle is open
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Whether another handle can be opened
    pub fn has_room(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Store `file` in a free slot
    pub fn insert(&mut self, file: OpenFile) -> Result<Fd, Error> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::OutOfHandles)?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.slots[slot] = Some(file);
        Ok(Fd {
            slot: slot as u8,
            generation: self.generations[slot],
        })
    }

    fn index(&self, fd: Fd) -> Result<usize, Error> {
        let slot = fd.slot as usize;
        match self.slots.get(slot) {
            Some(Some(_)) if self.generations[slot] == fd.generation => Ok(slot),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn get(&self, fd: Fd) -> Result<&OpenFile, Error> {
        let slot = self.index(fd)?;
        self.slots[slot].as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, Error> {
        let slot = self.index(fd)?;
        self.slots[slot].as_mut().ok_or(Error::InvalidHandle)
    }

    /// Release the slot of `fd`
    pub fn remove(&mut self, fd: Fd) -> Result<OpenFile, Error> {
        let slot = self.index(fd)?;
        self.slots[slot].take().ok_or(Error::InvalidHandle)
    }

    /// Iterate over open handles
    pub fn iter(&self) -> impl Iterator<Item = &OpenFile> {
        self.slots.iter().flatten()
    }

    /// Whether a write handle is open on `name`
    pub fn is_writing(&self, name: &str) -> bool {
        self.iter()
            .any(|h| !h.mode.is_read() && h.name.as_str() == name)
    }

    /// Whether any handle references chain `file`
    pub fn pins(&self, file: u32) -> bool {
        self.iter().any(|h| h.file == file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file_name;

    fn open_file(name: &str, mode: OpenMode) -> OpenFile {
        OpenFile {
            name: file_name(name).unwrap(),
            file: 1,
            size: 100,
            page_count: 1,
            file_type: 0,
            mode,
            access: Access::Read,
            cursor: 0,
            dirty: false,
            poisoned: None,
            cache: None,
        }
    }

    #[test]
    fn test_raw_roundtrip_never_zero() {
        let mut table = HandleTable::new();
        let fd = table.insert(open_file("a", OpenMode::Read)).unwrap();
        assert_ne!(fd.raw(), 0);
        assert_eq!(Fd::from_raw(fd.raw()), Some(fd));
        assert_eq!(Fd::from_raw(0), None);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = HandleTable::new();
        let first = table.insert(open_file("a", OpenMode::Read)).unwrap();
        table.remove(first).unwrap();

        let second = table.insert(open_file("b", OpenMode::Read)).unwrap();
        assert_ne!(first, second);
        assert_eq!(table.get(first).err(), Some(Error::InvalidHandle));
        assert_eq!(table.get(second).map(|f| f.name.as_str()), Ok("b"));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut table = HandleTable::new();
        let mut fds = [None; MAX_HANDLES];
        for fd in fds.iter_mut() {
            *fd = Some(table.insert(open_file("a", OpenMode::Read)).unwrap());
        }
        assert_eq!(
            table.insert(open_file("a", OpenMode::Read)).err(),
            Some(Error::OutOfHandles)
        );
        assert_eq!(table.len(), MAX_HANDLES);

        table.remove(fds[3].unwrap()).unwrap();
        assert!(table.insert(open_file("a", OpenMode::Read)).is_ok());
    }

    #[test]
    fn test_writer_tracking() {
        let mut table = HandleTable::new();
        table.insert(open_file("log", OpenMode::Read)).unwrap();
        assert!(!table.is_writing("log"));
        table.insert(open_file("log", OpenMode::Overwrite)).unwrap();
        assert!(table.is_writing("log"));
        assert!(table.pins(1));
        assert!(!table.pins(2));
    }

    #[test]
    fn test_page_cache_direct_mapped() {
        let mut cache = PageCache::new();
        assert_eq!(cache.get(3), None);
        cache.insert(3, 40);
        assert_eq!(cache.get(3), Some(40));

        // Same bucket evicts
        cache.insert(3 + PAGE_CACHE_SLOTS as u16, 41);
        assert_eq!(cache.get(3), None);
        assert_eq!(cache.counters(), (1, 2));
    }
}
