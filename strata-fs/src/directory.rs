//! In-memory directory of live files

use heapless::Vec;

use crate::config::{FileName, MAX_FILES};
use crate::error::Error;

/// One live file
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DirEntry {
    /// File name
    pub name: FileName,
    /// Creation sequence number, shared by every page of the chain
    pub file: u32,
    /// Declared size in bytes
    pub size: u32,
    /// Pages in the chain
    pub page_count: u16,
    /// Declared file type
    pub file_type: u8,
}

/// Name-indexed table of live files
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Vec<DirEntry, MAX_FILES>,
}

impl Directory {
    /// Empty directory
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of live files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a file by name
    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name.as_str() == name)
    }

    /// Look up a file by its sequence number
    pub fn by_file(&self, file: u32) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.file == file)
    }

    /// Insert `entry`, replacing any entry with the same name
    ///
    /// Returns the replaced entry.
    pub fn upsert(&mut self, entry: DirEntry) -> Result<Option<DirEntry>, Error> {
        if let Some(slot) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            return Ok(Some(core::mem::replace(slot, entry)));
        }
        self.entries.push(entry).map_err(|_| Error::OutOfStorage)?;
        Ok(None)
    }

    /// Remove a file by name
    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        let pos = self.entries.iter().position(|e| e.name.as_str() == name)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Remove a file by sequence number
    pub fn remove_file(&mut self, file: u32) -> Option<DirEntry> {
        let pos = self.entries.iter().position(|e| e.file == file)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Iterate over live files in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    /// Whether a new name can be added
    pub fn has_room(&self) -> bool {
        !self.entries.is_full()
    }
}
