//! File system configuration
//!
//! Capacity limits are compile-time constants so every table lives in
//! statically sized storage. The flash layout is described at runtime by
//! [`FsConfig`], which is fixed per build but may grow across firmware
//! upgrades (see region migration).

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use strata_hal::FlashGeometry;

use crate::error::Error;
use crate::layout::HEAD_DATA_OFFSET;

/// Maximum file name length in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Maximum number of live files
pub const MAX_FILES: usize = 96;

/// Capacity of the handle table
pub const MAX_HANDLES: usize = 8;

/// Capacity of the watch registry
pub const MAX_WATCHES: usize = 8;

/// Maximum number of flash regions
pub const MAX_REGIONS: usize = 4;

/// Maximum number of pool pages across all regions
pub const MAX_PAGES: usize = 1024;

/// Entries in a per-handle page lookup cache
pub const PAGE_CACHE_SLOTS: usize = 16;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: u32 = 2 * HEAD_DATA_OFFSET as u32;

/// A file name
pub type FileName = String<MAX_NAME_LEN>;

/// One contiguous slice of flash dedicated to the file system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    /// Byte offset of the region on the device (sector aligned)
    pub offset: u32,
    /// Length in bytes (multiple of the sector size)
    pub len: u32,
}

impl FlashRegion {
    /// Create a region description
    pub const fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    /// One past the last byte of the region
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.len as u64
    }

    fn overlaps(&self, other: &FlashRegion) -> bool {
        (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }
}

/// File system configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsConfig {
    /// Allocation unit in bytes; must divide the erase sector size
    pub page_size: u32,
    /// Flash regions, in the order they were (or will be) added
    pub regions: Vec<FlashRegion, MAX_REGIONS>,
    /// Format the regions when no region map is found at mount
    pub format_if_blank: bool,
}

impl FsConfig {
    /// Create a configuration with a single region
    pub fn new(page_size: u32, region: FlashRegion) -> Self {
        let mut regions = Vec::new();
        // Capacity is at least one
        let _ = regions.push(region);
        Self {
            page_size,
            regions,
            format_if_blank: true,
        }
    }

    /// Append another region
    pub fn with_region(mut self, region: FlashRegion) -> Result<Self, Error> {
        self.regions
            .push(region)
            .map_err(|_| Error::InvalidArgument)?;
        Ok(self)
    }

    /// Require an explicit format when the flash holds no region map
    pub fn without_auto_format(mut self) -> Self {
        self.format_if_blank = false;
        self
    }

    /// Pages per erase sector for the given geometry
    pub fn pages_per_sector(&self, geometry: &FlashGeometry) -> u32 {
        geometry.sector_size / self.page_size
    }

    /// Check the configuration against the device it will run on
    pub fn validate(&self, geometry: &FlashGeometry) -> Result<(), Error> {
        let sector = geometry.sector_size;
        if self.page_size < MIN_PAGE_SIZE || sector == 0 || self.page_size > sector {
            return Err(Error::InvalidArgument);
        }
        if sector % self.page_size != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.regions.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut total_pages: u64 = 0;
        for (i, region) in self.regions.iter().enumerate() {
            if region.len == 0
                || !geometry.is_sector_aligned(region.offset)
                || region.len % sector != 0
                || region.end() > geometry.capacity as u64
            {
                return Err(Error::InvalidArgument);
            }
            if self.regions[..i].iter().any(|r| r.overlaps(region)) {
                return Err(Error::InvalidArgument);
            }

            // Region 0 gives up its first sector to the region map
            let pool = if i == 0 {
                if region.len < 2 * sector {
                    return Err(Error::InvalidArgument);
                }
                region.len - sector
            } else {
                region.len
            };
            let pages = (pool / self.page_size) as u64;
            if pages > u16::MAX as u64 + 1 {
                return Err(Error::InvalidArgument);
            }
            total_pages += pages;
        }

        let reserve = self.pages_per_sector(geometry) as u64;
        if total_pages > MAX_PAGES as u64 || total_pages <= reserve {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Build a [`FileName`], rejecting empty or oversized names
pub fn file_name(name: &str) -> Result<FileName, Error> {
    if name.is_empty() {
        return Err(Error::InvalidArgument);
    }
    let mut out = FileName::new();
    out.push_str(name).map_err(|_| Error::InvalidArgument)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: FlashGeometry = FlashGeometry::new(64 * 1024, 4096);

    #[test]
    fn test_valid_single_region() {
        let config = FsConfig::new(512, FlashRegion::new(0, 32 * 1024));
        assert_eq!(config.validate(&GEOMETRY), Ok(()));
        assert_eq!(config.pages_per_sector(&GEOMETRY), 8);
    }

    #[test]
    fn test_page_size_must_divide_sector() {
        let config = FsConfig::new(768, FlashRegion::new(0, 32 * 1024));
        assert_eq!(config.validate(&GEOMETRY), Err(Error::InvalidArgument));

        let tiny = FsConfig::new(64, FlashRegion::new(0, 32 * 1024));
        assert_eq!(tiny.validate(&GEOMETRY), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_region_alignment_and_bounds() {
        let unaligned = FsConfig::new(512, FlashRegion::new(100, 32 * 1024));
        assert_eq!(unaligned.validate(&GEOMETRY), Err(Error::InvalidArgument));

        let too_long = FsConfig::new(512, FlashRegion::new(32 * 1024, 64 * 1024));
        assert_eq!(too_long.validate(&GEOMETRY), Err(Error::InvalidArgument));

        // Region 0 needs the map sector plus at least one pool sector
        let too_short = FsConfig::new(512, FlashRegion::new(0, 4096));
        assert_eq!(too_short.validate(&GEOMETRY), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let config = FsConfig::new(512, FlashRegion::new(0, 32 * 1024))
            .with_region(FlashRegion::new(16 * 1024, 16 * 1024))
            .unwrap();
        assert_eq!(config.validate(&GEOMETRY), Err(Error::InvalidArgument));

        let disjoint = FsConfig::new(512, FlashRegion::new(0, 32 * 1024))
            .with_region(FlashRegion::new(32 * 1024, 32 * 1024))
            .unwrap();
        assert_eq!(disjoint.validate(&GEOMETRY), Ok(()));
    }

    #[test]
    fn test_file_name_limits() {
        assert!(file_name("settings").is_ok());
        assert_eq!(file_name(""), Err(Error::InvalidArgument));

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(file_name(&long), Err(Error::InvalidArgument));
        let exact = "y".repeat(MAX_NAME_LEN);
        assert!(file_name(&exact).is_ok());
    }
}
