//! Region map and migration record
//!
//! The file system owns one or more contiguous flash regions. The first
//! erase sector of region 0 is the *map sector*: an append-only log of
//! fixed-size record slots, each holding the postcard-encoded list of
//! regions the file system has been formatted over:
//!
//! ```text
//! ┌─────┬──────────────────────┬───────┬─────────┐
//! │ LEN │ POSTCARD RECORD      │ CRC32 │ 0xFF .. │
//! │ 1B  │ LEN bytes            │ 4B    │ padding │
//! └─────┴──────────────────────┴───────┴─────────┘
//! ```
//!
//! The last slot with a valid CRC is authoritative. Growing the storage
//! partition appends a new slot; existing slots are never rewritten.
//!
//! Every other sector of every region belongs to the page pool. Pages are
//! numbered globally in physical order (region 0 first) and addressed on
//! flash by [`PageAddr`] pairs that are checked against the map on every
//! dereference.

use core::ops::Range;

use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use strata_hal::FlashDriver;

use crate::config::{FlashRegion, FsConfig, MAX_REGIONS};
use crate::error::Error;
use crate::layout::FORMAT_VERSION;

/// Size of one record slot in the map sector
pub const RECORD_SLOT_LEN: usize = 64;

/// Largest postcard payload that fits a slot
const RECORD_PAYLOAD_MAX: usize = RECORD_SLOT_LEN - 1 - 4;

const EMPTY_SLOT: u8 = 0xFF;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Physical page address: region index plus page index inside the region pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageAddr {
    /// Region index
    pub region: u8,
    /// Page index within the region's pool
    pub page: u16,
}

/// One recorded region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegionEntry {
    /// Byte offset on the device
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
    /// Page format version the region was formatted with
    pub version: u8,
}

/// Persisted region map record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegionRecord {
    /// Regions in the order they were added
    pub entries: Vec<RegionEntry, MAX_REGIONS>,
}

impl RegionRecord {
    /// Record describing `regions` at the current format version
    pub fn from_regions(regions: &[FlashRegion]) -> Self {
        let mut entries = Vec::new();
        for region in regions.iter().take(MAX_REGIONS) {
            // Bounded by take()
            let _ = entries.push(RegionEntry {
                offset: region.offset,
                len: region.len,
                version: FORMAT_VERSION,
            });
        }
        Self { entries }
    }

    /// Whether every recorded region matches the configured region at the same index
    pub fn is_prefix_of(&self, regions: &[FlashRegion]) -> bool {
        self.entries.len() <= regions.len()
            && self
                .entries
                .iter()
                .zip(regions)
                .all(|(e, r)| e.offset == r.offset && e.len == r.len && e.version == FORMAT_VERSION)
    }

    /// Encode into a record slot
    pub fn encode_slot(&self, out: &mut [u8; RECORD_SLOT_LEN]) -> Result<(), Error> {
        out.fill(EMPTY_SLOT);
        let len = postcard::to_slice(self, &mut out[1..1 + RECORD_PAYLOAD_MAX])
            .map_err(|_| Error::InvalidArgument)?
            .len();
        out[0] = len as u8;
        let crc = CRC32.checksum(&out[..1 + len]);
        out[1 + len..5 + len].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decode a used record slot; `None` if torn or corrupt
    pub fn decode_slot(slot: &[u8; RECORD_SLOT_LEN]) -> Option<Self> {
        let len = slot[0] as usize;
        if len > RECORD_PAYLOAD_MAX {
            return None;
        }
        let stored = u32::from_le_bytes([
            slot[1 + len],
            slot[2 + len],
            slot[3 + len],
            slot[4 + len],
        ]);
        if stored != CRC32.checksum(&slot[..1 + len]) {
            return None;
        }
        postcard::from_bytes(&slot[1..1 + len]).ok()
    }
}

/// Contents of the map sector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordLog {
    /// Latest valid record, if any
    pub latest: Option<RegionRecord>,
    /// First unused slot, `None` when the sector is full
    pub next_slot: Option<u32>,
}

/// Read the record log from the map sector at `map_offset`
pub fn read_log<F: FlashDriver>(
    flash: &mut F,
    map_offset: u32,
    sector_size: u32,
) -> Result<RecordLog, Error> {
    let slots = sector_size / RECORD_SLOT_LEN as u32;
    let mut log = RecordLog::default();
    let mut slot = [0u8; RECORD_SLOT_LEN];

    for i in 0..slots {
        flash.read(map_offset + i * RECORD_SLOT_LEN as u32, &mut slot)?;
        if slot[0] == EMPTY_SLOT {
            log.next_slot = Some(i);
            break;
        }
        if let Some(record) = RegionRecord::decode_slot(&slot) {
            log.latest = Some(record);
        }
    }
    Ok(log)
}

/// Append `record` to the log
pub fn append_record<F: FlashDriver>(
    flash: &mut F,
    map_offset: u32,
    log: &RecordLog,
    record: &RegionRecord,
) -> Result<(), Error> {
    let slot_index = log.next_slot.ok_or(Error::OutOfStorage)?;
    let mut slot = [0u8; RECORD_SLOT_LEN];
    record.encode_slot(&mut slot)?;
    flash.program(map_offset + slot_index * RECORD_SLOT_LEN as u32, &slot)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionSpan {
    /// Byte offset of the first pool page
    pool_offset: u32,
    /// Pool pages in this region
    pages: u32,
    /// Global number of the first pool page
    first_page: u32,
}

/// Runtime view of the regions as a single numbered page pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMap {
    spans: Vec<RegionSpan, MAX_REGIONS>,
    map_offset: u32,
    page_size: u32,
    sector_size: u32,
    total_pages: u32,
}

impl RegionMap {
    /// Build the map for a validated configuration
    pub fn new(config: &FsConfig, sector_size: u32) -> Self {
        let mut spans = Vec::new();
        let mut first_page = 0;
        for (i, region) in config.regions.iter().enumerate() {
            let skip = if i == 0 { sector_size } else { 0 };
            let pages = (region.len - skip) / config.page_size;
            // Bounded by MAX_REGIONS in the config
            let _ = spans.push(RegionSpan {
                pool_offset: region.offset + skip,
                pages,
                first_page,
            });
            first_page += pages;
        }
        Self {
            spans,
            map_offset: config.regions.first().map(|r| r.offset).unwrap_or(0),
            page_size: config.page_size,
            sector_size,
            total_pages: first_page,
        }
    }

    /// Byte offset of the map sector
    pub fn map_offset(&self) -> u32 {
        self.map_offset
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Erase sector size in bytes
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Number of pool pages
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Pages per erase sector
    pub fn pages_per_sector(&self) -> u32 {
        self.sector_size / self.page_size
    }

    /// Number of pool sectors
    pub fn total_sectors(&self) -> u32 {
        self.total_pages / self.pages_per_sector()
    }

    /// Physical address of global page `page`
    pub fn addr_of(&self, page: u32) -> Option<PageAddr> {
        self.spans.iter().enumerate().find_map(|(i, span)| {
            (page >= span.first_page && page < span.first_page + span.pages).then(|| PageAddr {
                region: i as u8,
                page: (page - span.first_page) as u16,
            })
        })
    }

    /// Global page number of `addr`
    pub fn page_of(&self, addr: PageAddr) -> Option<u32> {
        let span = self.spans.get(addr.region as usize)?;
        ((addr.page as u32) < span.pages).then(|| span.first_page + addr.page as u32)
    }

    /// Byte offset of `addr` on the device
    pub fn offset_of(&self, addr: PageAddr) -> Option<u32> {
        let span = self.spans.get(addr.region as usize)?;
        ((addr.page as u32) < span.pages).then(|| span.pool_offset + addr.page as u32 * self.page_size)
    }

    /// Byte offset of global page `page`
    pub fn page_offset(&self, page: u32) -> Result<u32, Error> {
        self.addr_of(page)
            .and_then(|addr| self.offset_of(addr))
            .ok_or(Error::InvalidArgument)
    }

    /// Global pages of region `region`
    pub fn region_pages(&self, region: usize) -> Range<u32> {
        match self.spans.get(region) {
            Some(span) => span.first_page..span.first_page + span.pages,
            None => self.total_pages..self.total_pages,
        }
    }

    /// Global pages of sector `sector`
    pub fn sector_pages(&self, sector: u32) -> Range<u32> {
        let pps = self.pages_per_sector();
        sector * pps..(sector + 1) * pps
    }

    /// Sector holding global page `page`
    pub fn sector_of(&self, page: u32) -> u32 {
        page / self.pages_per_sector()
    }

    /// Byte offset of sector `sector`
    pub fn sector_offset(&self, sector: u32) -> Result<u32, Error> {
        self.page_offset(sector * self.pages_per_sector())
    }
}
