//! On-flash page format
//!
//! Every page starts with a 24-byte header:
//!
//! ```text
//! ┌───────┬─────┬──────┬───────┬─────────┬────────────┬───────┬────────┬──────┬──────┐
//! │ MAGIC │ VER │ KIND │ INDEX │ FILE ID │ GENERATION │ CRC32 │ COMMIT │ DEAD │ RSVD │
//! │ 4B    │ 1B  │ 1B   │ 2B    │ 4B      │ 4B         │ 4B    │ 1B     │ 1B   │ 2B   │
//! └───────┴─────┴──────┴───────┴─────────┴────────────┴───────┴────────┴──────┴──────┘
//! ```
//!
//! Head pages (chunk 0) carry a 40-byte file meta block after the header:
//! declared size (4B), page count (2B), file type (1B), name length (1B)
//! and the name (32B, padded with `0xFF`).
//!
//! The commit and dead markers are separate bytes that start out erased
//! (`0xFF`) and are programmed later, so a page moves through its
//! lifecycle using only 1 → 0 bit transitions.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::{FileName, MAX_NAME_LEN};

/// Page header magic ("STRA")
pub const PAGE_MAGIC: u32 = 0x5354_5241;

/// On-flash format version
pub const FORMAT_VERSION: u8 = 1;

/// Common header length
pub const HEADER_LEN: usize = 24;

/// File meta block length (head pages only)
pub const META_LEN: usize = 40;

/// Data offset inside a head page
pub const HEAD_DATA_OFFSET: usize = HEADER_LEN + META_LEN;

/// Data offset inside a continuation page
pub const CONT_DATA_OFFSET: usize = HEADER_LEN;

/// Offset of the commit marker byte
pub const COMMIT_MARK_OFFSET: u32 = 20;

/// Offset of the dead marker byte
pub const DEAD_MARK_OFFSET: u32 = 21;

/// Value programmed into a marker byte to set it
pub const MARK_SET: u8 = 0x00;

/// Default file type for files opened without an explicit type
pub const FILE_TYPE_DEFAULT: u8 = 0xFE;

const KIND_HEAD: u8 = 0x01;
const KIND_CONTINUATION: u8 = 0x02;
const ERASED: u8 = 0xFF;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// File metadata stored in a head page
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileMeta {
    /// File name
    pub name: FileName,
    /// Declared size in bytes
    pub size: u32,
    /// Number of pages in the chain
    pub page_count: u16,
    /// Declared file type
    pub file_type: u8,
}

/// Decoded page header
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageHeader {
    /// Creation sequence number of the owning file
    pub file_id: u32,
    /// Chunk index within the file (0 = head)
    pub index: u16,
    /// Sequence number of this physical copy
    pub generation: u32,
    /// File metadata, present on head pages only
    pub meta: Option<FileMeta>,
}

/// Lifecycle state of a page as recorded in its own header
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageState {
    /// Never written since the last erase
    Erased,
    /// Header written but never committed
    Uncommitted(PageHeader),
    /// Committed and live
    Written(PageHeader),
    /// Superseded or removed
    Dead(PageHeader),
    /// Torn or foreign bytes
    Corrupt,
}

impl PageHeader {
    /// Header for the head page of a new file
    pub fn head(file_id: u32, generation: u32, meta: FileMeta) -> Self {
        Self {
            file_id,
            index: 0,
            generation,
            meta: Some(meta),
        }
    }

    /// Header for a continuation page
    pub fn continuation(file_id: u32, index: u16, generation: u32) -> Self {
        Self {
            file_id,
            index,
            generation,
            meta: None,
        }
    }

    /// Whether this is the head page of its file
    pub fn is_head(&self) -> bool {
        self.meta.is_some()
    }

    /// Offset of the data area inside the page
    pub fn data_offset(&self) -> usize {
        if self.is_head() {
            HEAD_DATA_OFFSET
        } else {
            CONT_DATA_OFFSET
        }
    }

    /// Encode into `out`, returning the number of header bytes to program
    ///
    /// Marker bytes are left erased.
    pub fn encode(&self, out: &mut [u8; HEAD_DATA_OFFSET]) -> usize {
        out.fill(ERASED);
        out[0..4].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        out[4] = FORMAT_VERSION;
        out[5] = if self.is_head() {
            KIND_HEAD
        } else {
            KIND_CONTINUATION
        };
        out[6..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..12].copy_from_slice(&self.file_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.generation.to_le_bytes());

        if let Some(meta) = &self.meta {
            out[24..28].copy_from_slice(&meta.size.to_le_bytes());
            out[28..30].copy_from_slice(&meta.page_count.to_le_bytes());
            out[30] = meta.file_type;
            out[31] = meta.name.len() as u8;
            out[32..32 + meta.name.len()].copy_from_slice(meta.name.as_bytes());
        }

        let crc = header_crc(out, self.is_head());
        out[16..20].copy_from_slice(&crc.to_le_bytes());
        self.data_offset()
    }

    /// Decode the raw first bytes of a page
    pub fn decode(raw: &[u8; HEAD_DATA_OFFSET]) -> PageState {
        if raw.iter().all(|&b| b == ERASED) {
            return PageState::Erased;
        }

        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != PAGE_MAGIC || raw[4] != FORMAT_VERSION {
            return PageState::Corrupt;
        }

        let is_head = match raw[5] {
            KIND_HEAD => true,
            KIND_CONTINUATION => false,
            _ => return PageState::Corrupt,
        };

        let stored_crc = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]);
        if stored_crc != header_crc(raw, is_head) {
            return PageState::Corrupt;
        }

        let index = u16::from_le_bytes([raw[6], raw[7]]);
        let file_id = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let generation = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);

        let meta = if is_head {
            match decode_meta(raw) {
                Some(meta) if index == 0 => Some(meta),
                _ => return PageState::Corrupt,
            }
        } else {
            if index == 0 {
                return PageState::Corrupt;
            }
            None
        };

        let header = Self {
            file_id,
            index,
            generation,
            meta,
        };

        if raw[DEAD_MARK_OFFSET as usize] != ERASED {
            PageState::Dead(header)
        } else if raw[COMMIT_MARK_OFFSET as usize] == MARK_SET {
            PageState::Written(header)
        } else {
            PageState::Uncommitted(header)
        }
    }
}

fn decode_meta(raw: &[u8; HEAD_DATA_OFFSET]) -> Option<FileMeta> {
    let size = u32::from_le_bytes([raw[24], raw[25], raw[26], raw[27]]);
    let page_count = u16::from_le_bytes([raw[28], raw[29]]);
    let file_type = raw[30];
    let name_len = raw[31] as usize;
    if name_len == 0 || name_len > MAX_NAME_LEN || page_count == 0 {
        return None;
    }

    let text = core::str::from_utf8(&raw[32..32 + name_len]).ok()?;
    let mut name = FileName::new();
    name.push_str(text).ok()?;

    Some(FileMeta {
        name,
        size,
        page_count,
        file_type,
    })
}

/// CRC over the identity fields and, for head pages, the meta block
fn header_crc(raw: &[u8; HEAD_DATA_OFFSET], is_head: bool) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&raw[0..16]);
    if is_head {
        digest.update(&raw[HEADER_LEN..HEAD_DATA_OFFSET]);
    }
    digest.finalize()
}

/// Maps file byte offsets onto chunks for a given page size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageLayout {
    page_size: u32,
}

/// Where a file offset lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkPos {
    /// Chunk index within the file
    pub index: u16,
    /// Byte offset inside the page
    pub offset: u32,
    /// Bytes left in this chunk from `offset`
    pub room: u32,
}

impl PageLayout {
    /// Create a layout for `page_size`-byte pages
    pub const fn new(page_size: u32) -> Self {
        Self { page_size }
    }

    /// Page size in bytes
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Data bytes in a head page
    pub const fn head_capacity(&self) -> u32 {
        self.page_size - HEAD_DATA_OFFSET as u32
    }

    /// Data bytes in a continuation page
    pub const fn continuation_capacity(&self) -> u32 {
        self.page_size - CONT_DATA_OFFSET as u32
    }

    /// Pages needed to hold a file of `size` bytes
    pub fn pages_for(&self, size: u32) -> u32 {
        let head = self.head_capacity();
        if size <= head {
            return 1;
        }
        let rest = size - head;
        1 + rest.div_ceil(self.continuation_capacity())
    }

    /// Locate the chunk holding byte `offset` of a file
    pub fn locate(&self, offset: u32) -> ChunkPos {
        let head = self.head_capacity();
        if offset < head {
            return ChunkPos {
                index: 0,
                offset: HEAD_DATA_OFFSET as u32 + offset,
                room: head - offset,
            };
        }
        let cont = self.continuation_capacity();
        let rest = offset - head;
        let within = rest % cont;
        ChunkPos {
            index: (1 + rest / cont) as u16,
            offset: CONT_DATA_OFFSET as u32 + within,
            room: cont - within,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: u32, page_count: u16) -> FileMeta {
        let mut n = FileName::new();
        let _ = n.push_str(name);
        FileMeta {
            name: n,
            size,
            page_count,
            file_type: 3,
        }
    }

    fn commit(raw: &mut [u8; HEAD_DATA_OFFSET]) {
        raw[COMMIT_MARK_OFFSET as usize] = MARK_SET;
    }

    #[test]
    fn test_erased_page() {
        let raw = [0xFF; HEAD_DATA_OFFSET];
        assert_eq!(PageHeader::decode(&raw), PageState::Erased);
    }

    #[test]
    fn test_head_lifecycle() {
        let header = PageHeader::head(7, 8, meta("alarms", 1000, 3));
        let mut raw = [0u8; HEAD_DATA_OFFSET];
        assert_eq!(header.encode(&mut raw), HEAD_DATA_OFFSET);

        assert_eq!(
            PageHeader::decode(&raw),
            PageState::Uncommitted(header.clone())
        );

        commit(&mut raw);
        assert_eq!(PageHeader::decode(&raw), PageState::Written(header.clone()));

        raw[DEAD_MARK_OFFSET as usize] = MARK_SET;
        assert_eq!(PageHeader::decode(&raw), PageState::Dead(header));
    }

    #[test]
    fn test_continuation_header() {
        let header = PageHeader::continuation(7, 2, 11);
        let mut raw = [0u8; HEAD_DATA_OFFSET];
        assert_eq!(header.encode(&mut raw), CONT_DATA_OFFSET);
        commit(&mut raw);

        // Data bytes after the header do not disturb decoding
        raw[CONT_DATA_OFFSET..].fill(0x42);
        assert_eq!(PageHeader::decode(&raw), PageState::Written(header));
    }

    #[test]
    fn test_torn_header_is_corrupt() {
        let header = PageHeader::head(1, 2, meta("a", 10, 1));
        let mut full = [0u8; HEAD_DATA_OFFSET];
        header.encode(&mut full);

        // Only the first bytes of the header reached the flash. Past byte 32
        // the encoded name is erased padding, so stop there.
        for torn_at in 1..=32 {
            let mut raw = [0xFF; HEAD_DATA_OFFSET];
            raw[..torn_at].copy_from_slice(&full[..torn_at]);
            assert_eq!(PageHeader::decode(&raw), PageState::Corrupt, "torn at {}", torn_at);
        }
    }

    #[test]
    fn test_flipped_name_bit_is_corrupt() {
        let header = PageHeader::head(1, 2, meta("abc", 10, 1));
        let mut raw = [0u8; HEAD_DATA_OFFSET];
        header.encode(&mut raw);
        commit(&mut raw);
        raw[33] &= 0xFE;
        assert_eq!(PageHeader::decode(&raw), PageState::Corrupt);
    }

    #[test]
    fn test_pages_for_size() {
        let layout = PageLayout::new(512);
        assert_eq!(layout.head_capacity(), 448);
        assert_eq!(layout.continuation_capacity(), 488);

        assert_eq!(layout.pages_for(0), 1);
        assert_eq!(layout.pages_for(448), 1);
        assert_eq!(layout.pages_for(449), 2);
        assert_eq!(layout.pages_for(448 + 488), 2);
        assert_eq!(layout.pages_for(448 + 488 + 1), 3);
    }

    #[test]
    fn test_locate_offsets() {
        let layout = PageLayout::new(512);

        let first = layout.locate(0);
        assert_eq!(first, ChunkPos { index: 0, offset: 64, room: 448 });

        let last_head = layout.locate(447);
        assert_eq!(last_head.index, 0);
        assert_eq!(last_head.room, 1);

        let second = layout.locate(448);
        assert_eq!(second, ChunkPos { index: 1, offset: 24, room: 488 });

        let third = layout.locate(448 + 488 + 5);
        assert_eq!(third, ChunkPos { index: 2, offset: 29, room: 483 });
    }
}
