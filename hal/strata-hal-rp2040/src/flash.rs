//! Flash driver for RP2040
//!
//! The file system lives in the upper half of the 2MB QSPI flash, split
//! into two partitions so the second can be handed over later by a
//! firmware update without reformatting the first.
//!
//! Implements the `FlashDriver` trait from `strata-hal`.

use embassy_rp::flash::{Blocking, Error as RpFlashError, Flash, ERASE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;

pub use strata_hal::flash::{FlashError, FlashGeometry};

/// Flash storage configuration
pub const FLASH_SIZE: usize = 2 * 1024 * 1024; // 2MB flash on the reference board

/// Flash erase size for RP2040
pub const FLASH_ERASE_SIZE: usize = ERASE_SIZE;

/// File system page size
pub const PAGE_SIZE: u32 = 512;

/// First storage partition, holds the region map in its first sector
pub const REGION_0: core::ops::Range<u32> = (1536 * 1024)..(1792 * 1024);

/// Growth partition, added by migration
pub const REGION_1: core::ops::Range<u32> = (1792 * 1024)..(FLASH_SIZE as u32);

fn map_error(e: RpFlashError) -> FlashError {
    match e {
        RpFlashError::OutOfBounds => FlashError::OutOfBounds,
        RpFlashError::Unaligned => FlashError::Unaligned,
        _ => FlashError::Io,
    }
}

/// RP2040 flash driver
///
/// Addresses are offsets from the start of flash, not XIP addresses.
/// The ROM flash routines run with interrupts disabled and poll the
/// erase status themselves, so every call here is complete on return.
pub struct Rp2040Flash<'d> {
    flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>,
}

impl<'d> Rp2040Flash<'d> {
    /// Create a new flash driver
    pub fn new(flash: Peri<'d, FLASH>) -> Self {
        Self {
            flash: Flash::new_blocking(flash),
        }
    }

    /// Get the raw flash peripheral for low-level access
    pub fn flash(&mut self) -> &mut Flash<'d, FLASH, Blocking, FLASH_SIZE> {
        &mut self.flash
    }
}

impl<'d> strata_hal::FlashDriver for Rp2040Flash<'d> {
    fn geometry(&self) -> FlashGeometry {
        FlashGeometry::new(FLASH_SIZE as u32, FLASH_ERASE_SIZE as u32)
    }

    fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.flash.blocking_read(offset, buffer).map_err(map_error)
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.flash.blocking_write(offset, data).map_err(map_error)
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        let size = FLASH_ERASE_SIZE as u32;
        if offset % size != 0 {
            return Err(FlashError::Unaligned);
        }
        self.flash
            .blocking_erase(offset, offset + size)
            .map_err(map_error)
    }
}
