//! In-memory NOR flash model
//!
//! [`SimFlash`] follows NOR rules (programming ANDs bits in, erasing sets a
//! whole sector to `0xFF`) and can cut power after a chosen number of
//! programmed bytes or erases. Once power is cut every call fails with
//! [`FlashError::PowerLoss`] until [`SimFlash::power_cycle`].

use strata_hal::flash::ERASED_BYTE;
use strata_hal::{FlashDriver, FlashError, FlashGeometry};

/// Bits an interrupted erase manages to raise in the unfinished half
const TORN_ERASE_BITS: u8 = 0x0F;

/// NOR flash backed by a borrowed byte buffer
pub struct SimFlash<'a> {
    mem: &'a mut [u8],
    sector_size: u32,
    byte_budget: Option<u64>,
    erase_budget: Option<u32>,
    powered: bool,
    programmed: u64,
    erases: u32,
}

impl<'a> SimFlash<'a> {
    /// Wrap `mem` as-is; a fresh device should be filled with `0xFF`
    pub fn new(mem: &'a mut [u8], sector_size: u32) -> Self {
        Self {
            mem,
            sector_size,
            byte_budget: None,
            erase_budget: None,
            powered: true,
            programmed: 0,
            erases: 0,
        }
    }

    /// Wrap `mem` after erasing all of it
    pub fn erased(mem: &'a mut [u8], sector_size: u32) -> Self {
        mem.fill(ERASED_BYTE);
        Self::new(mem, sector_size)
    }

    /// Cut power once `bytes` more bytes have been programmed
    ///
    /// The program call that crosses the budget writes the bytes that fit
    /// and then fails.
    pub fn fail_after_bytes(&mut self, bytes: u64) {
        self.byte_budget = Some(bytes);
    }

    /// Cut power during the erase after `erases` more complete erases
    ///
    /// The interrupted erase finishes the first half of its sector and
    /// only raises the low nibble of every byte in the second half, which
    /// then reads as neither erased nor as the data it held.
    pub fn fail_after_erases(&mut self, erases: u32) {
        self.erase_budget = Some(erases);
    }

    /// Restore power and clear any pending failure
    pub fn power_cycle(&mut self) {
        self.powered = true;
        self.byte_budget = None;
        self.erase_budget = None;
    }

    /// Whether power has been cut
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Bytes programmed since creation
    pub fn bytes_programmed(&self) -> u64 {
        self.programmed
    }

    /// Sector erases since creation
    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    /// Raw contents
    pub fn contents(&self) -> &[u8] {
        self.mem
    }

    fn check(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }
        if !self.geometry().contains(offset, len) {
            return Err(FlashError::OutOfBounds);
        }
        Ok(())
    }
}

impl FlashDriver for SimFlash<'_> {
    fn geometry(&self) -> FlashGeometry {
        FlashGeometry::new(self.mem.len() as u32, self.sector_size)
    }

    fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.check(offset, buffer.len())?;
        let start = offset as usize;
        buffer.copy_from_slice(&self.mem[start..start + buffer.len()]);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check(offset, data.len())?;
        let start = offset as usize;
        for (i, byte) in data.iter().enumerate() {
            if let Some(budget) = self.byte_budget.as_mut() {
                if *budget == 0 {
                    self.powered = false;
                    return Err(FlashError::PowerLoss);
                }
                *budget -= 1;
            }
            self.mem[start + i] &= *byte;
            self.programmed += 1;
        }
        Ok(())
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        self.check(offset, self.sector_size as usize)?;
        if !self.geometry().is_sector_aligned(offset) {
            return Err(FlashError::Unaligned);
        }
        let start = offset as usize;
        let end = start + self.sector_size as usize;

        if let Some(budget) = self.erase_budget.as_mut() {
            if *budget == 0 {
                let (done, torn) = self.mem[start..end].split_at_mut(self.sector_size as usize / 2);
                done.fill(ERASED_BYTE);
                for b in torn {
                    *b |= TORN_ERASE_BITS;
                }
                self.powered = false;
                return Err(FlashError::PowerLoss);
            }
            *budget -= 1;
        }

        self.mem[start..end].fill(ERASED_BYTE);
        self.erases += 1;
        Ok(())
    }
}
