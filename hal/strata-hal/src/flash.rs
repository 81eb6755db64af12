//! Flash primitive abstractions
//!
//! Provides the raw NOR flash primitives the file system is built on:
//! byte-range reads, programming (which can only clear bits, 1 → 0) and
//! whole-sector erases (which set every bit of the sector back to 1).

/// Erased flash byte value
pub const ERASED_BYTE: u8 = 0xFF;

/// Physical layout of a flash device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashGeometry {
    /// Total addressable bytes
    pub capacity: u32,
    /// Atomic erase granularity in bytes
    pub sector_size: u32,
}

impl FlashGeometry {
    /// Create a new geometry description
    pub const fn new(capacity: u32, sector_size: u32) -> Self {
        Self {
            capacity,
            sector_size,
        }
    }

    /// Check that `offset..offset + len` lies inside the device
    pub fn contains(&self, offset: u32, len: usize) -> bool {
        (offset as u64) + (len as u64) <= self.capacity as u64
    }

    /// Check that `offset` is the start of an erase sector
    pub fn is_sector_aligned(&self, offset: u32) -> bool {
        self.sector_size != 0 && offset % self.sector_size == 0
    }
}

/// Errors from flash primitive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address range outside the device
    OutOfBounds,
    /// Address or length not aligned to the required granularity
    Unaligned,
    /// The device reported a failure (after the driver's own retries)
    Io,
    /// Power was lost during the operation (simulated devices only)
    PowerLoss,
}

/// Raw flash driver
///
/// Implementations own the physical device and are the only code allowed
/// to issue programs and erases to it. Erase-status polling and retries
/// happen inside the implementation; callers never retry.
pub trait FlashDriver {
    /// Describe the device
    fn geometry(&self) -> FlashGeometry;

    /// Read `buffer.len()` bytes starting at `offset`
    fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `offset`
    ///
    /// Programming can only clear bits; a 1 written over a 0 stays 0.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase the sector starting at `offset`
    ///
    /// `offset` must be sector aligned.
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError>;
}

impl<T: FlashDriver + ?Sized> FlashDriver for &mut T {
    fn geometry(&self) -> FlashGeometry {
        (**self).geometry()
    }

    fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buffer)
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program(offset, data)
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        (**self).erase_sector(offset)
    }
}

#[cfg(feature = "embedded-storage")]
mod nor {
    use super::{FlashDriver, FlashError, FlashGeometry, ERASED_BYTE};
    use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

    /// Largest program granularity the padding path supports
    const MAX_WRITE_SIZE: usize = 256;

    fn map_error<E: NorFlashError>(e: E) -> FlashError {
        match e.kind() {
            NorFlashErrorKind::NotAligned => FlashError::Unaligned,
            NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
            _ => FlashError::Io,
        }
    }

    /// [`FlashDriver`] over any blocking `embedded-storage` NOR flash
    ///
    /// Programs that are not aligned to the device's `WRITE_SIZE` are
    /// padded with erased bytes, which leave the surrounding bits unchanged.
    pub struct NorFlashDriver<T> {
        inner: T,
    }

    impl<T: NorFlash> NorFlashDriver<T> {
        /// Wrap a NOR flash device
        pub fn new(inner: T) -> Self {
            Self { inner }
        }

        /// Release the wrapped device
        pub fn into_inner(self) -> T {
            self.inner
        }
    }

    impl<T: NorFlash> FlashDriver for NorFlashDriver<T> {
        fn geometry(&self) -> FlashGeometry {
            FlashGeometry::new(self.inner.capacity() as u32, T::ERASE_SIZE as u32)
        }

        fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
            self.inner.read(offset, buffer).map_err(map_error)
        }

        fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
            let unit = T::WRITE_SIZE;
            if unit <= 1 {
                return self.inner.write(offset, data).map_err(map_error);
            }
            if unit > MAX_WRITE_SIZE {
                return Err(FlashError::Unaligned);
            }

            let mut scratch = [ERASED_BYTE; MAX_WRITE_SIZE];
            let mut pos = offset as usize;
            let end = offset as usize + data.len();
            while pos < end {
                let base = pos - pos % unit;
                let chunk_end = (base + unit).min(end);
                scratch[..unit].fill(ERASED_BYTE);
                let from = pos - base;
                let to = chunk_end - base;
                scratch[from..to].copy_from_slice(&data[pos - offset as usize..chunk_end - offset as usize]);
                self.inner
                    .write(base as u32, &scratch[..unit])
                    .map_err(map_error)?;
                pos = chunk_end;
            }
            Ok(())
        }

        fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
            let size = T::ERASE_SIZE as u32;
            if offset % size != 0 {
                return Err(FlashError::Unaligned);
            }
            self.inner.erase(offset, offset + size).map_err(map_error)
        }
    }

}

#[cfg(feature = "embedded-storage")]
pub use nor::NorFlashDriver;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_bounds() {
        let geometry = FlashGeometry::new(64 * 1024, 4096);
        assert!(geometry.contains(0, 64 * 1024));
        assert!(!geometry.contains(1, 64 * 1024));
        assert!(geometry.contains(65535, 1));
        assert!(!geometry.contains(u32::MAX, 2));
    }

    #[test]
    fn test_sector_alignment() {
        let geometry = FlashGeometry::new(64 * 1024, 4096);
        assert!(geometry.is_sector_aligned(0));
        assert!(geometry.is_sector_aligned(8192));
        assert!(!geometry.is_sector_aligned(100));
    }
}
