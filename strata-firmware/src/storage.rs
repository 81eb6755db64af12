//! File system setup and boot-time bookkeeping

use defmt::*;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use strata_fs::{Error, EventMask, FileEvent, FlashRegion, FsConfig, OpenMode, SharedFileSystem};
use strata_hal_rp2040::{Rp2040Flash, PAGE_SIZE, REGION_0, REGION_1};

/// The file system, shared by every task
pub static FS: SharedFileSystem<CriticalSectionRawMutex, Rp2040Flash<'static>> =
    SharedFileSystem::new();

/// Boot counter file
const BOOT_COUNT: &str = "sys/boot_count";

fn region(range: core::ops::Range<u32>) -> FlashRegion {
    FlashRegion::new(range.start, range.end - range.start)
}

/// Both storage partitions, in the order they were introduced
pub fn storage_config() -> Result<FsConfig, Error> {
    FsConfig::new(PAGE_SIZE, region(REGION_0)).with_region(region(REGION_1))
}

/// Mount the file system, formatting a blank device
pub fn mount(flash: Rp2040Flash<'static>) -> Result<(), Error> {
    FS.init(flash, storage_config()?)?;

    FS.with(|fs| {
        let migration = fs.last_migration();
        if migration.added > 0 {
            info!("Storage grew by {} region(s)", migration.added);
        }
        let stats = fs.stats();
        info!(
            "Storage mounted: {} files, {} free bytes",
            stats.files,
            fs.free_bytes()
        );
        fs.watch(BOOT_COUNT, EventMask::all(), log_change, 0)?;
        Ok(())
    })
}

fn log_change(name: &str, event: FileEvent, _context: usize) {
    debug!("{}: {}", name, event);
}

/// Increment and return the persisted boot count
pub fn bump_boot_count() -> Result<u32, Error> {
    FS.with(|fs| {
        let mut raw = [0u8; 4];
        let previous = match fs.open(BOOT_COUNT, OpenMode::Read, 0) {
            Ok(fd) => {
                let read = fs.read(fd, &mut raw);
                fs.close(fd)?;
                read.map(|_| u32::from_le_bytes(raw)).unwrap_or(0)
            }
            Err(Error::NotFound) => 0,
            Err(e) => return Err(e),
        };

        let count = previous.wrapping_add(1);
        let fd = fs.open(BOOT_COUNT, OpenMode::Overwrite, 4)?;
        if let Err(e) = fs.write(fd, &count.to_le_bytes()) {
            let _ = fs.close(fd);
            return Err(e);
        }
        fs.close(fd)?;
        Ok(count)
    })
}
