//! Strata reference firmware
//!
//! Mounts the flash file system on an RP2040 board, records the boot
//! count and keeps the storage compacted in the background.

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use strata_hal_rp2040::Rp2040Flash;
use {defmt_rtt as _, panic_probe as _};

mod storage;
mod tasks;

/// Main entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Strata firmware starting...");

    let p = embassy_rp::init(Default::default());
    info!("Peripherals initialized");

    if let Err(e) = storage::mount(Rp2040Flash::new(p.FLASH)) {
        error!("Storage mount failed: {}", e);
        return;
    }

    match storage::bump_boot_count() {
        Ok(count) => info!("Boot #{}", count),
        Err(e) => warn!("Boot count not updated: {}", e),
    }

    spawner.spawn(tasks::maintenance_task()).unwrap();

    info!("All tasks spawned");
}
