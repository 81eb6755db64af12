//! Storage maintenance task
//!
//! Reclaims dead sectors in the background so that writes rarely have to
//! wait for a collection of their own.

use defmt::*;
use embassy_time::{Duration, Ticker};

use crate::storage::FS;

/// Collection interval in seconds
pub const GC_INTERVAL_S: u64 = 30;

/// Reclaimable pages that trigger a collection
const GC_THRESHOLD_PAGES: u32 = 32;

/// Maintenance task - periodically collects garbage
#[embassy_executor::task]
pub async fn maintenance_task() {
    info!("Maintenance task started");

    let mut ticker = Ticker::every(Duration::from_secs(GC_INTERVAL_S));

    loop {
        ticker.next().await;

        let result = FS.with(|fs| {
            if fs.stats().reclaimable_pages < GC_THRESHOLD_PAGES {
                return Ok(None);
            }
            fs.collect_garbage().map(Some)
        });

        match result {
            Ok(Some(report)) => info!(
                "GC: {} sectors erased, {} pages moved",
                report.sectors_erased, report.pages_relocated
            ),
            Ok(None) => {}
            Err(e) => warn!("GC failed: {}", e),
        }
    }
}
