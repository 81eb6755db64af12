//! RP2040-specific HAL for the Strata flash file system
//!
//! This crate provides:
//! - `Rp2040Flash`: `strata_hal::FlashDriver` over the QSPI flash
//! - The storage partition layout used by the firmware

#![no_std]

pub mod flash;

pub use flash::{Rp2040Flash, FLASH_SIZE, PAGE_SIZE, REGION_0, REGION_1};
pub use strata_hal::FlashDriver;
