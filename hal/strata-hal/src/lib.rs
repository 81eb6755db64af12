//! Strata Hardware Abstraction Layer
//!
//! This crate defines the boundary between the flash file system and the
//! chip-specific flash drivers. The file system only ever calls the
//! primitives declared here; erase-status polling and retry policies live
//! inside the driver implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  strata-fs (log-structured file system) │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  strata-hal (this crate - traits)       │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │ strata-hal-   │       │ NorFlash      │
//! │    rp2040     │       │ adapter       │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Traits
//!
//! - [`flash::FlashDriver`] - Raw read / program / sector erase

#![no_std]
#![deny(unsafe_code)]

pub mod flash;

pub use flash::{FlashDriver, FlashError, FlashGeometry};

#[cfg(feature = "embedded-storage")]
pub use flash::NorFlashDriver;
