//! Strata - log-structured flash file system
//!
//! Named, atomically replaceable files on raw NOR flash, for firmware that
//! has nothing else to store its settings, databases and app images on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SharedFileSystem (one lock, any task)                   │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  FileSystem: open / read / write / seek / close / remove │
//! │  handles · watches · enumerate · stats · format          │
//! └──────────────────────────────────────────────────────────┘
//!          │                 │                  │
//!          ▼                 ▼                  ▼
//! ┌────────────────┐ ┌───────────────┐ ┌──────────────────┐
//! │ allocator:     │ │ gc: sector    │ │ region: map      │
//! │ page table +   │ │ relocation +  │ │ sector, page     │
//! │ boot scan      │ │ erase         │ │ addressing       │
//! └────────────────┘ └───────────────┘ └──────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  strata_hal::FlashDriver (read / program / erase)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Files are chains of fixed-size pages. Every page header names its file
//! and chunk index, so the directory is rebuilt at mount by scanning the
//! headers; nothing else is persisted except the region map.
//!
//! # Example
//!
//! ```
//! use strata_fs::{FileSystem, FlashRegion, FsConfig, OpenMode, SimFlash};
//!
//! let mut mem = [0xFFu8; 32 * 1024];
//! let config = FsConfig::new(512, FlashRegion::new(0, 32 * 1024));
//! let mut fs = FileSystem::mount(SimFlash::new(&mut mem, 4096), config).unwrap();
//!
//! let fd = fs.open("greeting", OpenMode::Write, 5).unwrap();
//! fs.write(fd, b"hello").unwrap();
//! fs.close(fd).unwrap();
//!
//! let mut buf = [0u8; 5];
//! let fd = fs.open("greeting", OpenMode::Read, 0).unwrap();
//! fs.read(fd, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to every module
mod fmt;

pub mod allocator;
pub mod config;
pub mod directory;
pub mod error;
pub mod fs;
pub mod gc;
pub mod handle;
pub mod layout;
pub mod region;
pub mod shared;
pub mod sim;
pub mod watch;


pub use config::{file_name, FileName, FlashRegion, FsConfig, MAX_FILES, MAX_HANDLES, MAX_NAME_LEN};
pub use error::Error;
pub use fs::{FileInfo, FileSystem, FsStats, MigrationOutcome};
pub use gc::GcReport;
pub use handle::{Fd, OpenMode, Whence};
pub use region::PageAddr;
pub use shared::SharedFileSystem;
pub use sim::SimFlash;
pub use watch::{EventMask, FileEvent, WatchCallback, WatchId};
