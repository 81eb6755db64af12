//! File system behind a single lock
//!
//! Firmware keeps one [`SharedFileSystem`] in a `static` and calls it from
//! any task. Each call runs one closure to completion under the blocking
//! mutex, so operations never interleave.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use strata_hal::FlashDriver;

use crate::config::FsConfig;
use crate::error::Error;
use crate::fs::FileSystem;

/// A mountable file system guarded by a raw mutex
pub struct SharedFileSystem<M: RawMutex, F: FlashDriver> {
    inner: Mutex<M, RefCell<Option<FileSystem<F>>>>,
}

impl<M: RawMutex, F: FlashDriver> Default for SharedFileSystem<M, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, F: FlashDriver> SharedFileSystem<M, F> {
    /// Unmounted instance, usable in a `static`
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Mount `flash` with `config`
    ///
    /// Fails with `InvalidArgument` if already mounted. The check and the
    /// mount run under one lock, so two racing calls cannot both mount.
    pub fn init(&self, flash: F, config: FsConfig) -> Result<(), Error> {
        self.inner.lock(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(Error::InvalidArgument);
            }
            *slot = Some(FileSystem::mount(flash, config)?);
            Ok(())
        })
    }

    /// Unmount, returning the flash driver
    pub fn deinit(&self) -> Option<F> {
        self.inner
            .lock(|cell| cell.borrow_mut().take().map(FileSystem::unmount))
    }

    /// Whether `init` has succeeded and `deinit` not yet run
    pub fn is_mounted(&self) -> bool {
        self.inner.lock(|cell| cell.borrow().is_some())
    }

    /// Run `f` against the mounted file system
    ///
    /// `f` must not call back into this instance.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut FileSystem<F>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.inner.lock(|cell| {
            let mut guard = cell.borrow_mut();
            let fs = guard.as_mut().ok_or(Error::NotMounted)?;
            f(fs)
        })
    }
}
