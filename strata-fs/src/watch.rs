//! File change notifications
//!
//! Watches are held in memory only and fire synchronously from inside the
//! operation that caused the event, so a callback runs with the file system
//! lock held and must not call back into it.

use bitflags::bitflags;
use heapless::Vec;

use crate::config::{FileName, MAX_WATCHES};
use crate::error::Error;

bitflags! {
    /// Events a watch subscribes to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        /// A new or modified version of the file was committed
        const MODIFIED = 1 << 0;
        /// The file was removed
        const REMOVED = 1 << 1;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for EventMask {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "EventMask({=u8:#04x})", self.bits())
    }
}

/// A change to a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileEvent {
    Modified,
    Removed,
}

impl FileEvent {
    fn mask(self) -> EventMask {
        match self {
            FileEvent::Modified => EventMask::MODIFIED,
            FileEvent::Removed => EventMask::REMOVED,
        }
    }
}

/// Watch callback: file name, event and the context given at registration
pub type WatchCallback = fn(&str, FileEvent, usize);

/// Registration token returned by `watch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WatchId {
    slot: u8,
    generation: u16,
}

#[derive(Clone)]
struct Watch {
    id: WatchId,
    name: FileName,
    mask: EventMask,
    callback: WatchCallback,
    ctx: usize,
}

/// Fixed-capacity table of watches
pub struct WatchRegistry {
    watches: Vec<Watch, MAX_WATCHES>,
    next_generation: u16,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            watches: Vec::new(),
            next_generation: 0,
        }
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Register a callback for `mask` events on `name`
    pub fn add(
        &mut self,
        name: FileName,
        mask: EventMask,
        callback: WatchCallback,
        ctx: usize,
    ) -> Result<WatchId, Error> {
        if mask.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.watches.is_full() {
            return Err(Error::OutOfHandles);
        }

        // Lowest slot number not in use
        let slot = (0..MAX_WATCHES as u8)
            .find(|s| self.watches.iter().all(|w| w.id.slot != *s))
            .ok_or(Error::OutOfHandles)?;
        self.next_generation = self.next_generation.wrapping_add(1);
        let id = WatchId {
            slot,
            generation: self.next_generation,
        };

        self.watches
            .push(Watch {
                id,
                name,
                mask,
                callback,
                ctx,
            })
            .map_err(|_| Error::OutOfHandles)?;
        Ok(id)
    }

    /// Drop a registration
    pub fn remove(&mut self, id: WatchId) -> Result<(), Error> {
        let pos = self
            .watches
            .iter()
            .position(|w| w.id == id)
            .ok_or(Error::InvalidHandle)?;
        self.watches.swap_remove(pos);
        Ok(())
    }

    /// Invoke every callback watching `name` for `event`
    pub fn notify(&self, name: &str, event: FileEvent) {
        for watch in self
            .watches
            .iter()
            .filter(|w| w.name.as_str() == name && w.mask.contains(event.mask()))
        {
            (watch.callback)(name, event, watch.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file_name;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static MODIFIED_CTX: AtomicUsize = AtomicUsize::new(0);
    static REMOVED_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn on_modified(_name: &str, event: FileEvent, ctx: usize) {
        if event == FileEvent::Modified {
            MODIFIED_CTX.fetch_add(ctx, Ordering::SeqCst);
        }
    }

    fn on_removed(_name: &str, _event: FileEvent, _ctx: usize) {
        REMOVED_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    fn noop(_: &str, _: FileEvent, _: usize) {}

    #[test]
    fn test_mask_filtering() {
        let mut registry = WatchRegistry::new();
        registry
            .add(file_name("cfg").unwrap(), EventMask::MODIFIED, on_modified, 7)
            .unwrap();
        registry
            .add(file_name("cfg").unwrap(), EventMask::REMOVED, on_removed, 0)
            .unwrap();

        registry.notify("cfg", FileEvent::Modified);
        registry.notify("other", FileEvent::Modified);
        assert_eq!(MODIFIED_CTX.load(Ordering::SeqCst), 7);
        assert_eq!(REMOVED_COUNT.load(Ordering::SeqCst), 0);

        registry.notify("cfg", FileEvent::Removed);
        assert_eq!(REMOVED_COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_and_stale_ids() {
        let mut registry = WatchRegistry::new();
        let mut ids = Vec::<WatchId, MAX_WATCHES>::new();
        for _ in 0..MAX_WATCHES {
            let id = registry
                .add(file_name("x").unwrap(), EventMask::all(), noop, 0)
                .unwrap();
            ids.push(id).unwrap();
        }
        assert_eq!(
            registry.add(file_name("x").unwrap(), EventMask::all(), noop, 0),
            Err(Error::OutOfHandles)
        );

        registry.remove(ids[2]).unwrap();
        assert_eq!(registry.remove(ids[2]), Err(Error::InvalidHandle));

        // Slot is reused under a new generation
        let fresh = registry
            .add(file_name("x").unwrap(), EventMask::all(), noop, 0)
            .unwrap();
        assert_ne!(fresh, ids[2]);
        assert_eq!(registry.len(), MAX_WATCHES);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let mut registry = WatchRegistry::new();
        assert_eq!(
            registry.add(file_name("x").unwrap(), EventMask::empty(), noop, 0),
            Err(Error::InvalidArgument)
        );
    }
}
