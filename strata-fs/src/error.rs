//! File system error taxonomy
//!
//! Every operation returns one of these; nothing panics or unwinds.

use strata_hal::FlashError;

/// Errors returned by file system operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Name does not exist
    NotFound,
    /// No reclaimable space left
    OutOfStorage,
    /// Handle table (or watch table) is full
    OutOfHandles,
    /// Offset or length outside the file's declared size
    RangeError,
    /// Bad name, bad configuration, or operation not allowed in this mode
    InvalidArgument,
    /// Handle was closed or never issued
    InvalidHandle,
    /// Name is already open for writing
    AlreadyOpen,
    /// Flash holds no region map and formatting was not requested
    NotFormatted,
    /// Configured regions disagree with the recorded region map
    LayoutMismatch,
    /// Shared file system used before `init`
    NotMounted,
    /// The flash driver reported a failure
    Flash(FlashError),
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}
