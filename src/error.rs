use thiserror::Error;

/// Failure modes of the device layer and the engines built on top of it.
///
/// Creation failures and validation findings latch the device into a removed
/// state, mirroring how the native runtime reports `DEVICE_REMOVED` on the
/// call after the one that actually went wrong.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no eligible adapters were found")]
    NoAdapters,

    #[error("device removed: {0}")]
    DeviceRemoved(String),

    #[error(
        "no queue can make forward progress while waiting for fence value \
         {value}; suspected device hang"
    )]
    DeviceHung { value: u64 },

    #[error("shared handle is unknown or was already closed")]
    InvalidSharedHandle,

    #[error("object was not created with cross-adapter sharing flags")]
    NotShareable,

    #[error("command list is not in the required recording state")]
    BadCommandListState,

    #[error("{what}: offset {offset} + length {len} exceeds size {size}")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("operation spans resources owned by different adapters")]
    DeviceMismatch,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
