//! Error types for trace resource management.
//!
//! [`RscError`] is returned by every lifecycle operation and setter.
//! [`HwError`] is the opaque failure reported by the device interfaces; it
//! reaches callers unchanged inside [`RscError::Hardware`].

use thiserror::Error;

use crate::device::{Event, Module, TileLoc};

/// Errors raised by the device interfaces.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HwError {
    /// The tile location is outside the array.
    #[error("tile {loc} is not part of the array")]
    InvalidTile { loc: TileLoc },

    /// The module does not exist on the tile.
    #[error("module {module} is not valid for tile {loc}")]
    InvalidModule { loc: TileLoc, module: Module },

    /// The logical event cannot be encoded for the module.
    #[error("event {event} cannot be encoded for {module} module at {loc}")]
    InvalidEvent {
        loc: TileLoc,
        module: Module,
        event: Event,
    },

    /// The physical event id is outside the module's event space.
    #[error("physical event {hw_event} is out of range for {module} module at {loc}")]
    InvalidPhysicalEvent {
        loc: TileLoc,
        module: Module,
        hw_event: u8,
    },

    /// The trace slot index does not exist.
    #[error("trace slot {slot} does not exist on {module} module at {loc}")]
    InvalidSlot { loc: TileLoc, module: Module, slot: u8 },

    /// Every broadcast channel on the tile is already taken.
    #[error("no free broadcast channel at tile {loc}")]
    NoBroadcastChannel { loc: TileLoc },

    /// The channel handle does not match an allocated channel.
    #[error("broadcast channel {id} at tile {loc} is not allocated")]
    UnknownChannel { loc: TileLoc, id: u8 },

    /// An injected failure from a simulated backend.
    #[error("injected failure in {op} at tile {loc}")]
    Injected { op: &'static str, loc: TileLoc },
}

/// Errors returned by trace resources.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RscError {
    #[error("resource is not initialized")]
    NotInitialized,

    #[error("resource has no configuration")]
    NotConfigured,

    #[error("resource is already reserved")]
    AlreadyReserved,

    #[error("resource is busy (running)")]
    Busy,

    #[error("resource is not reserved and configured")]
    NotReady,

    #[error("resource is not running")]
    NotRunning,

    #[error("no free capacity left")]
    CapacityExhausted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("hardware programming failed: {0}")]
    Hardware(#[from] HwError),
}

impl RscError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RscError>;
