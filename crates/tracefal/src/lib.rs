//! tracefal: trace resource management for spatial AI-engine arrays.
//!
//! Every tile module on the array carries one trace unit with a fixed
//! number of event slots.  This crate arbitrates those slots between
//! competing logical requests and sequences the hardware programming so
//! that repeated or overlapping use cannot leave the unit half-configured.
//!
//! # Architecture
//!
//! ```text
//! TraceSession ──owns──→ TraceUnit  ←──shared (Rc<RefCell>)──┐
//!      │                    │                                 │
//!      └──owns──→ Vec<TraceEvent> ───────────────────────────┘
//!                           │
//!                           └──cross-module──→ BroadcastChannel
//! ```
//!
//! - [`lifecycle`]: the shared reserve → start → stop → release contract
//! - [`trace`]: [`TraceUnit`], [`TraceEvent`] and [`TraceSession`]
//! - [`device`]: value types and the narrow hardware interfaces consumed
//! - [`devices`]: deterministic simulated device backends
//! - [`verified`]: pure slot-bitmap arithmetic with assertion-guarded
//!   postconditions
//! - [`plan`]: serde-described trace setups and session reports
//! - [`error`]: error types
//!
//! All types are single-threaded: shared unit handles are
//! `Rc<RefCell<_>>`, and callers serialize access to a tile.

pub mod device;
pub mod devices;
pub mod error;
pub mod lifecycle;
pub mod plan;
pub mod trace;
pub mod verified;

pub use device::{
    BroadcastChannel, BroadcastProvider, DeviceHandle, Event, Module, Packet, TileKind, TileLoc,
    TileTopology, TraceMode, TraceProgrammer,
};
pub use error::{HwError, Result, RscError};
pub use lifecycle::{Resource, ResourceState};
pub use trace::{SharedTraceUnit, TraceEvent, TraceSession, TraceUnit};
