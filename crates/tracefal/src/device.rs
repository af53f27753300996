//! Value types and the hardware interfaces consumed by trace resources.
//!
//! Three narrow traits stand in for the device driver:
//!
//! - [`TraceProgrammer`]: module validation, logical/physical event
//!   translation and trace register programming
//! - [`TileTopology`]: tile classification
//! - [`BroadcastProvider`]: broadcast channel allocation and programming
//!
//! [`DeviceHandle`] bundles one implementation of each and is cloned into
//! every resource that needs to talk to the device.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::HwError;

/// Column/row address of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileLoc {
    pub col: u8,
    pub row: u8,
}

impl TileLoc {
    pub const fn new(col: u8, row: u8) -> Self {
        Self { col, row }
    }
}

impl fmt::Display for TileLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.col, self.row)
    }
}

/// Functional module within a tile.  Each module has its own trace unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Core,
    Memory,
    Pl,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Module::Core => "core",
            Module::Memory => "memory",
            Module::Pl => "pl",
        };
        f.write_str(name)
    }
}

/// Hardware kind of a tile, as reported by [`TileTopology`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileKind {
    Unsupported,
    ShimPl,
    ShimNoc,
    Core,
    MemTile,
}

impl TileKind {
    /// Whether the tile sits in the shim row.
    pub fn is_shim(self) -> bool {
        matches!(self, TileKind::ShimPl | TileKind::ShimNoc)
    }

    /// Module a trace unit binds to when none is given explicitly.
    pub fn default_module(self) -> Option<Module> {
        match self {
            TileKind::Unsupported => None,
            TileKind::ShimPl | TileKind::ShimNoc => Some(Module::Pl),
            TileKind::Core => Some(Module::Core),
            TileKind::MemTile => Some(Module::Memory),
        }
    }
}

/// Logical event id.  Its meaning depends on the module it is used with.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Event(pub u32);

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Trace stream timing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceMode {
    #[default]
    EventTime,
    EventPc,
    Execution,
}

/// Packet routing applied to the trace stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    pub id: u8,
    pub packet_type: u8,
}

/// Exclusive handle to an allocated broadcast channel.
///
/// Not `Clone`: a channel has exactly one holder, and handing it back via
/// [`BroadcastProvider::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BroadcastChannel {
    loc: TileLoc,
    from: Module,
    to: Module,
    id: u8,
}

impl BroadcastChannel {
    /// Create a handle.  Only providers should mint these.
    pub fn new(loc: TileLoc, from: Module, to: Module, id: u8) -> Self {
        Self { loc, from, to, id }
    }

    pub fn loc(&self) -> TileLoc {
        self.loc
    }

    /// Module whose event is carried.
    pub fn source(&self) -> Module {
        self.from
    }

    /// Module the event is surfaced in.
    pub fn destination(&self) -> Module {
        self.to
    }

    pub fn id(&self) -> u8 {
        self.id
    }
}

/// Register-level trace programming and event translation.
pub trait TraceProgrammer {
    /// Check that `module` exists on the tile at `loc`.
    fn check_module(&self, loc: TileLoc, module: Module) -> Result<(), HwError>;

    /// Translate a logical event into the module's physical event id.
    fn logical_to_physical(&self, loc: TileLoc, module: Module, event: Event)
        -> Result<u8, HwError>;

    /// Translate a physical event id into its logical event.
    fn physical_to_logical(&self, loc: TileLoc, module: Module, hw_event: u8)
        -> Result<Event, HwError>;

    /// Program trace slots in one call.  `slots` is ordered by slot index.
    fn program_trace_events(
        &self,
        loc: TileLoc,
        module: Module,
        slots: &[(u8, Event)],
    ) -> Result<(), HwError>;

    /// Program the trace stream packet routing.
    fn program_packet(&self, loc: TileLoc, module: Module, packet: Packet) -> Result<(), HwError>;

    /// Program the start/stop events and mode of the trace control register.
    fn program_control(
        &self,
        loc: TileLoc,
        module: Module,
        start: Event,
        stop: Event,
        mode: TraceMode,
    ) -> Result<(), HwError>;

    /// Reset the trace control register.
    fn reset_control(&self, loc: TileLoc, module: Module) -> Result<(), HwError>;

    /// Reset one slot's event register.
    fn reset_trace_event(&self, loc: TileLoc, module: Module, slot: u8) -> Result<(), HwError>;
}

/// Tile classification.
pub trait TileTopology {
    fn tile_kind(&self, loc: TileLoc) -> TileKind;
}

/// Broadcast channel allocation and programming.
pub trait BroadcastProvider {
    /// Allocate a channel carrying events from `from` into `to` at `loc`.
    fn acquire(&self, loc: TileLoc, from: Module, to: Module) -> Result<BroadcastChannel, HwError>;

    /// Return a channel to the pool.
    fn release(&self, channel: BroadcastChannel);

    /// Program the channel to carry `event` from its source module.
    fn program(&self, channel: &BroadcastChannel, event: Event) -> Result<(), HwError>;

    /// Logical id the channel surfaces in its destination module.
    fn surfaced_event(&self, channel: &BroadcastChannel) -> Result<Event, HwError>;

    /// Stop the channel from carrying its event.
    fn stop(&self, channel: &BroadcastChannel) -> Result<(), HwError>;
}

/// Shared handle to the device interfaces.
#[derive(Clone)]
pub struct DeviceHandle {
    programmer: Rc<dyn TraceProgrammer>,
    topology: Rc<dyn TileTopology>,
    broadcast: Rc<dyn BroadcastProvider>,
}

impl DeviceHandle {
    pub fn new(
        programmer: Rc<dyn TraceProgrammer>,
        topology: Rc<dyn TileTopology>,
        broadcast: Rc<dyn BroadcastProvider>,
    ) -> Self {
        Self {
            programmer,
            topology,
            broadcast,
        }
    }

    /// Build a handle from one backend implementing all three interfaces.
    pub fn from_backend<B>(backend: Rc<B>) -> Self
    where
        B: TraceProgrammer + TileTopology + BroadcastProvider + 'static,
    {
        Self {
            programmer: backend.clone(),
            topology: backend.clone(),
            broadcast: backend,
        }
    }

    pub fn programmer(&self) -> &dyn TraceProgrammer {
        self.programmer.as_ref()
    }

    pub fn topology(&self) -> &dyn TileTopology {
        self.topology.as_ref()
    }

    pub fn broadcast(&self) -> &dyn BroadcastProvider {
        self.broadcast.as_ref()
    }

    /// The "none" event of `module`: the logical id of physical event 0.
    pub fn sentinel(&self, loc: TileLoc, module: Module) -> Result<Event, HwError> {
        self.programmer.physical_to_logical(loc, module, 0)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_module_per_tile_kind() {
        assert_eq!(TileKind::ShimPl.default_module(), Some(Module::Pl));
        assert_eq!(TileKind::ShimNoc.default_module(), Some(Module::Pl));
        assert_eq!(TileKind::Core.default_module(), Some(Module::Core));
        assert_eq!(TileKind::MemTile.default_module(), Some(Module::Memory));
        assert_eq!(TileKind::Unsupported.default_module(), None);
    }

    #[test]
    fn shim_kinds() {
        assert!(TileKind::ShimPl.is_shim());
        assert!(TileKind::ShimNoc.is_shim());
        assert!(!TileKind::Core.is_shim());
        assert!(!TileKind::MemTile.is_shim());
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&Module::Memory).unwrap(), "\"memory\"");
        assert_eq!(
            serde_json::to_string(&TraceMode::EventPc).unwrap(),
            "\"event-pc\""
        );
        assert_eq!(serde_json::to_string(&Event(42)).unwrap(), "42");
        let loc: TileLoc = serde_json::from_str(r#"{"col":2,"row":3}"#).unwrap();
        assert_eq!(loc, TileLoc::new(2, 3));
    }
}
