//! Deterministic simulated AI-engine array.
//!
//! [`SimDevice`] implements every interface in [`crate::device`] against an
//! in-memory model of the array: a row-major tile grid, per-module trace
//! registers and a per-tile broadcast channel pool.  Programming calls
//! update the register model instead of touching silicon, and a FIFO queue
//! of [`SimFault`]s makes any of them fail on demand.
//!
//! # Event encoding
//!
//! Logical ids are `module base + physical id`, with bases
//! [`CORE_EVENT_BASE`], [`MEMORY_EVENT_BASE`] and [`PL_EVENT_BASE`].
//! Physical id 0 is the "none" event of every module.  A broadcast channel
//! `n` surfaces as physical event [`BROADCAST_EVENT_BASE`]` + n` in its
//! destination module.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::device::{
    BroadcastChannel, BroadcastProvider, Event, Module, Packet, TileKind, TileLoc, TileTopology,
    TraceMode, TraceProgrammer,
};
use crate::error::{HwError, RscError};
use crate::verified::slots::{self, MAX_TRACE_SLOTS, MAX_WIDTH};

pub const CORE_EVENT_BASE: u32 = 0;
pub const MEMORY_EVENT_BASE: u32 = 1000;
pub const PL_EVENT_BASE: u32 = 2000;

/// Physical id of broadcast channel 0 in every module.
pub const BROADCAST_EVENT_BASE: u8 = 107;

/// Geometry and pool sizes of the simulated array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub columns: u8,
    /// Total rows, including the shim row (row 0).
    pub rows: u8,
    /// Rows directly above the shim row that hold mem tiles.
    pub mem_tile_rows: u8,
    /// Shim columns with a NoC interface; the rest are PL-only.
    pub noc_columns: Vec<u8>,
    /// Broadcast channels per tile (capped at 32).
    pub broadcast_channels: u8,
    /// Size of every module's physical event space.  Must leave room for
    /// the surfaced ids `BROADCAST_EVENT_BASE..BROADCAST_EVENT_BASE + channels`.
    pub events_per_module: u8,
}

impl SimConfig {
    /// Check that every broadcast channel surfaces inside the event space.
    pub fn validate(&self) -> Result<(), RscError> {
        let channels = u32::from(self.broadcast_channels.min(MAX_WIDTH));
        let needed = u32::from(BROADCAST_EVENT_BASE) + channels;
        if needed > u32::from(self.events_per_module) {
            return Err(RscError::invalid(format!(
                "{} broadcast channels surface up to physical event {}, \
                 but modules only have {} events",
                channels,
                needed - 1,
                self.events_per_module
            )));
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            columns: 5,
            rows: 6,
            mem_tile_rows: 1,
            noc_columns: vec![2, 3],
            broadcast_channels: 16,
            events_per_module: 128,
        }
    }
}

/// Device operations a [`SimFault`] can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimOp {
    ProgramTraceEvents,
    ProgramPacket,
    ProgramControl,
    ResetControl,
    ResetTraceEvent,
    AcquireBroadcast,
    ProgramBroadcast,
    QueryBroadcast,
    StopBroadcast,
}

impl SimOp {
    pub fn name(self) -> &'static str {
        match self {
            SimOp::ProgramTraceEvents => "program_trace_events",
            SimOp::ProgramPacket => "program_packet",
            SimOp::ProgramControl => "program_control",
            SimOp::ResetControl => "reset_control",
            SimOp::ResetTraceEvent => "reset_trace_event",
            SimOp::AcquireBroadcast => "acquire_broadcast",
            SimOp::ProgramBroadcast => "program_broadcast",
            SimOp::QueryBroadcast => "query_broadcast",
            SimOp::StopBroadcast => "stop_broadcast",
        }
    }
}

/// A failure to inject into a future device call.
///
/// Faults are matched and consumed in FIFO order: the next call of `op`
/// (at `loc`, if given) triggers the oldest matching fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFault {
    pub op: SimOp,
    pub loc: Option<TileLoc>,
}

impl SimFault {
    /// Fail the next `op` on any tile.
    pub fn on(op: SimOp) -> Self {
        Self { op, loc: None }
    }

    /// Restrict the fault to one tile.
    pub fn at(mut self, loc: TileLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    fn matches(&self, op: SimOp, loc: TileLoc) -> bool {
        self.op == op && self.loc.map_or(true, |l| l == loc)
    }
}

/// Programmed trace control register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRegs {
    pub start: u8,
    pub stop: u8,
    pub mode: TraceMode,
}

/// Register model of one module's trace unit.  Slot values are physical
/// event ids; 0 is the reset value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRegs {
    pub slots: [u8; MAX_TRACE_SLOTS as usize],
    pub control: Option<ControlRegs>,
    pub packet: Option<Packet>,
}

/// Call counters for a [`SimDevice`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub broadcast_acquired: u64,
    pub broadcast_released: u64,
    pub trace_programs: u64,
    pub control_programs: u64,
    pub control_resets: u64,
    pub event_resets: u64,
    pub faults_fired: u64,
}

#[derive(Debug, Default)]
struct SimState {
    /// Per-tile broadcast channel bitmap.
    channels: HashMap<TileLoc, u32>,
    /// Physical source event carried by each programmed channel.
    routes: HashMap<(TileLoc, u8), u8>,
    regs: HashMap<(TileLoc, Module), TraceRegs>,
    faults: VecDeque<SimFault>,
    stats: SimStats,
}

/// An in-memory AI-engine array with deterministic fault injection.
///
/// # Examples
///
/// ```
/// use tracefal::devices::sim::{SimConfig, SimDevice};
/// use tracefal::{Module, TileKind, TileLoc, TileTopology, TraceProgrammer};
///
/// let dev = SimDevice::new(SimConfig::default());
/// assert_eq!(dev.tile_kind(TileLoc::new(0, 3)), TileKind::Core);
/// let none = dev.physical_to_logical(TileLoc::new(0, 3), Module::Memory, 0).unwrap();
/// assert_eq!(none.0, 1000);
/// ```
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    state: RefCell<SimState>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!("sim: {}; cross-module events will fail to start", e);
        }
        Self {
            config,
            state: RefCell::new(SimState::default()),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Enqueue a fault to be triggered on a future call.
    pub fn inject_fault(&self, fault: SimFault) {
        self.state.borrow_mut().faults.push_back(fault);
    }

    /// Faults queued but not yet fired.
    pub fn pending_faults(&self) -> usize {
        self.state.borrow().faults.len()
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats.clone()
    }

    /// Register model of `module`'s trace unit at `loc`.
    pub fn trace_regs(&self, loc: TileLoc, module: Module) -> TraceRegs {
        self.state
            .borrow()
            .regs
            .get(&(loc, module))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of broadcast channels held at `loc`.
    pub fn channels_in_use(&self, loc: TileLoc) -> u32 {
        let bits = self.state.borrow().channels.get(&loc).copied().unwrap_or(0);
        slots::held_count(bits, self.channel_width())
    }

    /// Physical source event a channel is programmed to carry.
    pub fn broadcast_route(&self, loc: TileLoc, id: u8) -> Option<u8> {
        self.state.borrow().routes.get(&(loc, id)).copied()
    }

    /// Modules that carry trace hardware on a tile kind.
    pub fn modules_of(kind: TileKind) -> &'static [Module] {
        match kind {
            TileKind::Unsupported => &[],
            TileKind::ShimPl | TileKind::ShimNoc => &[Module::Pl],
            TileKind::MemTile => &[Module::Memory],
            TileKind::Core => &[Module::Core, Module::Memory],
        }
    }

    // ── internal helpers ──────────────────────────────────────────────

    fn channel_width(&self) -> u8 {
        self.config.broadcast_channels.min(MAX_WIDTH)
    }

    fn module_base(module: Module) -> u32 {
        match module {
            Module::Core => CORE_EVENT_BASE,
            Module::Memory => MEMORY_EVENT_BASE,
            Module::Pl => PL_EVENT_BASE,
        }
    }

    /// Fire the oldest queued fault matching `op` at `loc`, if any.
    fn take_fault(&self, op: SimOp, loc: TileLoc) -> Result<(), HwError> {
        let mut state = self.state.borrow_mut();
        if let Some(idx) = state.faults.iter().position(|f| f.matches(op, loc)) {
            state.faults.remove(idx);
            state.stats.faults_fired += 1;
            debug!("sim: injected {} failure at {}", op.name(), loc);
            return Err(HwError::Injected { op: op.name(), loc });
        }
        Ok(())
    }

    fn check_slot(loc: TileLoc, module: Module, slot: u8) -> Result<(), HwError> {
        if slot >= MAX_TRACE_SLOTS {
            return Err(HwError::InvalidSlot { loc, module, slot });
        }
        Ok(())
    }

    fn check_channel(&self, channel: &BroadcastChannel) -> Result<(), HwError> {
        let bits = self
            .state
            .borrow()
            .channels
            .get(&channel.loc())
            .copied()
            .unwrap_or(0);
        if !slots::is_held(bits, channel.id()) {
            return Err(HwError::UnknownChannel {
                loc: channel.loc(),
                id: channel.id(),
            });
        }
        Ok(())
    }
}

impl TileTopology for SimDevice {
    fn tile_kind(&self, loc: TileLoc) -> TileKind {
        let cfg = &self.config;
        if loc.col >= cfg.columns || loc.row >= cfg.rows {
            TileKind::Unsupported
        } else if loc.row == 0 {
            if cfg.noc_columns.contains(&loc.col) {
                TileKind::ShimNoc
            } else {
                TileKind::ShimPl
            }
        } else if loc.row <= cfg.mem_tile_rows {
            TileKind::MemTile
        } else {
            TileKind::Core
        }
    }
}

impl TraceProgrammer for SimDevice {
    fn check_module(&self, loc: TileLoc, module: Module) -> Result<(), HwError> {
        let kind = self.tile_kind(loc);
        if kind == TileKind::Unsupported {
            return Err(HwError::InvalidTile { loc });
        }
        if !Self::modules_of(kind).contains(&module) {
            return Err(HwError::InvalidModule { loc, module });
        }
        Ok(())
    }

    fn logical_to_physical(
        &self,
        loc: TileLoc,
        module: Module,
        event: Event,
    ) -> Result<u8, HwError> {
        self.check_module(loc, module)?;
        let base = Self::module_base(module);
        match event.0.checked_sub(base) {
            Some(hw) if hw < u32::from(self.config.events_per_module) => Ok(hw as u8),
            _ => Err(HwError::InvalidEvent { loc, module, event }),
        }
    }

    fn physical_to_logical(
        &self,
        loc: TileLoc,
        module: Module,
        hw_event: u8,
    ) -> Result<Event, HwError> {
        self.check_module(loc, module)?;
        if hw_event >= self.config.events_per_module {
            return Err(HwError::InvalidPhysicalEvent {
                loc,
                module,
                hw_event,
            });
        }
        Ok(Event(Self::module_base(module) + u32::from(hw_event)))
    }

    fn program_trace_events(
        &self,
        loc: TileLoc,
        module: Module,
        slots: &[(u8, Event)],
    ) -> Result<(), HwError> {
        self.take_fault(SimOp::ProgramTraceEvents, loc)?;
        self.check_module(loc, module)?;

        // Translate everything before touching the registers.
        let mut encoded = Vec::with_capacity(slots.len());
        for &(slot, event) in slots {
            Self::check_slot(loc, module, slot)?;
            encoded.push((slot, self.logical_to_physical(loc, module, event)?));
        }

        debug!("sim: program {} trace slots at {} {}", encoded.len(), loc, module);
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let regs = state.regs.entry((loc, module)).or_default();
        for (slot, hw) in encoded {
            regs.slots[slot as usize] = hw;
        }
        state.stats.trace_programs += 1;
        Ok(())
    }

    fn program_packet(&self, loc: TileLoc, module: Module, packet: Packet) -> Result<(), HwError> {
        self.take_fault(SimOp::ProgramPacket, loc)?;
        self.check_module(loc, module)?;
        self.state
            .borrow_mut()
            .regs
            .entry((loc, module))
            .or_default()
            .packet = Some(packet);
        Ok(())
    }

    fn program_control(
        &self,
        loc: TileLoc,
        module: Module,
        start: Event,
        stop: Event,
        mode: TraceMode,
    ) -> Result<(), HwError> {
        self.take_fault(SimOp::ProgramControl, loc)?;
        let start = self.logical_to_physical(loc, module, start)?;
        let stop = self.logical_to_physical(loc, module, stop)?;

        debug!(
            "sim: program trace control at {} {}: start={} stop={} mode={:?}",
            loc, module, start, stop, mode
        );
        let mut state = self.state.borrow_mut();
        state.regs.entry((loc, module)).or_default().control =
            Some(ControlRegs { start, stop, mode });
        state.stats.control_programs += 1;
        Ok(())
    }

    fn reset_control(&self, loc: TileLoc, module: Module) -> Result<(), HwError> {
        self.take_fault(SimOp::ResetControl, loc)?;
        self.check_module(loc, module)?;
        let mut state = self.state.borrow_mut();
        state.regs.entry((loc, module)).or_default().control = None;
        state.stats.control_resets += 1;
        Ok(())
    }

    fn reset_trace_event(&self, loc: TileLoc, module: Module, slot: u8) -> Result<(), HwError> {
        self.take_fault(SimOp::ResetTraceEvent, loc)?;
        self.check_module(loc, module)?;
        Self::check_slot(loc, module, slot)?;
        let mut state = self.state.borrow_mut();
        state.regs.entry((loc, module)).or_default().slots[slot as usize] = 0;
        state.stats.event_resets += 1;
        Ok(())
    }
}

impl BroadcastProvider for SimDevice {
    fn acquire(&self, loc: TileLoc, from: Module, to: Module) -> Result<BroadcastChannel, HwError> {
        self.take_fault(SimOp::AcquireBroadcast, loc)?;
        self.check_module(loc, from)?;
        self.check_module(loc, to)?;

        let width = self.channel_width();
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let bits = state.channels.entry(loc).or_insert(0);
        let id = slots::first_free(*bits, width).ok_or(HwError::NoBroadcastChannel { loc })?;
        *bits = slots::claim(*bits, id);
        state.stats.broadcast_acquired += 1;

        debug!("sim: broadcast channel {} at {} ({} -> {})", id, loc, from, to);
        Ok(BroadcastChannel::new(loc, from, to, id))
    }

    fn release(&self, channel: BroadcastChannel) {
        let loc = channel.loc();
        let id = channel.id();
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let bits = state.channels.entry(loc).or_insert(0);
        if !slots::is_held(*bits, id) {
            warn!("sim: release of unallocated broadcast channel {} at {}", id, loc);
            return;
        }
        *bits = slots::free(*bits, id);
        state.routes.remove(&(loc, id));
        state.stats.broadcast_released += 1;
    }

    fn program(&self, channel: &BroadcastChannel, event: Event) -> Result<(), HwError> {
        let loc = channel.loc();
        self.take_fault(SimOp::ProgramBroadcast, loc)?;
        self.check_channel(channel)?;
        let hw = self.logical_to_physical(loc, channel.source(), event)?;
        self.state.borrow_mut().routes.insert((loc, channel.id()), hw);
        Ok(())
    }

    fn surfaced_event(&self, channel: &BroadcastChannel) -> Result<Event, HwError> {
        let loc = channel.loc();
        self.take_fault(SimOp::QueryBroadcast, loc)?;
        self.check_channel(channel)?;
        let hw = BROADCAST_EVENT_BASE.checked_add(channel.id()).ok_or(
            HwError::UnknownChannel {
                loc,
                id: channel.id(),
            },
        )?;
        self.physical_to_logical(loc, channel.destination(), hw)
    }

    fn stop(&self, channel: &BroadcastChannel) -> Result<(), HwError> {
        let loc = channel.loc();
        self.take_fault(SimOp::StopBroadcast, loc)?;
        self.check_channel(channel)?;
        self.state.borrow_mut().routes.remove(&(loc, channel.id()));
        Ok(())
    }
}
