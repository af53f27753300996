//! Trace unit: one module's trace hardware on one tile.
//!
//! The unit owns eight trace slots.  Slots are handed out first-fit by
//! [`TraceUnit::reserve_slot`] and filled by the [`TraceEvent`]s holding
//! them; the unit itself only programs the hardware when it is started.
//!
//! [`TraceEvent`]: super::TraceEvent

use log::{debug, error};

use crate::device::{DeviceHandle, Event, Module, Packet, TileKind, TileLoc, TraceMode};
use crate::error::{Result, RscError};
use crate::lifecycle::{Hooks, ResourceState};
use crate::verified::slots::{self, MAX_TRACE_SLOTS};

/// Module a unit is bound to, with that module's "none" event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Binding {
    module: Module,
    sentinel: Event,
}

/// Trace control of one (tile, module).
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use tracefal::devices::sim::{SimConfig, SimDevice};
/// use tracefal::{DeviceHandle, Module, TileLoc, TraceUnit};
///
/// let device = DeviceHandle::from_backend(Rc::new(SimDevice::new(SimConfig::default())));
/// let mut unit = TraceUnit::new(device, TileLoc::new(1, 3));
/// assert_eq!(unit.module(), Some(Module::Core));
///
/// let slot = unit.reserve_slot().unwrap();
/// assert_eq!(slot, 0);
/// assert_eq!(unit.available_slots(), 7);
/// ```
#[derive(Debug)]
pub struct TraceUnit {
    device: DeviceHandle,
    loc: TileLoc,
    binding: Option<Binding>,
    state: ResourceState,
    slot_bits: u8,
    events: [Event; MAX_TRACE_SLOTS as usize],
    start_event: Event,
    stop_event: Event,
    packet: Packet,
    mode: TraceMode,
}

impl TraceUnit {
    /// Create a unit bound to the default module of the tile's kind.
    ///
    /// An unsupported tile leaves the unit uninitialized.
    pub fn new(device: DeviceHandle, loc: TileLoc) -> Self {
        let mut unit = Self::unbound(device, loc);
        match unit.device.topology().tile_kind(loc).default_module() {
            Some(module) => {
                if let Err(e) = unit.set_module(module) {
                    error!("trace unit {}: cannot bind {} module: {}", loc, module, e);
                }
            }
            None => error!("trace unit {}: unsupported tile", loc),
        }
        unit
    }

    /// Create a unit bound to `module`.
    ///
    /// An invalid tile/module pair leaves the unit uninitialized.
    pub fn with_module(device: DeviceHandle, loc: TileLoc, module: Module) -> Self {
        let mut unit = Self::unbound(device, loc);
        if let Err(e) = unit.set_module(module) {
            error!("trace unit {}: invalid tile and module {}: {}", loc, module, e);
        }
        unit
    }

    fn unbound(device: DeviceHandle, loc: TileLoc) -> Self {
        Self {
            device,
            loc,
            binding: None,
            state: ResourceState::default(),
            slot_bits: 0,
            events: [Event::default(); MAX_TRACE_SLOTS as usize],
            start_event: Event::default(),
            stop_event: Event::default(),
            packet: Packet::default(),
            mode: TraceMode::default(),
        }
    }

    /// Bind the unit to `module`, resetting start/stop and every slot to
    /// the module's "none" event.
    pub fn set_module(&mut self, module: Module) -> Result<()> {
        if self.state.is_running() {
            return Err(RscError::Busy);
        }
        if self.state.is_reserved() || self.slot_bits != 0 {
            error!("trace unit {}: set_module failed, already reserved", self.loc);
            return Err(RscError::AlreadyReserved);
        }
        if self.device.topology().tile_kind(self.loc) == TileKind::Unsupported {
            return Err(RscError::invalid(format!("tile {} is unsupported", self.loc)));
        }
        if let Err(e) = self.device.programmer().check_module(self.loc, module) {
            error!("trace unit {}: set_module failed, invalid module for tile", self.loc);
            return Err(RscError::invalid(e.to_string()));
        }
        let sentinel = self.device.sentinel(self.loc, module)?;

        self.binding = Some(Binding { module, sentinel });
        self.start_event = sentinel;
        self.stop_event = sentinel;
        self.events = [sentinel; MAX_TRACE_SLOTS as usize];
        self.state.set_initialized(true);
        debug!("trace unit {}: bound to {} module", self.loc, module);
        Ok(())
    }

    pub fn loc(&self) -> TileLoc {
        self.loc
    }

    pub fn module(&self) -> Option<Module> {
        self.binding.map(|b| b.module)
    }

    /// The bound module's "none" event.
    pub fn sentinel(&self) -> Option<Event> {
        self.binding.map(|b| b.sentinel)
    }

    /// Claim the lowest free slot.
    pub fn reserve_slot(&mut self) -> Result<u8> {
        if self.state.is_running() {
            error!("trace unit {}: reserve_slot failed, tracing already started", self.loc);
            return Err(RscError::Busy);
        }
        self.binding()?;
        let slot = slots::first_free(u32::from(self.slot_bits), MAX_TRACE_SLOTS)
            .ok_or(RscError::CapacityExhausted)?;
        self.slot_bits = slots::claim(u32::from(self.slot_bits), slot) as u8;
        debug!("trace unit {}: reserved slot {}", self.loc, slot);
        Ok(slot)
    }

    /// Return `slot` to the free pool and reset it to the "none" event.
    pub fn release_slot(&mut self, slot: u8) -> Result<()> {
        if self.state.is_running() {
            error!("trace unit {}: release_slot failed, tracing already started", self.loc);
            return Err(RscError::Busy);
        }
        self.check_reserved_slot(slot)?;
        let sentinel = self.binding()?.sentinel;
        self.slot_bits = slots::free(u32::from(self.slot_bits), slot) as u8;
        self.events[slot as usize] = sentinel;
        debug!("trace unit {}: released slot {}", self.loc, slot);
        Ok(())
    }

    /// Record the event a reserved slot traces.  No hardware is touched.
    pub fn set_slot_event(&mut self, slot: u8, event: Event) -> Result<()> {
        debug!("trace unit {}: slot {} <- {}", self.loc, slot, event);
        if self.state.is_running() {
            error!("trace unit {}: set_slot_event failed, trace started", self.loc);
            return Err(RscError::Busy);
        }
        self.binding()?;
        self.check_reserved_slot(slot)?;
        self.events[slot as usize] = event;
        Ok(())
    }

    /// Set the events that start and stop tracing.  Both are checked
    /// before either is stored.
    pub fn set_start_stop_event(&mut self, start: Event, stop: Event) -> Result<()> {
        debug!("trace unit {}: start={} stop={}", self.loc, start, stop);
        if self.state.is_running() {
            return Err(RscError::Busy);
        }
        let module = self.binding()?.module;
        let programmer = self.device.programmer();
        for event in [start, stop] {
            if let Err(e) = programmer.logical_to_physical(self.loc, module, event) {
                error!("trace unit {}: invalid start/stop event {}", self.loc, event);
                return Err(RscError::invalid(e.to_string()));
            }
        }
        self.start_event = start;
        self.stop_event = stop;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: TraceMode) -> Result<()> {
        if self.state.is_running() {
            return Err(RscError::Busy);
        }
        self.binding()?;
        self.mode = mode;
        Ok(())
    }

    pub fn set_packet_routing(&mut self, packet: Packet) -> Result<()> {
        if self.state.is_running() {
            return Err(RscError::Busy);
        }
        self.binding()?;
        self.packet = packet;
        Ok(())
    }

    pub fn start_event(&self) -> Event {
        self.start_event
    }

    pub fn stop_event(&self) -> Event {
        self.stop_event
    }

    /// Whether a start event other than "none" has been set.
    pub fn has_start_event(&self) -> bool {
        self.binding
            .map_or(false, |b| self.start_event != b.sentinel)
    }

    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    pub fn packet(&self) -> Packet {
        self.packet
    }

    /// Event recorded for `slot`, or `None` if the index is out of range.
    pub fn slot_event(&self, slot: u8) -> Option<Event> {
        self.events.get(slot as usize).copied()
    }

    pub fn is_slot_reserved(&self, slot: u8) -> bool {
        slot < MAX_TRACE_SLOTS && slots::is_held(u32::from(self.slot_bits), slot)
    }

    /// Reserved slots in ascending order.
    pub fn reserved_slots(&self) -> impl Iterator<Item = u8> {
        slots::held_entries(u32::from(self.slot_bits), MAX_TRACE_SLOTS)
    }

    pub fn reserved_slot_count(&self) -> u32 {
        slots::held_count(u32::from(self.slot_bits), MAX_TRACE_SLOTS)
    }

    pub fn max_slots(&self) -> u32 {
        u32::from(MAX_TRACE_SLOTS)
    }

    pub fn available_slots(&self) -> u32 {
        self.max_slots() - self.reserved_slot_count()
    }

    /// Raw slot occupancy bitmap.
    pub fn slot_bitmap(&self) -> u8 {
        self.slot_bits
    }

    // ── internal helpers ──────────────────────────────────────────────

    fn binding(&self) -> Result<Binding> {
        self.binding.ok_or_else(|| {
            error!("trace unit {}: not initialized, set module first", self.loc);
            RscError::NotInitialized
        })
    }

    fn check_reserved_slot(&self, slot: u8) -> Result<()> {
        if slot >= MAX_TRACE_SLOTS {
            error!("trace unit {}: invalid slot {}", self.loc, slot);
            return Err(RscError::invalid(format!("slot {slot} out of range")));
        }
        if !self.is_slot_reserved(slot) {
            error!("trace unit {}: slot {} is not reserved", self.loc, slot);
            return Err(RscError::invalid(format!("slot {slot} is not reserved")));
        }
        Ok(())
    }

    /// Reserved (slot, event) pairs in slot order.
    fn programmed_slots(&self) -> Vec<(u8, Event)> {
        self.reserved_slots()
            .map(|slot| (slot, self.events[slot as usize]))
            .collect()
    }
}

impl Hooks for TraceUnit {
    fn lifecycle(&self) -> ResourceState {
        self.state
    }

    fn lifecycle_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    /// A start event is set and at least one reserved slot traces
    /// something other than "none".
    fn configured(&self) -> bool {
        let Some(binding) = self.binding else {
            return false;
        };
        self.start_event != binding.sentinel
            && self
                .reserved_slots()
                .any(|slot| self.events[slot as usize] != binding.sentinel)
    }

    // TODO: claim the unit from the driver's own resource manager once it
    // exposes trace controls; slots are only tracked locally for now.
    fn on_reserve(&mut self) -> Result<()> {
        debug!("trace unit {}: reserve", self.loc);
        Ok(())
    }

    fn on_release(&mut self) -> Result<()> {
        debug!("trace unit {}: release", self.loc);
        Ok(())
    }

    fn on_start(&mut self) -> Result<()> {
        let module = self.binding()?.module;
        debug!("trace unit {}: start {} module", self.loc, module);

        let programmer = self.device.programmer();
        programmer.program_trace_events(self.loc, module, &self.programmed_slots())?;
        programmer.program_packet(self.loc, module, self.packet)?;
        programmer.program_control(self.loc, module, self.start_event, self.stop_event, self.mode)?;
        Ok(())
    }

    /// Resets control and slot registers.  Packet routing stays as is so
    /// that data already buffered in the trace stream is not disturbed.
    fn on_stop(&mut self) -> Result<()> {
        let module = self.binding()?.module;
        debug!("trace unit {}: stop {} module", self.loc, module);

        let programmer = self.device.programmer();
        programmer.reset_control(self.loc, module)?;

        let mut first_err = None;
        for slot in self.reserved_slots() {
            if let Err(e) = programmer.reset_trace_event(self.loc, module, slot) {
                error!("trace unit {}: reset of slot {} failed: {}", self.loc, slot, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::devices::sim::{SimConfig, SimDevice, SimFault, SimOp, TraceRegs};
    use crate::lifecycle::Resource;

    const CORE_TILE: TileLoc = TileLoc::new(1, 3);

    fn setup() -> (Rc<SimDevice>, TraceUnit) {
        let sim = Rc::new(SimDevice::new(SimConfig::default()));
        let unit = TraceUnit::new(DeviceHandle::from_backend(sim.clone()), CORE_TILE);
        (sim, unit)
    }

    /// Unit with slot 0 tracing core event 12 and a start event set.
    fn configured() -> (Rc<SimDevice>, TraceUnit) {
        let (sim, mut unit) = setup();
        let slot = unit.reserve_slot().unwrap();
        unit.set_slot_event(slot, Event(12)).unwrap();
        unit.set_start_stop_event(Event(1), Event(2)).unwrap();
        (sim, unit)
    }

    // ── binding ──────────────────────────────────────────────────

    #[test]
    fn binds_default_module_of_tile() {
        let (_sim, unit) = setup();
        assert!(unit.is_initialized());
        assert_eq!(unit.module(), Some(Module::Core));
        assert_eq!(unit.sentinel(), Some(Event(0)));
        assert_eq!(unit.start_event(), Event(0));
        assert_eq!(unit.stop_event(), Event(0));
    }

    #[test]
    fn shim_and_mem_tiles_bind_their_modules() {
        let sim = Rc::new(SimDevice::new(SimConfig::default()));
        let device = DeviceHandle::from_backend(sim);
        let shim = TraceUnit::new(device.clone(), TileLoc::new(0, 0));
        assert_eq!(shim.module(), Some(Module::Pl));
        assert_eq!(shim.sentinel(), Some(Event(2000)));
        let mem = TraceUnit::new(device, TileLoc::new(0, 1));
        assert_eq!(mem.module(), Some(Module::Memory));
    }

    #[test]
    fn unsupported_tile_stays_uninitialized() {
        let sim = Rc::new(SimDevice::new(SimConfig::default()));
        let mut unit = TraceUnit::new(DeviceHandle::from_backend(sim), TileLoc::new(40, 40));
        assert!(!unit.is_initialized());
        assert_eq!(unit.module(), None);
        assert_eq!(unit.reserve_slot(), Err(RscError::NotInitialized));
        assert_eq!(unit.reserve(), Err(RscError::NotInitialized));
        assert!(matches!(unit.set_module(Module::Core), Err(RscError::InvalidArgument(_))));
    }

    #[test]
    fn with_module_rejects_module_missing_on_tile() {
        let sim = Rc::new(SimDevice::new(SimConfig::default()));
        let unit = TraceUnit::with_module(DeviceHandle::from_backend(sim), CORE_TILE, Module::Pl);
        assert!(!unit.is_initialized());
    }

    #[test]
    fn set_module_rebinds_sentinels() {
        let (_sim, mut unit) = setup();
        unit.set_module(Module::Memory).unwrap();
        assert_eq!(unit.sentinel(), Some(Event(1000)));
        assert_eq!(unit.start_event(), Event(1000));
        assert_eq!(unit.slot_event(5), Some(Event(1000)));
    }

    #[test]
    fn set_module_rejected_while_slots_or_unit_reserved() {
        let (_sim, mut unit) = setup();
        let slot = unit.reserve_slot().unwrap();
        assert_eq!(unit.set_module(Module::Memory), Err(RscError::AlreadyReserved));
        unit.release_slot(slot).unwrap();

        unit.reserve().unwrap();
        assert_eq!(unit.set_module(Module::Memory), Err(RscError::AlreadyReserved));
    }

    // ── slot allocation ──────────────────────────────────────────

    #[test]
    fn slots_first_fit_in_request_order() {
        let (_sim, mut unit) = setup();
        let got: Vec<u8> = (0..3).map(|_| unit.reserve_slot().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2]);

        unit.release_slot(1).unwrap();
        assert_eq!(unit.reserve_slot(), Ok(1), "lowest hole is reused");
    }

    #[test]
    fn reserve_release_restores_fresh_bitmap() {
        let (sim, mut unit) = setup();
        let fresh = TraceUnit::new(DeviceHandle::from_backend(sim), CORE_TILE);

        let a = unit.reserve_slot().unwrap();
        let b = unit.reserve_slot().unwrap();
        unit.set_slot_event(b, Event(9)).unwrap();
        unit.release_slot(a).unwrap();
        unit.release_slot(b).unwrap();

        assert_eq!(unit.slot_bitmap(), fresh.slot_bitmap());
        assert_eq!(unit.available_slots(), fresh.available_slots());
        for slot in 0..MAX_TRACE_SLOTS {
            assert_eq!(unit.slot_event(slot), fresh.slot_event(slot));
        }
    }

    #[test]
    fn ninth_slot_is_capacity_exhausted() {
        let (_sim, mut unit) = setup();
        for expected in 0..8 {
            assert_eq!(unit.reserve_slot(), Ok(expected));
        }
        assert_eq!(unit.reserve_slot(), Err(RscError::CapacityExhausted));
        assert_eq!(unit.available_slots(), 0);
        assert_eq!(unit.reserved_slot_count(), 8);
    }

    #[test]
    fn release_slot_validates_index() {
        let (_sim, mut unit) = setup();
        assert!(matches!(unit.release_slot(8), Err(RscError::InvalidArgument(_))));
        assert!(matches!(unit.release_slot(2), Err(RscError::InvalidArgument(_))));
    }

    #[test]
    fn set_slot_event_requires_reserved_slot() {
        let (_sim, mut unit) = setup();
        assert!(matches!(
            unit.set_slot_event(0, Event(3)),
            Err(RscError::InvalidArgument(_))
        ));
        assert!(matches!(
            unit.set_slot_event(9, Event(3)),
            Err(RscError::InvalidArgument(_))
        ));
    }

    // ── configured predicate ─────────────────────────────────────

    #[test]
    fn configured_needs_start_event_and_real_slot() {
        let (_sim, mut unit) = setup();
        assert!(!unit.is_configured());

        let slot = unit.reserve_slot().unwrap();
        unit.set_slot_event(slot, Event(12)).unwrap();
        assert!(!unit.is_configured(), "start event still none");

        unit.set_start_stop_event(Event(1), Event(2)).unwrap();
        assert!(unit.is_configured());

        unit.set_slot_event(slot, Event(0)).unwrap();
        assert!(!unit.is_configured(), "only none events traced");

        unit.set_slot_event(slot, Event(12)).unwrap();
        unit.release_slot(slot).unwrap();
        assert!(!unit.is_configured(), "released slots do not count");
    }

    #[test]
    fn start_stop_event_checked_before_commit() {
        let (_sim, mut unit) = setup();
        // Valid start, invalid stop (a memory-module event on the core unit).
        assert!(matches!(
            unit.set_start_stop_event(Event(1), Event(1001)),
            Err(RscError::InvalidArgument(_))
        ));
        assert_eq!(unit.start_event(), Event(0));
        assert_eq!(unit.stop_event(), Event(0));
    }

    // ── start / stop ─────────────────────────────────────────────

    #[test]
    fn start_programs_slots_packet_and_control() {
        let (sim, mut unit) = configured();
        let second = unit.reserve_slot().unwrap();
        unit.set_slot_event(second, Event(33)).unwrap();
        unit.set_mode(TraceMode::EventPc).unwrap();
        unit.set_packet_routing(Packet { id: 3, packet_type: 1 }).unwrap();

        unit.reserve().unwrap();
        unit.start().unwrap();
        assert!(unit.is_running());

        let regs = sim.trace_regs(CORE_TILE, Module::Core);
        assert_eq!(&regs.slots[..3], &[12, 33, 0]);
        assert_eq!(regs.packet, Some(Packet { id: 3, packet_type: 1 }));
        let control = regs.control.unwrap();
        assert_eq!((control.start, control.stop, control.mode), (1, 2, TraceMode::EventPc));
    }

    #[test]
    fn start_requires_configuration() {
        let (_sim, mut unit) = setup();
        unit.reserve().unwrap();
        assert_eq!(unit.start(), Err(RscError::NotReady));
    }

    #[test]
    fn running_unit_rejects_every_setter() {
        let (_sim, mut unit) = configured();
        unit.reserve().unwrap();
        unit.start().unwrap();

        assert_eq!(unit.reserve_slot(), Err(RscError::Busy));
        assert_eq!(unit.release_slot(0), Err(RscError::Busy));
        assert_eq!(unit.set_slot_event(0, Event(5)), Err(RscError::Busy));
        assert_eq!(unit.set_start_stop_event(Event(1), Event(2)), Err(RscError::Busy));
        assert_eq!(unit.set_mode(TraceMode::Execution), Err(RscError::Busy));
        assert_eq!(unit.set_packet_routing(Packet::default()), Err(RscError::Busy));
        assert_eq!(unit.set_module(Module::Memory), Err(RscError::Busy));
        assert_eq!(unit.release(), Err(RscError::Busy));

        unit.stop().unwrap();
        assert!(unit.set_mode(TraceMode::Execution).is_ok());
    }

    #[test]
    fn failed_program_aborts_start() {
        let (sim, mut unit) = configured();
        unit.reserve().unwrap();
        sim.inject_fault(SimFault::on(SimOp::ProgramPacket));

        assert!(matches!(unit.start(), Err(RscError::Hardware(_))));
        assert!(!unit.is_running());
        // The control register is never reached.
        assert_eq!(sim.trace_regs(CORE_TILE, Module::Core).control, None);
    }

    #[test]
    fn stop_resets_control_and_slots_but_keeps_packet() {
        let (sim, mut unit) = configured();
        unit.set_packet_routing(Packet { id: 7, packet_type: 0 }).unwrap();
        unit.reserve().unwrap();
        unit.start().unwrap();
        unit.stop().unwrap();

        let regs = sim.trace_regs(CORE_TILE, Module::Core);
        assert_eq!(regs.control, None);
        assert_eq!(regs.slots, TraceRegs::default().slots);
        assert_eq!(regs.packet, Some(Packet { id: 7, packet_type: 0 }));
        assert!(unit.is_reserved());
        assert!(unit.is_slot_reserved(0));
    }

    #[test]
    fn stop_skips_slot_resets_when_control_reset_fails() {
        let (sim, mut unit) = configured();
        unit.reserve().unwrap();
        unit.start().unwrap();
        sim.inject_fault(SimFault::on(SimOp::ResetControl));

        assert!(unit.stop().is_err());
        assert!(!unit.is_running(), "running is cleared regardless");
        assert_eq!(sim.stats().event_resets, 0);
    }

    #[test]
    fn stop_attempts_every_slot_reset() {
        let (sim, mut unit) = configured();
        let second = unit.reserve_slot().unwrap();
        unit.set_slot_event(second, Event(40)).unwrap();
        unit.reserve().unwrap();
        unit.start().unwrap();
        sim.inject_fault(SimFault::on(SimOp::ResetTraceEvent));

        assert!(unit.stop().is_err());
        // Slot 0 failed; slot 1 was still reset.
        let regs = sim.trace_regs(CORE_TILE, Module::Core);
        assert_eq!(regs.slots[0], 12);
        assert_eq!(regs.slots[1], 0);
    }
}
