//! Trace session: a trace unit plus the events it records.
//!
//! The session is the caller-facing aggregate.  It owns the shared
//! [`TraceUnit`] and an ordered list of [`TraceEvent`]s, and sequences the
//! whole group through the lifecycle:
//!
//! ```text
//! reserve:  unit, then events in insertion order (rollback on failure)
//! start:    events first (fill the slots), then the unit (program hw)
//! stop:     unit first (halt hw), then events          (best effort)
//! release:  unit, then events                          (best effort)
//! ```
//!
//! Events added while the session is reserved are reserved and started
//! immediately, so they are picked up by the next unit start.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use log::{debug, error, warn};

use crate::device::{DeviceHandle, Event, Module, Packet, TileLoc, TraceMode};
use crate::error::{Result, RscError};
use crate::lifecycle::{Hooks, Resource, ResourceState};
use crate::trace::{SharedTraceUnit, TraceEvent, TraceUnit};
use crate::verified::slots::MAX_TRACE_SLOTS;

/// One trace unit and the events it traces.
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use tracefal::devices::sim::{SimConfig, SimDevice};
/// use tracefal::{DeviceHandle, Event, Module, Resource, TileLoc, TraceSession};
///
/// let device = DeviceHandle::from_backend(Rc::new(SimDevice::new(SimConfig::default())));
/// let mut session = TraceSession::new(device, TileLoc::new(1, 3));
/// session.set_start_stop_event(Event(1), Event(2)).unwrap();
/// session.add_event(Module::Core, Event(12)).unwrap();
/// session.add_event(Module::Memory, Event(1020)).unwrap();
///
/// session.reserve().unwrap();
/// session.start().unwrap();
/// assert_eq!(session.available_slots(), 6);
///
/// session.stop().unwrap();
/// session.release().unwrap();
/// assert_eq!(session.available_slots(), 8);
/// ```
#[derive(Debug)]
pub struct TraceSession {
    device: DeviceHandle,
    loc: TileLoc,
    unit: SharedTraceUnit,
    events: Vec<TraceEvent>,
    state: ResourceState,
}

impl TraceSession {
    /// Session on the default module of the tile's kind.
    pub fn new(device: DeviceHandle, loc: TileLoc) -> Self {
        let unit = TraceUnit::new(device.clone(), loc);
        Self::from_unit(device, loc, unit)
    }

    pub fn with_module(device: DeviceHandle, loc: TileLoc, module: Module) -> Self {
        let unit = TraceUnit::with_module(device.clone(), loc, module);
        Self::from_unit(device, loc, unit)
    }

    fn from_unit(device: DeviceHandle, loc: TileLoc, unit: TraceUnit) -> Self {
        let mut state = ResourceState::default();
        state.set_initialized(unit.is_initialized());
        Self {
            device,
            loc,
            unit: Rc::new(RefCell::new(unit)),
            events: Vec::new(),
            state,
        }
    }

    /// Rebind the unit to another module.  Only allowed while the session
    /// is idle and empty.
    pub fn set_module(&mut self, module: Module) -> Result<()> {
        if self.state.is_running() {
            return Err(RscError::Busy);
        }
        if self.state.is_reserved() {
            return Err(RscError::AlreadyReserved);
        }
        if !self.events.is_empty() {
            error!(
                "trace session {}: cannot change module with {} events attached",
                self.loc,
                self.events.len()
            );
            return Err(RscError::invalid("session already has trace events"));
        }
        let result = self.unit.borrow_mut().set_module(module);
        let initialized = self.unit.borrow().is_initialized();
        self.state.set_initialized(initialized);
        result
    }

    /// Attach a new traced event.
    ///
    /// On a reserved session the event is reserved and started right away;
    /// if that fails the event is discarded and the session is unchanged.
    pub fn add_event(&mut self, module: Module, event: Event) -> Result<()> {
        debug!("trace session {}: add {} {}", self.loc, module, event);
        if self.events.len() >= usize::from(MAX_TRACE_SLOTS) {
            error!("trace session {}: no room for another event", self.loc);
            return Err(RscError::CapacityExhausted);
        }
        if self.state.is_running() {
            error!("trace session {}: add_event rejected, already started", self.loc);
            return Err(RscError::Busy);
        }
        if !self.state.is_initialized() {
            return Err(RscError::NotInitialized);
        }

        let mut ev = TraceEvent::new(self.device.clone(), self.loc);
        ev.initialize(self.unit.clone())?;
        ev.set_event(module, event)?;

        if self.state.is_reserved() {
            ev.reserve()?;
            if let Err(e) = ev.start() {
                error!("trace session {}: late event {} failed to start: {}", self.loc, event, e);
                if let Err(re) = ev.release() {
                    warn!("trace session {}: late event release failed: {}", self.loc, re);
                }
                return Err(e);
            }
        }
        self.events.push(ev);
        Ok(())
    }

    /// Detach the first event matching (module, event).
    pub fn remove_event(&mut self, module: Module, event: Event) -> Result<()> {
        debug!("trace session {}: remove {} {}", self.loc, module, event);
        if self.state.is_running() {
            error!("trace session {}: remove_event rejected, already started", self.loc);
            return Err(RscError::Busy);
        }
        let idx = self
            .events
            .iter()
            .position(|ev| ev.get_event() == Ok((module, event)))
            .ok_or_else(|| {
                error!("trace session {}: {} {} not attached", self.loc, module, event);
                RscError::invalid(format!("{module} event {event} is not in the session"))
            })?;

        let mut ev = self.events.remove(idx);
        if ev.is_running() {
            if let Err(e) = ev.stop() {
                warn!("trace session {}: stop of {} failed: {}", self.loc, event, e);
            }
        }
        if let Err(e) = ev.release() {
            self.events.insert(idx, ev);
            return Err(e);
        }
        Ok(())
    }

    pub fn set_start_stop_event(&mut self, start: Event, stop: Event) -> Result<()> {
        self.check_idle()?;
        self.unit.borrow_mut().set_start_stop_event(start, stop)
    }

    pub fn set_mode(&mut self, mode: TraceMode) -> Result<()> {
        self.check_idle()?;
        self.unit.borrow_mut().set_mode(mode)
    }

    pub fn set_packet_routing(&mut self, packet: Packet) -> Result<()> {
        self.check_idle()?;
        self.unit.borrow_mut().set_packet_routing(packet)
    }

    pub fn available_slots(&self) -> u32 {
        self.unit.borrow().available_slots()
    }

    pub fn max_slots(&self) -> u32 {
        self.unit.borrow().max_slots()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Committed (module, event) pairs in insertion order.
    pub fn events(&self) -> impl Iterator<Item = (Module, Event)> + '_ {
        self.events.iter().filter_map(|ev| ev.get_event().ok())
    }

    /// Attached events, for inspection.
    pub fn trace_events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn loc(&self) -> TileLoc {
        self.loc
    }

    pub fn module(&self) -> Option<Module> {
        self.unit.borrow().module()
    }

    /// Borrow the unit.  Do not hold the guard across session calls.
    pub fn unit(&self) -> Ref<'_, TraceUnit> {
        self.unit.borrow()
    }

    pub fn shared_unit(&self) -> SharedTraceUnit {
        Rc::clone(&self.unit)
    }

    // ── internal helpers ──────────────────────────────────────────────

    fn check_idle(&self) -> Result<()> {
        if self.state.is_running() {
            error!("trace session {}: rejected, already started", self.loc);
            return Err(RscError::Busy);
        }
        Ok(())
    }

    /// Undo a partial reserve: the first `count` events, then the unit.
    fn rollback_reserve(&mut self, count: usize) {
        for ev in self.events[..count].iter_mut().rev() {
            if let Err(e) = ev.release() {
                warn!("trace session {}: rollback release failed: {}", self.loc, e);
            }
        }
        if let Err(e) = self.unit.borrow_mut().release() {
            warn!("trace session {}: rollback of unit failed: {}", self.loc, e);
        }
    }

    fn stop_running_events(&mut self) {
        for ev in self.events.iter_mut().filter(|ev| ev.is_running()) {
            if let Err(e) = ev.stop() {
                warn!("trace session {}: stop during rollback failed: {}", self.loc, e);
            }
        }
    }
}

impl Hooks for TraceSession {
    fn lifecycle(&self) -> ResourceState {
        self.state
    }

    fn lifecycle_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    fn configured(&self) -> bool {
        !self.events.is_empty() && self.unit.borrow().has_start_event()
    }

    fn on_reserve(&mut self) -> Result<()> {
        debug!("trace session {}: reserve {} events", self.loc, self.events.len());
        self.unit.borrow_mut().reserve()?;
        for i in 0..self.events.len() {
            if let Err(e) = self.events[i].reserve() {
                error!("trace session {}: event {} failed to reserve: {}", self.loc, i, e);
                self.rollback_reserve(i);
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_release(&mut self) -> Result<()> {
        debug!("trace session {}: release", self.loc);
        let mut first_err = None;
        if let Err(e) = self.unit.borrow_mut().release() {
            error!("trace session {}: unit release failed: {}", self.loc, e);
            first_err = Some(e);
        }
        for ev in &mut self.events {
            if ev.is_running() {
                if let Err(e) = ev.stop() {
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = ev.release() {
                error!("trace session {}: event release failed: {}", self.loc, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn on_start(&mut self) -> Result<()> {
        debug!("trace session {}: start", self.loc);
        for i in 0..self.events.len() {
            if self.events[i].is_running() {
                continue;
            }
            if let Err(e) = self.events[i].start() {
                error!("trace session {}: event {} failed to start: {}", self.loc, i, e);
                self.stop_running_events();
                return Err(e);
            }
        }
        let started = self.unit.borrow_mut().start();
        if let Err(e) = started {
            error!("trace session {}: unit failed to start: {}", self.loc, e);
            self.stop_running_events();
            return Err(e);
        }
        Ok(())
    }

    /// Halt the hardware first, then clear every slot.  Keeps going after
    /// a failure and reports the first one.
    fn on_stop(&mut self) -> Result<()> {
        debug!("trace session {}: stop", self.loc);
        let mut first_err = None;
        let unit_running = self.unit.borrow().is_running();
        if unit_running {
            if let Err(e) = self.unit.borrow_mut().stop() {
                error!("trace session {}: unit stop failed: {}", self.loc, e);
                first_err = Some(e);
            }
        }
        for ev in self.events.iter_mut().filter(|ev| ev.is_running()) {
            if let Err(e) = ev.stop() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("trace session {}: stop on drop failed: {}", self.loc, e);
            }
        }
        if self.is_reserved() {
            if let Err(e) = self.release() {
                warn!("trace session {}: release on drop failed: {}", self.loc, e);
            }
        }
    }
}
