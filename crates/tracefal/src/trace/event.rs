//! Trace event: one logical (module, event) occupying a trace slot.
//!
//! When the event lives in a different module than the trace unit (a
//! memory-module event traced by the core module's unit, say), the unit
//! cannot see it directly.  The event then also holds a broadcast channel
//! that relays it into the unit's module, and the slot is filled with the
//! id the channel surfaces there.

use log::{debug, error, warn};

use crate::device::{BroadcastChannel, DeviceHandle, Event, Module, TileKind, TileLoc};
use crate::error::{Result, RscError};
use crate::lifecycle::{Hooks, Resource, ResourceState};
use crate::trace::SharedTraceUnit;

/// Unit module and "none" event captured at [`TraceEvent::initialize`].
#[derive(Clone, Copy, Debug)]
struct UnitBinding {
    module: Module,
    sentinel: Event,
}

/// A single traced event bound to a shared [`TraceUnit`].
///
/// [`TraceUnit`]: super::TraceUnit
#[derive(Debug)]
pub struct TraceEvent {
    device: DeviceHandle,
    loc: TileLoc,
    unit: Option<SharedTraceUnit>,
    bound: Option<UnitBinding>,
    /// Committed (module, event).
    event: Option<(Module, Event)>,
    slot: Option<u8>,
    channel: Option<BroadcastChannel>,
    state: ResourceState,
}

impl TraceEvent {
    pub fn new(device: DeviceHandle, loc: TileLoc) -> Self {
        Self {
            device,
            loc,
            unit: None,
            bound: None,
            event: None,
            slot: None,
            channel: None,
            state: ResourceState::default(),
        }
    }

    /// Attach the event to the trace unit it will occupy a slot on.
    ///
    /// Can only be done once.
    pub fn initialize(&mut self, unit: SharedTraceUnit) -> Result<()> {
        if self.state.is_reserved() || self.unit.is_some() {
            error!("trace event {}: already initialized", self.loc);
            return Err(RscError::AlreadyReserved);
        }

        let (unit_module, sentinel) = {
            let u = unit.borrow();
            match (u.module(), u.sentinel()) {
                (Some(m), Some(s)) => (m, s),
                _ => return Err(RscError::NotInitialized),
            }
        };

        match self.device.topology().tile_kind(self.loc) {
            TileKind::Unsupported => {
                return Err(RscError::invalid(format!("tile {} is unsupported", self.loc)));
            }
            kind if kind.is_shim() != (unit_module == Module::Pl) => {
                error!(
                    "trace event {}: trace unit module {} mismatches {:?} tile",
                    self.loc, unit_module, kind
                );
                return Err(RscError::invalid(format!(
                    "{unit_module} trace unit does not fit a {kind:?} tile"
                )));
            }
            _ => {}
        }

        self.unit = Some(unit);
        self.bound = Some(UnitBinding {
            module: unit_module,
            sentinel,
        });
        self.state.set_initialized(true);
        Ok(())
    }

    /// Choose the event to trace.
    pub fn set_event(&mut self, module: Module, event: Event) -> Result<()> {
        if self.state.is_running() {
            error!("trace event {}: {} {} rejected, already in use", self.loc, module, event);
            return Err(RscError::Busy);
        }
        if let Err(e) = self
            .device
            .programmer()
            .logical_to_physical(self.loc, module, event)
        {
            error!("trace event {}: {} {} invalid event", self.loc, module, event);
            return Err(RscError::invalid(e.to_string()));
        }
        if let (true, Some((reserved_module, _))) = (self.state.is_reserved(), self.event) {
            if reserved_module != module {
                error!(
                    "trace event {}: reserved for {} module, cannot switch to {}",
                    self.loc, reserved_module, module
                );
                return Err(RscError::invalid(format!(
                    "event reserved for {reserved_module} module"
                )));
            }
        }
        self.event = Some((module, event));
        Ok(())
    }

    /// The committed (module, event).
    pub fn get_event(&self) -> Result<(Module, Event)> {
        self.event.ok_or_else(|| {
            error!("trace event {}: no event specified", self.loc);
            RscError::NotConfigured
        })
    }

    pub fn loc(&self) -> TileLoc {
        self.loc
    }

    /// Slot held on the unit while reserved.
    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    /// Whether the event needs a broadcast hop to reach its unit.
    pub fn is_cross_module(&self) -> bool {
        matches!((self.event, self.bound), (Some((m, _)), Some(b)) if m != b.module)
    }

    pub fn broadcast_channel(&self) -> Option<&BroadcastChannel> {
        self.channel.as_ref()
    }

    // ── internal helpers ──────────────────────────────────────────────

    fn unit(&self) -> Result<SharedTraceUnit> {
        self.unit.clone().ok_or(RscError::NotInitialized)
    }

    fn bound(&self) -> Result<UnitBinding> {
        self.bound.ok_or(RscError::NotInitialized)
    }

    fn held_slot(&self) -> Result<u8> {
        self.slot.ok_or(RscError::NotReady)
    }
}

impl Hooks for TraceEvent {
    fn lifecycle(&self) -> ResourceState {
        self.state
    }

    fn lifecycle_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    fn configured(&self) -> bool {
        self.event.is_some()
    }

    /// Slot first, then the broadcast channel.  A channel failure hands the
    /// slot back before returning.
    fn on_reserve(&mut self) -> Result<()> {
        if self.slot.is_some() || self.channel.is_some() {
            return Err(RscError::AlreadyReserved);
        }
        let (module, _) = self.event.ok_or(RscError::NotReady)?;
        let bound = self.bound()?;
        let unit = self.unit()?;
        debug!(
            "trace event {}: reserve, unit module {}, event module {}",
            self.loc, bound.module, module
        );

        if unit.borrow().module() != Some(bound.module) {
            return Err(RscError::invalid("trace unit module changed since initialize"));
        }

        let slot = unit.borrow_mut().reserve_slot().map_err(|e| {
            error!("trace event {}: no trace slot: {}", self.loc, e);
            e
        })?;

        if module != bound.module {
            match self.device.broadcast().acquire(self.loc, module, bound.module) {
                Ok(channel) => self.channel = Some(channel),
                Err(e) => {
                    error!("trace event {}: no broadcast channel: {}", self.loc, e);
                    if let Err(re) = unit.borrow_mut().release_slot(slot) {
                        warn!("trace event {}: rollback of slot {} failed: {}", self.loc, slot, re);
                    }
                    return Err(e.into());
                }
            }
        }
        self.slot = Some(slot);
        Ok(())
    }

    fn on_release(&mut self) -> Result<()> {
        let slot = self.held_slot()?;
        debug!("trace event {}: release slot {}", self.loc, slot);
        self.unit()?.borrow_mut().release_slot(slot)?;
        self.slot = None;
        if let Some(channel) = self.channel.take() {
            self.device.broadcast().release(channel);
        }
        Ok(())
    }

    /// Install the event (or its broadcast alias) into the slot.
    fn on_start(&mut self) -> Result<()> {
        let (_, event) = self.event.ok_or(RscError::NotReady)?;
        let slot = self.held_slot()?;
        debug!("trace event {}: start {} in slot {}", self.loc, event, slot);

        let traced = match &self.channel {
            Some(channel) => {
                let broadcast = self.device.broadcast();
                broadcast.program(channel, event)?;
                broadcast.surfaced_event(channel)?
            }
            None => event,
        };
        self.unit()?.borrow_mut().set_slot_event(slot, traced)
    }

    /// Best effort: both the slot reset and the channel stop are attempted;
    /// the first error is returned.
    fn on_stop(&mut self) -> Result<()> {
        let slot = self.held_slot()?;
        let sentinel = self.bound()?.sentinel;
        debug!("trace event {}: stop slot {}", self.loc, slot);

        let mut first_err = None;
        if let Err(e) = self.unit()?.borrow_mut().set_slot_event(slot, sentinel) {
            error!("trace event {}: slot {} reset failed: {}", self.loc, slot, e);
            first_err = Some(e);
        }
        if let Some(channel) = &self.channel {
            if let Err(e) = self.device.broadcast().stop(channel) {
                error!("trace event {}: broadcast stop failed: {}", self.loc, e);
                first_err.get_or_insert(e.into());
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Best-effort teardown: a reserved event hands its slot and channel back.
impl Drop for TraceEvent {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("trace event {}: stop on drop failed: {}", self.loc, e);
            }
        }
        if self.is_reserved() {
            if let Err(e) = self.release() {
                warn!("trace event {}: release on drop failed: {}", self.loc, e);
            }
        }
    }
}
