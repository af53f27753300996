//! JSON trace plans and session reports.
//!
//! A [`TracePlan`] describes one session: the tile, an optional module
//! override, the start/stop events, the mode and packet routing, and the
//! events to trace.  It can also carry the [`SimConfig`] of the array it was
//! written for.  After running a session, [`SessionReport`] captures what
//! ended up in each slot.
//!
//! ```json
//! {
//!   "tile": { "col": 1, "row": 3 },
//!   "start_event": 1,
//!   "stop_event": 2,
//!   "events": [
//!     { "module": "core", "event": 12 },
//!     { "module": "memory", "event": 1020 }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::device::{DeviceHandle, Event, Module, Packet, TileLoc, TraceMode};
use crate::devices::sim::SimConfig;
use crate::error::{Result, RscError};
use crate::lifecycle::Resource;
use crate::trace::TraceSession;

/// Errors from loading plans or saving reports.
#[derive(Debug, Snafu)]
pub enum PlanError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
}

/// One event to trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEvent {
    pub module: Module,
    pub event: Event,
}

/// Serializable description of a trace session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePlan {
    pub tile: TileLoc,
    /// Unit module; defaults to the tile kind's module.
    #[serde(default)]
    pub module: Option<Module>,
    #[serde(default)]
    pub start_event: Option<Event>,
    /// Defaults to the module's "none" event.
    #[serde(default)]
    pub stop_event: Option<Event>,
    #[serde(default)]
    pub mode: TraceMode,
    #[serde(default)]
    pub packet: Option<Packet>,
    #[serde(default)]
    pub events: Vec<PlannedEvent>,
    /// Array the plan targets when run on the simulator.
    #[serde(default)]
    pub device: SimConfig,
}

impl TracePlan {
    pub fn from_json(json: &str) -> std::result::Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a plan from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, PlanError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Build an unreserved session on `device` with every setting and
    /// event of the plan applied.
    pub fn build(&self, device: DeviceHandle) -> Result<TraceSession> {
        let mut session = match self.module {
            Some(module) => TraceSession::with_module(device, self.tile, module),
            None => TraceSession::new(device, self.tile),
        };
        if !session.is_initialized() {
            return Err(RscError::invalid(format!(
                "no trace unit for tile {} ({:?})",
                self.tile, self.module
            )));
        }

        session.set_mode(self.mode)?;
        if let Some(packet) = self.packet {
            session.set_packet_routing(packet)?;
        }
        if let Some(start) = self.start_event {
            let stop = match self.stop_event {
                Some(stop) => stop,
                None => session.unit().sentinel().ok_or(RscError::NotInitialized)?,
            };
            session.set_start_stop_event(start, stop)?;
        }
        for planned in &self.events {
            session.add_event(planned.module, planned.event)?;
        }
        debug!(
            "plan: built session at {} with {} events",
            self.tile,
            session.event_count()
        );
        Ok(session)
    }

    /// Build, reserve and start a session.
    pub fn run(&self, device: DeviceHandle) -> Result<TraceSession> {
        let mut session = self.build(device)?;
        session.reserve()?;
        session.start()?;
        info!(
            "plan: tracing {} events at {}, {} slots free",
            session.event_count(),
            self.tile,
            session.available_slots()
        );
        Ok(session)
    }
}

/// Contents of one reserved slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub slot: u8,
    /// Logical event recorded in the slot.
    pub event: Event,
    /// Encoded id, if the event is encodable for the unit's module.
    pub hw_event: Option<u8>,
    /// The traced event occupying the slot.
    pub source: Option<PlannedEvent>,
    /// Broadcast channel relaying `source`, if any.
    pub broadcast_channel: Option<u8>,
}

/// Snapshot of a session after it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub tile: TileLoc,
    pub module: Option<Module>,
    pub reserved: bool,
    pub running: bool,
    pub start_event: Event,
    pub stop_event: Event,
    pub mode: TraceMode,
    pub available_slots: u32,
    pub slots: Vec<SlotReport>,
}

impl SessionReport {
    pub fn capture(session: &TraceSession, device: &DeviceHandle) -> Self {
        let unit = session.unit();
        let slots = unit
            .reserved_slots()
            .map(|slot| {
                let event = unit.slot_event(slot).unwrap_or_default();
                let hw_event = unit.module().and_then(|module| {
                    device
                        .programmer()
                        .logical_to_physical(unit.loc(), module, event)
                        .ok()
                });
                let holder = session
                    .trace_events()
                    .iter()
                    .find(|ev| ev.slot() == Some(slot));
                SlotReport {
                    slot,
                    event,
                    hw_event,
                    source: holder
                        .and_then(|ev| ev.get_event().ok())
                        .map(|(module, event)| PlannedEvent { module, event }),
                    broadcast_channel: holder
                        .and_then(|ev| ev.broadcast_channel())
                        .map(|ch| ch.id()),
                }
            })
            .collect();

        Self {
            tile: session.loc(),
            module: unit.module(),
            reserved: session.is_reserved(),
            running: session.is_running(),
            start_event: unit.start_event(),
            stop_event: unit.stop_event(),
            mode: unit.mode(),
            available_slots: unit.available_slots(),
            slots,
        }
    }

    /// Write the report as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), PlanError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::devices::sim::SimDevice;

    const PLAN: &str = r#"{
        "tile": { "col": 1, "row": 3 },
        "start_event": 1,
        "stop_event": 2,
        "mode": "event-pc",
        "packet": { "id": 3, "packet_type": 0 },
        "events": [
            { "module": "core", "event": 12 },
            { "module": "memory", "event": 1020 }
        ]
    }"#;

    fn device_for(plan: &TracePlan) -> (Rc<SimDevice>, DeviceHandle) {
        let sim = Rc::new(SimDevice::new(plan.device.clone()));
        let device = DeviceHandle::from_backend(sim.clone());
        (sim, device)
    }

    #[test]
    fn parse_plan_with_defaults() {
        let plan = TracePlan::from_json(r#"{ "tile": { "col": 0, "row": 0 } }"#).unwrap();
        assert_eq!(plan.module, None);
        assert_eq!(plan.mode, TraceMode::EventTime);
        assert!(plan.events.is_empty());
        assert_eq!(plan.device, SimConfig::default());
    }

    #[test]
    fn malformed_plan_is_json_error() {
        let err = TracePlan::from_json(r#"{ "tile": 7 }"#).unwrap_err();
        assert!(matches!(err, PlanError::Json { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        fs::write(&path, PLAN).unwrap();

        let plan = TracePlan::load(&path).unwrap();
        assert_eq!(plan.tile, TileLoc::new(1, 3));
        assert_eq!(plan.events.len(), 2);
        assert_eq!(plan.mode, TraceMode::EventPc);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TracePlan::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, PlanError::Io { .. }));
    }

    #[test]
    fn build_applies_every_setting() {
        let plan = TracePlan::from_json(PLAN).unwrap();
        let (_sim, device) = device_for(&plan);
        let session = plan.build(device).unwrap();

        assert!(!session.is_reserved());
        assert_eq!(session.event_count(), 2);
        let unit = session.unit();
        assert_eq!(unit.start_event(), Event(1));
        assert_eq!(unit.stop_event(), Event(2));
        assert_eq!(unit.mode(), TraceMode::EventPc);
        assert_eq!(unit.packet(), Packet { id: 3, packet_type: 0 });
    }

    #[test]
    fn build_rejects_unsupported_tile() {
        let plan = TracePlan::from_json(r#"{ "tile": { "col": 9, "row": 9 } }"#).unwrap();
        let (_sim, device) = device_for(&plan);
        assert!(matches!(plan.build(device), Err(RscError::InvalidArgument(_))));
    }

    #[test]
    fn stop_event_defaults_to_none_event() {
        let plan = TracePlan::from_json(
            r#"{ "tile": { "col": 1, "row": 3 }, "module": "memory", "start_event": 1001 }"#,
        )
        .unwrap();
        let (_sim, device) = device_for(&plan);
        let session = plan.build(device).unwrap();
        assert_eq!(session.unit().stop_event(), Event(1000));
    }

    #[test]
    fn run_and_report() {
        let plan = TracePlan::from_json(PLAN).unwrap();
        let (sim, device) = device_for(&plan);
        let session = plan.run(device.clone()).unwrap();
        let report = SessionReport::capture(&session, &device);

        assert!(report.running && report.reserved);
        assert_eq!(report.available_slots, 6);
        assert_eq!(report.slots.len(), 2);
        assert_eq!(report.slots[0].hw_event, Some(12));
        assert_eq!(report.slots[0].broadcast_channel, None);
        assert_eq!(
            report.slots[1].source,
            Some(PlannedEvent {
                module: Module::Memory,
                event: Event(1020)
            })
        );
        assert_eq!(report.slots[1].hw_event, Some(107));
        assert_eq!(report.slots[1].broadcast_channel, Some(0));
        assert_eq!(sim.trace_regs(TileLoc::new(1, 3), Module::Core).slots[..2], [12, 107]);
    }

    #[test]
    fn report_round_trips_to_disk() {
        let plan = TracePlan::from_json(PLAN).unwrap();
        let (_sim, device) = device_for(&plan);
        let session = plan.run(device.clone()).unwrap();
        let report = SessionReport::capture(&session, &device);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.save(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["module"], "core");
        assert_eq!(json["slots"][1]["event"], 107);
        assert_eq!(json["slots"][1]["source"]["module"], "memory");
    }
}
