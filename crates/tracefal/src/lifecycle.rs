//! Resource lifecycle shared by every trace resource.
//!
//! ```text
//!              reserve            start
//!  Initialized ───────→ Reserved ──────→ Running
//!       ↑                  │  ↑            │
//!       └──── release ─────┘  └─── stop ───┘
//! ```
//!
//! [`Resource`] is the public face: the four transitions plus state
//! queries.  Each resource kind supplies its per-transition work through
//! the crate-private [`Hooks`] trait, and a blanket impl runs the
//! state-order checks before calling into it.  Hooks are therefore only
//! reachable behind those checks.  Configured is never stored: each
//! resource derives it from its own fields.

use crate::error::{Result, RscError};

/// Lifecycle flags of a resource.
///
/// Invariant: `running` implies `reserved`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceState {
    initialized: bool,
    reserved: bool,
    running: bool,
}

impl ResourceState {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub(crate) fn set_reserved(&mut self, reserved: bool) {
        debug_assert!(reserved || !self.running, "cannot unreserve a running resource");
        self.reserved = reserved;
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        debug_assert!(!running || self.reserved, "running requires reserved");
        self.running = running;
    }
}

mod sealed {
    use super::ResourceState;
    use crate::error::Result;

    /// Per-kind transition work.  Only called by [`super::Resource`] once
    /// the transition has been checked against the current state.
    pub trait Hooks {
        fn lifecycle(&self) -> ResourceState;

        fn lifecycle_mut(&mut self) -> &mut ResourceState;

        /// Derived: whether the current configuration is worth starting.
        fn configured(&self) -> bool;

        fn on_reserve(&mut self) -> Result<()>;

        fn on_release(&mut self) -> Result<()>;

        fn on_start(&mut self) -> Result<()>;

        fn on_stop(&mut self) -> Result<()>;
    }
}

pub(crate) use sealed::Hooks;

/// The reserve → start → stop → release contract.
///
/// Implemented for every trace resource in this crate; the hooks behind
/// it cannot be called or implemented from outside.
///
/// ```compile_fail
/// use std::rc::Rc;
/// use tracefal::devices::sim::{SimConfig, SimDevice};
/// use tracefal::{DeviceHandle, Resource, TileLoc, TraceUnit};
///
/// let device = DeviceHandle::from_backend(Rc::new(SimDevice::new(SimConfig::default())));
/// let mut unit = TraceUnit::new(device, TileLoc::new(1, 3));
/// unit.on_reserve().unwrap();
/// ```
pub trait Resource {
    fn state(&self) -> ResourceState;

    /// Derived: whether the current configuration is worth starting.
    fn is_configured(&self) -> bool;

    fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    fn is_reserved(&self) -> bool {
        self.state().is_reserved()
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Claim the resource.  A failed hook leaves the state untouched.
    fn reserve(&mut self) -> Result<()>;

    /// Program the hardware and mark the resource running.
    fn start(&mut self) -> Result<()>;

    /// Stop the resource.  Running is cleared even when the hook fails;
    /// the hook's error is still returned.
    fn stop(&mut self) -> Result<()>;

    /// Give the resource back.  Releasing an unreserved resource is a no-op.
    fn release(&mut self) -> Result<()>;
}

impl<T: Hooks> Resource for T {
    fn state(&self) -> ResourceState {
        self.lifecycle()
    }

    fn is_configured(&self) -> bool {
        self.configured()
    }

    fn reserve(&mut self) -> Result<()> {
        let state = self.lifecycle();
        if !state.is_initialized() {
            return Err(RscError::NotInitialized);
        }
        if state.is_reserved() {
            return Err(RscError::AlreadyReserved);
        }
        self.on_reserve()?;
        self.lifecycle_mut().set_reserved(true);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let state = self.lifecycle();
        if state.is_running() {
            return Err(RscError::Busy);
        }
        if !state.is_reserved() || !self.configured() {
            return Err(RscError::NotReady);
        }
        self.on_start()?;
        self.lifecycle_mut().set_running(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.lifecycle().is_running() {
            return Err(RscError::NotRunning);
        }
        let result = self.on_stop();
        self.lifecycle_mut().set_running(false);
        result
    }

    fn release(&mut self) -> Result<()> {
        let state = self.lifecycle();
        if state.is_running() {
            return Err(RscError::Busy);
        }
        if !state.is_reserved() {
            return Ok(());
        }
        self.on_release()?;
        self.lifecycle_mut().set_reserved(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resource whose hooks count calls and fail on demand.
    #[derive(Default)]
    struct Recorder {
        state: ResourceState,
        configured: bool,
        fail_next: bool,
        calls: Vec<&'static str>,
    }

    impl Recorder {
        fn ready() -> Self {
            let mut rec = Recorder {
                configured: true,
                ..Default::default()
            };
            rec.state.set_initialized(true);
            rec
        }

        fn hook(&mut self, name: &'static str) -> Result<()> {
            self.calls.push(name);
            if std::mem::take(&mut self.fail_next) {
                Err(RscError::invalid(name))
            } else {
                Ok(())
            }
        }
    }

    impl Hooks for Recorder {
        fn lifecycle(&self) -> ResourceState {
            self.state
        }
        fn lifecycle_mut(&mut self) -> &mut ResourceState {
            &mut self.state
        }
        fn configured(&self) -> bool {
            self.configured
        }
        fn on_reserve(&mut self) -> Result<()> {
            self.hook("reserve")
        }
        fn on_release(&mut self) -> Result<()> {
            self.hook("release")
        }
        fn on_start(&mut self) -> Result<()> {
            self.hook("start")
        }
        fn on_stop(&mut self) -> Result<()> {
            self.hook("stop")
        }
    }

    #[test]
    fn full_cycle() {
        let mut p = Recorder::ready();
        p.reserve().unwrap();
        p.start().unwrap();
        assert!(p.is_running() && p.is_reserved());
        p.stop().unwrap();
        assert!(!p.is_running() && p.is_reserved());
        p.release().unwrap();
        assert!(!p.is_reserved());
        assert_eq!(p.calls, vec!["reserve", "start", "stop", "release"]);
    }

    #[test]
    fn reserve_requires_initialized() {
        let mut p = Recorder::default();
        assert_eq!(p.reserve(), Err(RscError::NotInitialized));
        assert!(p.calls.is_empty());
    }

    #[test]
    fn double_reserve_rejected() {
        let mut p = Recorder::ready();
        p.reserve().unwrap();
        assert_eq!(p.reserve(), Err(RscError::AlreadyReserved));
        assert_eq!(p.calls, vec!["reserve"]);
    }

    #[test]
    fn failed_reserve_hook_leaves_unreserved() {
        let mut p = Recorder::ready();
        p.fail_next = true;
        assert!(p.reserve().is_err());
        assert!(!p.is_reserved());
    }

    #[test]
    fn start_requires_reserved_and_configured() {
        let mut p = Recorder::ready();
        assert_eq!(p.start(), Err(RscError::NotReady));

        p.reserve().unwrap();
        p.configured = false;
        assert_eq!(p.start(), Err(RscError::NotReady));

        p.configured = true;
        p.start().unwrap();
        assert_eq!(p.start(), Err(RscError::Busy));
    }

    #[test]
    fn stop_clears_running_even_on_failure() {
        let mut p = Recorder::ready();
        p.reserve().unwrap();
        p.start().unwrap();
        p.fail_next = true;
        assert!(p.stop().is_err());
        assert!(!p.is_running());
        assert_eq!(p.stop(), Err(RscError::NotRunning));
    }

    #[test]
    fn release_while_running_is_busy() {
        let mut p = Recorder::ready();
        p.reserve().unwrap();
        p.start().unwrap();
        assert_eq!(p.release(), Err(RscError::Busy));
        assert!(p.is_reserved());
    }

    #[test]
    fn release_of_unreserved_is_noop() {
        let mut p = Recorder::ready();
        p.release().unwrap();
        assert!(p.calls.is_empty());
    }

    #[test]
    fn failed_release_hook_keeps_reservation() {
        let mut p = Recorder::ready();
        p.reserve().unwrap();
        p.fail_next = true;
        assert!(p.release().is_err());
        assert!(p.is_reserved());
    }
}
