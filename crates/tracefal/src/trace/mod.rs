//! Trace resources: unit, event and session.

pub mod event;
pub mod session;
pub mod unit;

use std::cell::RefCell;
use std::rc::Rc;

pub use event::TraceEvent;
pub use session::TraceSession;
pub use unit::TraceUnit;

/// A trace unit shared between its session and the events occupying it.
pub type SharedTraceUnit = Rc<RefCell<TraceUnit>>;
