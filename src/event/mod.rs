pub mod accept_mutex;
pub mod reactor;
pub mod timer;

/// Which half of a connection an event record schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvKind {
    Read,
    Write,
}

/// Identity of an event for the timer structure and the posted queues:
/// connection slot plus read/write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EvId {
    pub slot: usize,
    pub kind: EvKind,
}

impl EvId {
    pub fn read(slot: usize) -> EvId {
        EvId {
            slot,
            kind: EvKind::Read,
        }
    }

    pub fn write(slot: usize) -> EvId {
        EvId {
            slot,
            kind: EvKind::Write,
        }
    }
}

/// Connection-level handler the worker dispatches an event to. The
/// `RequestDispatch` variant defers to the active request's own
/// read/write handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnHandler {
    #[default]
    None,
    /// First bytes after accept; allocates the request.
    WaitRequest,
    ProcessRequestLine,
    ProcessHeaders,
    /// Generic per-request dispatcher.
    RequestDispatch,
    Keepalive,
    LingeringClose,
    /// Swallow the event.
    Empty,
}

/// A scheduling record, one per connection side. The reactor reports
/// readiness into `ready`; handlers drain it. `timed_out` is set by timer
/// expiry and must be consumed by the handler.
#[derive(Debug, Default)]
pub struct Event {
    pub handler: ConnHandler,
    pub active: bool,
    pub ready: bool,
    pub timed_out: bool,
    pub timer_set: bool,
    pub posted: bool,
    pub eof: bool,
    pub error: bool,
    /// Deadline in worker-clock milliseconds, valid while `timer_set`.
    pub deadline: u64,
}

impl Event {
    pub fn reset(&mut self) {
        *self = Event::default();
    }
}
