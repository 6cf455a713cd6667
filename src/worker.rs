//! The per-worker context: reactor, connection pool, timer structure,
//! posted-event queues, cached clock. Every handler in the crate is a
//! method on `Worker` receiving ids, never pointers; one worker never
//! touches another's state.

use std::sync::atomic::Ordering;
use std::time::Duration;

use mio::Interest;

use crate::conn::ConnectionPool;
use crate::error::Result;
use crate::event::accept_mutex::SharedCounters;
use crate::event::reactor::{Reactor, ReadyEvent, TokenTarget};
use crate::event::timer::TimerTree;
use crate::event::{ConnHandler, EvId, EvKind, Event};
use crate::http::request::ReqHandler;
use crate::listener::WorkerListener;
use crate::prelude::*;
use crate::runtime::Runtime;
use crate::time::Clock;

/// Identity of a request: connection pool slot plus request-arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rid {
    pub conn: usize,
    pub req: usize,
}

impl Rid {
    pub fn new(conn: usize, req: usize) -> Rid {
        Rid { conn, req }
    }
}

pub struct Worker {
    pub id: usize,
    pub rt: Arc<Runtime>,
    pub reactor: Reactor,
    pub conns: ConnectionPool,
    pub timers: TimerTree,
    pub clock: Clock,

    listeners: Vec<WorkerListener>,
    posted: VecDeque<EvId>,
    posted_accept: VecDeque<usize>,
    /// The soft load-balancing counter: positive means "too busy to
    /// contend for the accept mutex".
    pub accept_disabled: i64,
    mutex_held: bool,
    ready_scratch: Vec<ReadyEvent>,
}

impl Worker {
    pub fn new(rt: Arc<Runtime>, id: usize) -> Result<Worker> {
        let capacity = rt.events.worker_connections;
        let reactor = Reactor::new(capacity)?;
        let listeners = rt
            .listeners
            .iter()
            .map(|listener| listener.bound.worker_instance())
            .collect::<Result<Vec<_>>>()?;

        let mut worker = Worker {
            id,
            reactor,
            conns: ConnectionPool::new(capacity),
            timers: TimerTree::new(),
            clock: Clock::new(),
            listeners,
            posted: VecDeque::new(),
            posted_accept: VecDeque::new(),
            accept_disabled: 0,
            mutex_held: false,
            ready_scratch: Vec::new(),
            rt,
        };
        if !worker.use_accept_mutex() {
            // Without the mutex every worker keeps its listeners
            // registered permanently.
            worker.enable_accept_events()?;
        }
        Ok(worker)
    }

    fn use_accept_mutex(&self) -> bool {
        self.rt.events.accept_mutex && self.rt.accept_mutex_enabled
    }

    pub fn run(&mut self) -> Result<()> {
        info!(worker = self.id, "worker started");
        while !self.rt.stopping() {
            self.process_events_and_timers()?;
        }
        if self.mutex_held {
            self.rt.accept_mutex.unlock();
        }
        info!(worker = self.id, "worker exiting");
        Ok(())
    }

    /// One iteration of the worker loop: poll, dispatch or post, drain
    /// the accept queue, expire timers, drain the posted queue.
    pub fn process_events_and_timers(&mut self) -> Result<()> {
        let mut timeout_ms = self
            .timers
            .min_deadline()
            .map(|deadline| deadline.saturating_sub(self.clock.now_ms))
            // Bounded so the stop flag is noticed promptly.
            .map_or(500, |t| t.min(500));

        let mut post_events = false;
        if self.use_accept_mutex() {
            if self.accept_disabled > 0 {
                // Overloaded: sit out this round instead of contending.
                self.accept_disabled -= 1;
            } else if self.rt.accept_mutex.try_lock() {
                if !self.mutex_held {
                    self.enable_accept_events()?;
                    self.mutex_held = true;
                }
                post_events = true;
            } else {
                if self.mutex_held {
                    self.disable_accept_events()?;
                    self.mutex_held = false;
                }
                timeout_ms = timeout_ms.min(self.rt.events.accept_mutex_delay_ms.max(1));
            }
        }

        let mut ready = std::mem::take(&mut self.ready_scratch);
        self.reactor
            .poll(Some(Duration::from_millis(timeout_ms)), &mut ready)?;
        self.clock.update();

        for event in &ready {
            match event.target {
                TokenTarget::Listener(index) => {
                    if post_events {
                        if !self.posted_accept.contains(&index) {
                            self.posted_accept.push_back(index);
                        }
                    } else {
                        self.accept(index);
                    }
                }
                TokenTarget::Conn { slot, instance } => {
                    let (read_ready, write_ready) = {
                        let Some(conn) = self.conns.get_mut(slot) else {
                            trace!(slot, "stale event on closed connection");
                            continue;
                        };
                        if conn.instance != instance {
                            // The slot was reissued between poll and
                            // dispatch; the report belongs to the dead
                            // occupant.
                            trace!(slot, "stale event, instance mismatch");
                            continue;
                        }
                        let read_ready = event.readable || event.read_closed || event.error;
                        let write_ready = event.writable || event.error;
                        if read_ready {
                            conn.read.ready = true;
                            if event.read_closed {
                                conn.read.eof = true;
                            }
                            if event.error {
                                conn.read.error = true;
                            }
                        }
                        if write_ready {
                            conn.write.ready = true;
                        }
                        (read_ready, write_ready)
                    };

                    if post_events {
                        if read_ready {
                            self.post_event(EvId::read(slot));
                        }
                        if write_ready {
                            self.post_event(EvId::write(slot));
                        }
                    } else {
                        if read_ready {
                            self.dispatch(EvId::read(slot));
                        }
                        if write_ready {
                            self.dispatch(EvId::write(slot));
                        }
                    }
                }
            }
        }
        self.ready_scratch = ready;

        // New connections first, then release the mutex so siblings can
        // accept while this worker does protocol work.
        while let Some(index) = self.posted_accept.pop_front() {
            self.accept(index);
        }
        if self.mutex_held {
            self.rt.accept_mutex.unlock();
        }

        for id in self.timers.expire(self.clock.now_ms) {
            if let Some(event) = self.event_mut(id) {
                event.timer_set = false;
                event.timed_out = true;
            }
            self.dispatch(id);
        }

        while let Some(id) = self.posted.pop_front() {
            if let Some(event) = self.event_mut(id) {
                event.posted = false;
            }
            self.dispatch(id);
        }
        Ok(())
    }

    fn post_event(&mut self, id: EvId) {
        let fresh = match self.event_mut(id) {
            Some(event) if !event.posted => {
                event.posted = true;
                true
            }
            _ => false,
        };
        if fresh {
            self.posted.push_back(id);
        }
    }

    fn enable_accept_events(&mut self) -> Result<()> {
        for (index, listener) in self.listeners.iter_mut().enumerate() {
            self.reactor.register_listener(listener, index)?;
        }
        Ok(())
    }

    fn disable_accept_events(&mut self) -> Result<()> {
        for listener in self.listeners.iter_mut() {
            self.reactor.deregister(listener)?;
        }
        Ok(())
    }

    /// Drain the listener's backlog up to the multi-accept bound.
    fn accept(&mut self, index: usize) {
        let multi_accept = self.rt.events.multi_accept;
        loop {
            let stream = match self.listeners[index].accept() {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) => {
                    error!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            };
            self.rt.counters.accepted.fetch_add(1, Ordering::Relaxed);

            let Some(slot) = self.grab_connection() else {
                warn!(worker = self.id, "connection pool exhausted, dropping accept");
                break;
            };
            self.rt.counters.handled.fetch_add(1, Ordering::Relaxed);
            SharedCounters::incr(&self.rt.counters.active);

            {
                let conn = &mut self.conns.slots[slot];
                conn.occupy(stream, index);
                conn.read.handler = ConnHandler::WaitRequest;
                conn.write.handler = ConnHandler::Empty;
            }
            // Worker-load feedback for the accept mutex: positive once
            // 7/8 of the pool is busy.
            self.accept_disabled =
                self.conns.in_use() as i64 - (self.conns.capacity() * 7 / 8) as i64;

            if let Err(e) = self.register_connection(slot) {
                error!(error = %e, "failed to register accepted connection");
                self.close_connection(slot);
                continue;
            }
            debug!(worker = self.id, slot, peer = %self.conns.slots[slot].peer, "accepted");
            self.init_http_connection(slot);

            if !multi_accept {
                break;
            }
        }
    }

    /// A pool slot, reclaiming the oldest idle keepalive connection when
    /// the free list is empty.
    fn grab_connection(&mut self) -> Option<usize> {
        if let Some(slot) = self.conns.acquire() {
            return Some(slot);
        }
        let oldest = self.conns.oldest_reusable()?;
        debug!(slot = oldest, "reclaiming idle connection for a new client");
        self.close_connection(oldest);
        self.conns.acquire()
    }

    fn register_connection(&mut self, slot: usize) -> std::io::Result<()> {
        let conn = &mut self.conns.slots[slot];
        let instance = conn.instance;
        conn.read.active = true;
        conn.write.active = false;
        let Some(stream) = conn.stream.as_mut() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        self.reactor
            .register_conn(stream, slot, instance, Interest::READABLE)
    }

    /// Reflect the event records' `active` bits in the readiness source.
    pub fn apply_interest(&mut self, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let interest = if conn.write.active {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let instance = conn.instance;
        if let Some(stream) = conn.stream.as_mut() {
            if let Err(e) = self
                .reactor
                .reregister_conn(stream, slot, instance, interest)
            {
                error!(slot, error = %e, "reregister failed");
            }
        }
    }

    pub fn want_write(&mut self, slot: usize, on: bool) {
        let changed = {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            let changed = conn.write.active != on;
            conn.write.active = on;
            changed
        };
        if changed {
            self.apply_interest(slot);
        }
    }

    /// Dispatch one event to its connection-level handler, then drain the
    /// posted-request queue the handler may have filled.
    pub fn dispatch(&mut self, id: EvId) {
        let handler = {
            let Some(conn) = self.conns.get(id.slot) else {
                return;
            };
            match id.kind {
                EvKind::Read => conn.read.handler,
                EvKind::Write => conn.write.handler,
            }
        };
        match handler {
            ConnHandler::None | ConnHandler::Empty => {}
            ConnHandler::WaitRequest => self.wait_request_handler(id.slot),
            ConnHandler::ProcessRequestLine => self.process_request_line_handler(id.slot),
            ConnHandler::ProcessHeaders => self.process_headers_handler(id.slot),
            ConnHandler::RequestDispatch => self.request_dispatch(id.slot, id.kind),
            ConnHandler::Keepalive => self.keepalive_handler(id.slot),
            ConnHandler::LingeringClose => self.lingering_close_handler(id.slot),
        }
        self.run_posted_requests(id.slot);
    }

    /// The generic per-request dispatcher: write readiness drives the
    /// request's write handler, read readiness its read handler.
    fn request_dispatch(&mut self, slot: usize, kind: EvKind) {
        let Some(active) = self
            .conns
            .get(slot)
            .and_then(|c| c.http.as_ref())
            .and_then(|h| h.active)
        else {
            return;
        };
        let rid = Rid::new(slot, active);
        match kind {
            EvKind::Write => self.run_request_write_handler(rid),
            EvKind::Read => self.run_request_read_handler(rid),
        }
    }

    pub fn run_request_write_handler(&mut self, rid: Rid) {
        let Some(handler) = self.req(rid).map(|r| r.write_handler) else {
            return;
        };
        self.run_req_handler(rid, handler);
    }

    pub fn run_request_read_handler(&mut self, rid: Rid) {
        let Some(handler) = self.req(rid).map(|r| r.read_handler) else {
            return;
        };
        self.run_req_handler(rid, handler);
    }

    fn run_req_handler(&mut self, rid: Rid, handler: ReqHandler) {
        match handler {
            ReqHandler::Empty => {}
            ReqHandler::BlockReading => self.block_reading(rid),
            ReqHandler::RunPhases => self.run_phases(rid),
            ReqHandler::Writer => self.writer(rid),
            ReqHandler::ReadBody => self.read_body_handler(rid),
            ReqHandler::DiscardBody => self.discard_body_handler(rid),
        }
    }

    /// FIFO drain of subrequests scheduled while the last handler ran.
    pub fn run_posted_requests(&mut self, slot: usize) {
        loop {
            let next = {
                let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
                    return;
                };
                let Some(current) = http.current else {
                    return;
                };
                let main = match http.request(current) {
                    Some(request) => request.main,
                    None => return,
                };
                http.request_mut(main)
                    .and_then(|request| request.posted_requests.pop_front())
            };
            match next {
                Some(req) => self.run_request_write_handler(Rid::new(slot, req)),
                None => return,
            }
        }
    }

    /// Queue a request for execution at the next drain point.
    pub fn post_request(&mut self, rid: Rid) {
        let Some(http) = self.conns.get_mut(rid.conn).and_then(|c| c.http.as_mut()) else {
            return;
        };
        let Some(main) = http.request(rid.req).map(|r| r.main) else {
            return;
        };
        if let Some(main_request) = http.request_mut(main) {
            if !main_request.posted_requests.contains(&rid.req) {
                main_request.posted_requests.push_back(rid.req);
            }
        }
    }

    // Accessors used across the http modules.

    pub fn req(&self, rid: Rid) -> Option<&crate::http::request::Request> {
        self.conns
            .get(rid.conn)
            .and_then(|c| c.http.as_ref())
            .and_then(|h| h.request(rid.req))
    }

    pub fn req_mut(&mut self, rid: Rid) -> Option<&mut crate::http::request::Request> {
        self.conns
            .get_mut(rid.conn)
            .and_then(|c| c.http.as_mut())
            .and_then(|h| h.request_mut(rid.req))
    }

    pub fn conn_peer(&self, slot: usize) -> String {
        self.conns
            .get(slot)
            .map(|c| c.peer.clone())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn event_mut(&mut self, id: EvId) -> Option<&mut Event> {
        let conn = self.conns.get_mut(id.slot)?;
        Some(match id.kind {
            EvKind::Read => &mut conn.read,
            EvKind::Write => &mut conn.write,
        })
    }

    /// Arm (or re-arm) the timer for an event.
    pub fn set_timer(&mut self, id: EvId, after_ms: u64) {
        let now = self.clock.now_ms;
        let (old, new) = {
            let Some(event) = self.event_mut(id) else {
                return;
            };
            let old = event.timer_set.then_some(event.deadline);
            event.deadline = now + after_ms;
            event.timer_set = true;
            event.timed_out = false;
            (old, event.deadline)
        };
        if let Some(old) = old {
            self.timers.remove(old, id);
        }
        self.timers.insert(new, id);
    }

    pub fn clear_timer(&mut self, id: EvId) {
        let deadline = {
            let Some(event) = self.event_mut(id) else {
                return;
            };
            if !event.timer_set {
                return;
            }
            event.timer_set = false;
            event.deadline
        };
        self.timers.remove(deadline, id);
    }
}
