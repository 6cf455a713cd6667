//! The request lifecycle: connection initialization, request-line and
//! header reading (with large-buffer migration), the generic dispatcher
//! states, finalization with the count discipline, keepalive and
//! lingering close.

use std::io::Read;
use std::sync::atomic::Ordering;

use crate::event::accept_mutex::SharedCounters;
use crate::event::{ConnHandler, EvId};
use crate::http::headers::ConnectionPolicy;
use crate::http::parse::{normalize_uri, uri_extension, HeaderStatus, ParseStatus};
use crate::http::request::{HeaderRoom, HttpState, Postponed, ReqHandler, Request};
use crate::http::{Method, Version};
use crate::prelude::*;

/// Finalization verdicts, the request-side counterpart of the phase
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fin {
    /// The handler is done producing; flush whatever is pending.
    Ok,
    /// Output is buffered downstream; become a writer.
    Again,
    /// Somebody else finished the request already.
    Done,
    /// Produce the special response for this status (or redirect to its
    /// error page).
    Status(u16),
    /// Unrecoverable; tear the connection down.
    Error,
}

impl Worker {
    /// Fresh connection from the accept loop: wait for the first bytes
    /// before allocating any request state.
    pub fn init_http_connection(&mut self, slot: usize) {
        let timeout = self.rt.http.client_header_timeout_ms;
        self.set_timer(EvId::read(slot), timeout);
        SharedCounters::incr(&self.rt.counters.waiting);
        // Deferred-accept listeners hand over connections that are
        // already readable.
        if self.conns.get(slot).map(|c| c.read.ready).unwrap_or(false) {
            self.wait_request_handler(slot);
        }
    }

    pub fn wait_request_handler(&mut self, slot: usize) {
        let timed_out = self
            .conns
            .get(slot)
            .map(|c| c.read.timed_out)
            .unwrap_or(false);
        if timed_out {
            debug!(slot, "client timed out before sending a request");
            SharedCounters::decr(&self.rt.counters.waiting);
            self.close_connection(slot);
            return;
        }
        if self.conns.get(slot).and_then(|c| c.http.as_ref()).is_none() {
            let http = HttpState::new(&self.rt.http);
            if let Some(conn) = self.conns.get_mut(slot) {
                conn.http = Some(http);
            }
        }

        match self.fill_header_buffer(slot) {
            FillOutcome::Data => {
                SharedCounters::decr(&self.rt.counters.waiting);
                self.start_request(slot);
            }
            FillOutcome::WouldBlock => {}
            FillOutcome::Closed => {
                SharedCounters::decr(&self.rt.counters.waiting);
                debug!(slot, "client closed connection before first request");
                self.close_connection(slot);
            }
            FillOutcome::NoRoom => unreachable!("fresh header buffer cannot be full"),
        }
    }

    /// Allocate the request object and enter request-line parsing.
    pub fn start_request(&mut self, slot: usize) {
        let rt = Arc::clone(&self.rt);
        let now_ms = self.clock.now_ms;
        let srv = {
            let Some(conn) = self.conns.get(slot) else {
                return;
            };
            let default = rt.listeners[conn.listener].vhosts.default_server();
            Arc::clone(&rt.servers[default])
        };

        let underscores = rt.http.underscores_in_headers;
        let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
            return;
        };
        http.req_start = http.parsed;
        let req_start = http.req_start;
        let req = http.alloc_request(|req_slot| {
            Request::new(req_slot, slot, srv, &rt.http, now_ms, underscores)
        });
        http.current = Some(req);
        http.active = Some(req);
        if let Some(request) = http.request_mut(req) {
            request.line_parser.request_start = req_start;
            request.counted_reading = true;
        }

        if let Some(conn) = self.conns.get_mut(slot) {
            conn.read.handler = ConnHandler::ProcessRequestLine;
            conn.write.handler = ConnHandler::Empty;
        }
        SharedCounters::incr(&self.rt.counters.reading);
        self.set_timer(EvId::read(slot), self.rt.http.client_header_timeout_ms);
        self.process_request_line_handler(slot);
    }

    pub fn process_request_line_handler(&mut self, slot: usize) {
        let Some(rid) = self.current_rid(slot) else {
            return;
        };
        if self.read_timed_out(slot) {
            self.finalize_request(rid, Fin::Status(HTTP_REQUEST_TIMEOUT));
            return;
        }

        loop {
            // Parse what is buffered.
            let parsed = {
                let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
                    return;
                };
                let mut cursor = http.parsed;
                let buf_ptr = std::mem::take(&mut http.hbuf);
                let result = match http.request_mut(rid.req) {
                    Some(request) => request.line_parser.parse(&buf_ptr, &mut cursor),
                    None => return,
                };
                http.hbuf = buf_ptr;
                http.parsed = cursor;
                result
            };

            match parsed {
                Ok(ParseStatus::Done) => {
                    match self.finish_request_line(rid) {
                        Ok(()) => self.process_headers_handler(slot),
                        Err(status) => self.finalize_request(rid, Fin::Status(status)),
                    }
                    return;
                }
                Ok(ParseStatus::Again) => match self.replenish_header_buffer(slot, rid, true) {
                    Replenish::More => continue,
                    Replenish::Wait => return,
                    Replenish::Stop => return,
                },
                Err(e) => {
                    info!(peer = %self.conn_peer(slot), error = %e, "bad request line");
                    self.finalize_request(rid, Fin::Status(e.status()));
                    return;
                }
            }
        }
    }

    /// Request line complete: fix up method, URI, version; bind the
    /// virtual host for absolute-form targets.
    fn finish_request_line(&mut self, rid: Rid) -> std::result::Result<(), u16> {
        let merge_slashes = self.rt.http.merge_slashes;
        let Some(http) = self
            .conns
            .get_mut(rid.conn)
            .and_then(|c| c.http.as_mut())
        else {
            return Err(HTTP_INTERNAL_SERVER_ERROR);
        };
        let hbuf = std::mem::take(&mut http.hbuf);
        let result = (|| {
            let request = http.request_mut(rid.req).ok_or(HTTP_INTERNAL_SERVER_ERROR)?;
            let parser = &request.line_parser;

            request.method = parser.method(&hbuf).map_err(|_| HTTP_BAD_REQUEST)?;
            request.version = parser.version();
            request.request_line = String::from_utf8_lossy(
                &hbuf[parser.request_start..parser.request_end.max(parser.request_start)],
            )
            .into_owned();

            if request.version == Version::Http09 && request.method != Method::Get {
                return Err(HTTP_BAD_REQUEST);
            }
            if parser.http_major > 1 {
                return Err(HTTP_VERSION_NOT_SUPPORTED);
            }

            let raw_uri = parser.uri_span.slice(&hbuf);
            let (raw_path, raw_args) = match parser.args_start {
                Some(args) if args <= parser.uri_span.end => (
                    &hbuf[parser.uri_span.start..args - 1],
                    &hbuf[args..parser.uri_span.end],
                ),
                _ => (raw_uri, &[][..]),
            };
            request.unparsed_uri = String::from_utf8_lossy(raw_uri).into_owned();
            request.args = String::from_utf8_lossy(raw_args).into_owned();

            request.uri = if parser.complex_uri {
                normalize_uri(raw_path, merge_slashes).map_err(|_| HTTP_BAD_REQUEST)?
            } else {
                std::str::from_utf8(raw_path)
                    .map_err(|_| HTTP_BAD_REQUEST)?
                    .to_string()
            };
            request.exten = uri_extension(&request.uri).to_string();

            if !parser.host_span.is_empty() {
                let host = std::str::from_utf8(parser.host_span.slice(&hbuf))
                    .ok()
                    .and_then(crate::http::headers::normalize_host)
                    .ok_or(HTTP_BAD_REQUEST)?;
                request.headers_in.host = Some(host);
                request.headers_in.host_from_uri = true;
            }

            trace!(method = %request.method, uri = %request.uri, version = ?request.version, "request line");
            Ok(())
        })();
        http.hbuf = hbuf;

        if result.is_ok() {
            if let Some(conn) = self.conns.get_mut(rid.conn) {
                conn.read.handler = ConnHandler::ProcessHeaders;
            }
        }
        result
    }

    pub fn process_headers_handler(&mut self, slot: usize) {
        let Some(rid) = self.current_rid(slot) else {
            return;
        };
        if self.read_timed_out(slot) {
            self.finalize_request(rid, Fin::Status(HTTP_REQUEST_TIMEOUT));
            return;
        }

        // HTTP/0.9 has no header block.
        if self.req(rid).map(|r| r.version) == Some(Version::Http09) {
            self.process_request(rid);
            return;
        }

        loop {
            let parsed = {
                let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
                    return;
                };
                let mut cursor = http.parsed;
                let mut hbuf = std::mem::take(&mut http.hbuf);
                let result = match http.request_mut(rid.req) {
                    Some(request) => {
                        let result = request.header_parser.parse(&mut hbuf, &mut cursor);
                        if let Ok(HeaderStatus::Field) = result {
                            let name = String::from_utf8_lossy(
                                request.header_parser.name.slice(&hbuf),
                            )
                            .into_owned();
                            let value = String::from_utf8_lossy(
                                request.header_parser.value.slice(&hbuf),
                            )
                            .into_owned();
                            let hash = request.header_parser.name_hash;
                            let invalid = request.header_parser.invalid;
                            trace!(%name, %value, "header field");
                            match request.headers_in.add(&name, &value, hash, invalid) {
                                Ok(()) => Ok(HeaderStatus::Field),
                                Err(status) => {
                                    info!(%name, "rejected by header validator");
                                    Err(ValidatorReject(status))
                                }
                            }
                        } else {
                            result.map_err(|e| ValidatorReject(e.status()))
                        }
                    }
                    None => return,
                };
                http.hbuf = hbuf;
                http.parsed = cursor;
                result
            };

            match parsed {
                Ok(HeaderStatus::Field) => continue,
                Ok(HeaderStatus::Done) => {
                    self.process_request_header(rid);
                    return;
                }
                Ok(HeaderStatus::Again) => match self.replenish_header_buffer(slot, rid, false) {
                    Replenish::More => continue,
                    Replenish::Wait => return,
                    Replenish::Stop => return,
                },
                Err(ValidatorReject(status)) => {
                    self.finalize_request(rid, Fin::Status(status));
                    return;
                }
            }
        }
    }

    /// Header block complete: enforce the protocol-level header rules,
    /// bind the virtual host, decide keepalive, and enter the phase
    /// engine.
    fn process_request_header(&mut self, rid: Rid) {
        let rt = Arc::clone(&self.rt);
        let verdict = {
            let Some(conn) = self.conns.get(rid.conn) else {
                return;
            };
            let listener = conn.listener;
            let Some(request) = conn.http.as_ref().and_then(|h| h.request(rid.req)) else {
                return;
            };

            if request.version == Version::Http11 && request.headers_in.host.is_none() {
                info!(peer = %conn.peer, "HTTP/1.1 request without Host");
                Err(HTTP_BAD_REQUEST)
            } else if request.headers_in.chunked && request.version < Version::Http11 {
                // Transfer-Encoding predates nothing in HTTP/1.0;
                // rejecting closes a smuggling vector.
                Err(HTTP_BAD_REQUEST)
            } else if request.headers_in.chunked && request.headers_in.content_length.is_some() {
                Err(HTTP_BAD_REQUEST)
            } else {
                let host = request.headers_in.host.clone().unwrap_or_default();
                let server = rt.listeners[listener].vhosts.select(&host);
                Ok(Arc::clone(&rt.servers[server]))
            }
        };

        match verdict {
            Err(status) => self.finalize_request(rid, Fin::Status(status)),
            Ok(srv) => {
                let keepalive_budget = {
                    let Some(http) = self.conns.get(rid.conn).and_then(|c| c.http.as_ref()) else {
                        return;
                    };
                    http.nrequests + 1 < rt.http.keepalive_requests
                };
                {
                    let Some(request) = self.req_mut(rid) else {
                        return;
                    };
                    request.srv = srv;
                    request.keepalive = match request.headers_in.connection {
                        ConnectionPolicy::Close => false,
                        ConnectionPolicy::KeepAlive => true,
                        ConnectionPolicy::Default => request.version == Version::Http11,
                    } && rt.http.keepalive_timeout_ms > 0
                        && keepalive_budget;
                    request.header_only = request.method == Method::Head;
                    request.read_handler = ReqHandler::BlockReading;
                    request.write_handler = ReqHandler::RunPhases;
                    request.counted_reading = false;
                }
                self.clear_timer(EvId::read(rid.conn));
                SharedCounters::decr(&self.rt.counters.reading);
                SharedCounters::incr(&self.rt.counters.writing);
                self.rt.counters.requests.fetch_add(1, Ordering::Relaxed);
                if let Some(conn) = self.conns.get_mut(rid.conn) {
                    conn.read.handler = ConnHandler::RequestDispatch;
                    conn.write.handler = ConnHandler::RequestDispatch;
                }
                self.run_phases(rid);
            }
        }
    }

    /// HTTP/0.9 path: no headers, no keepalive.
    fn process_request(&mut self, rid: Rid) {
        self.clear_timer(EvId::read(rid.conn));
        SharedCounters::decr(&self.rt.counters.reading);
        SharedCounters::incr(&self.rt.counters.writing);
        {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            request.keepalive = false;
            request.read_handler = ReqHandler::BlockReading;
            request.write_handler = ReqHandler::RunPhases;
            request.counted_reading = false;
        }
        if let Some(conn) = self.conns.get_mut(rid.conn) {
            conn.read.handler = ConnHandler::RequestDispatch;
            conn.write.handler = ConnHandler::RequestDispatch;
        }
        self.run_phases(rid);
    }

    /// The parked read handler while a response is produced: its only
    /// job is noticing that the client went away.
    pub fn block_reading(&mut self, rid: Rid) {
        let closed = {
            let Some(conn) = self.conns.get_mut(rid.conn) else {
                return;
            };
            if conn.read.eof {
                true
            } else if conn.read.ready {
                conn.read.ready = false;
                let mut probe = [0u8; 1];
                match conn.stream.as_ref().map(|s| s.peek(&mut probe)) {
                    Some(Ok(0)) => true,
                    _ => false,
                }
            } else {
                false
            }
        };
        if closed {
            info!(peer = %self.conn_peer(rid.conn), "client closed connection mid-request");
            self.finalize_request(rid, Fin::Status(HTTP_CLIENT_CLOSED_REQUEST));
        }
    }

    /// Write-side handler once a response could not be flushed in one
    /// pass: re-enter the body chain on socket readiness.
    pub fn writer(&mut self, rid: Rid) {
        let timed_out = self
            .conns
            .get(rid.conn)
            .map(|c| c.write.timed_out)
            .unwrap_or(false);
        if timed_out {
            info!(peer = %self.conn_peer(rid.conn), "client timed out receiving response");
            self.finalize_request(rid, Fin::Error);
            return;
        }

        let code = self.output_filter(rid, Chain::new());
        if code == crate::http::filter::FilterCode::Error {
            self.finalize_request(rid, Fin::Error);
            return;
        }

        let still_buffered = self.request_output_pending(rid);
        if still_buffered {
            return;
        }
        let done = self.req(rid).map(|r| r.done).unwrap_or(false);
        if done {
            self.finalize_request(rid, Fin::Ok);
        }
    }

    fn request_output_pending(&self, rid: Rid) -> bool {
        let conn_pending = self
            .conns
            .get(rid.conn)
            .map(|c| !c.out.is_empty())
            .unwrap_or(false);
        let req_pending = self
            .req(rid)
            .map(|r| r.buffered != 0 || !r.postponed.is_empty())
            .unwrap_or(false);
        conn_pending || req_pending
    }

    /// Finalize with the count discipline. Idempotent: a second call
    /// with the same status observes `done` and only drops a reference.
    pub fn finalize_request(&mut self, rid: Rid, fin: Fin) {
        let Some(request) = self.req(rid) else {
            return;
        };
        let is_sub = request.parent.is_some();
        let header_sent = request.header_sent;
        let already_done = request.done;

        match fin {
            Fin::Error => {
                self.terminate_request(rid, true);
                return;
            }
            Fin::Status(status) if status == HTTP_CLIENT_CLOSED_REQUEST => {
                if let Some(request) = self.req_mut(rid) {
                    request.headers_out.status = status;
                }
                self.terminate_request(rid, true);
                return;
            }
            Fin::Status(status) => {
                if !already_done && !header_sent && !is_sub {
                    self.special_response(rid, status);
                    return;
                }
                if !already_done && is_sub {
                    // A failed subrequest contributes nothing to the
                    // wire; record the status and complete it.
                    if let Some(request) = self.req_mut(rid) {
                        request.headers_out.status = status;
                    }
                } else if header_sent && !already_done && status >= 300 {
                    // The status changed after bytes left; the stream is
                    // unrecoverable.
                    self.terminate_request(rid, true);
                    return;
                }
            }
            _ => {}
        }

        if let Some(request) = self.req_mut(rid) {
            request.done = true;
        }

        if is_sub {
            self.try_advance_wire(rid.conn);
            return;
        }

        // Main request: flush or terminate.
        if self.request_output_pending(rid) {
            let send_timeout = self.rt.http.send_timeout_ms;
            if let Some(request) = self.req_mut(rid) {
                request.write_handler = ReqHandler::Writer;
            }
            // Responses produced before the dispatcher was installed
            // (parse-stage errors) still need their write events routed.
            if let Some(conn) = self.conns.get_mut(rid.conn) {
                conn.write.handler = ConnHandler::RequestDispatch;
            }
            self.want_write(rid.conn, true);
            self.set_timer(EvId::write(rid.conn), send_timeout);
            self.try_advance_wire(rid.conn);
            return;
        }
        self.terminate_request(rid, false);
    }

    /// The progress engine for request trees: completes finished
    /// subrequests at the wire head, hands ownership back to parents and
    /// drains their parked output, and terminates the main request when
    /// the whole tree has flushed.
    pub fn try_advance_wire(&mut self, slot: usize) {
        loop {
            let Some(active) = self
                .conns
                .get(slot)
                .and_then(|c| c.http.as_ref())
                .and_then(|h| h.active)
            else {
                return;
            };
            let rid = Rid::new(slot, active);
            let Some(request) = self.req(rid) else {
                return;
            };
            let done = request.done;
            let parent = request.parent;
            let has_postponed = !request.postponed.is_empty();
            let buffered = request.buffered != 0;

            if !done {
                return;
            }

            if has_postponed {
                // Flush parked data (and possibly switch to the next
                // pending subrequest).
                let code = self.output_filter(rid, Chain::new());
                if code == crate::http::filter::FilterCode::Error {
                    self.terminate_request(rid, true);
                    return;
                }
                // If the active writer changed, keep walking; otherwise
                // everything drainable has drained.
                let now_active = self
                    .conns
                    .get(slot)
                    .and_then(|c| c.http.as_ref())
                    .and_then(|h| h.active);
                if now_active == Some(active) {
                    let still = self
                        .req(rid)
                        .map(|r| !r.postponed.is_empty())
                        .unwrap_or(false);
                    if still {
                        return;
                    }
                }
                continue;
            }

            if buffered {
                return;
            }

            match parent {
                Some(parent_req) => {
                    self.complete_subrequest(rid, parent_req);
                    // Loop continues with the parent as active writer.
                }
                None => {
                    // Main request fully flushed?
                    let conn_pending = self
                        .conns
                        .get(slot)
                        .map(|c| !c.out.is_empty())
                        .unwrap_or(false);
                    if !conn_pending {
                        self.terminate_request(rid, false);
                    }
                    return;
                }
            }
        }
    }

    /// Detach a finished subrequest: run its completion callback, drop it
    /// from the parent's postponed list, return the wire to the parent
    /// and wake it.
    fn complete_subrequest(&mut self, rid: Rid, parent_req: usize) {
        let status = self
            .req(rid)
            .map(|r| {
                if r.headers_out.status == 0 {
                    HTTP_OK
                } else {
                    r.headers_out.status
                }
            })
            .unwrap_or(HTTP_INTERNAL_SERVER_ERROR);
        let callback = self.req_mut(rid).and_then(|r| r.post_subrequest.take());
        if let Some(callback) = callback {
            callback(self, rid, status);
        }

        let Some(http) = self.conns.get_mut(rid.conn).and_then(|c| c.http.as_mut()) else {
            return;
        };
        if let Some(parent) = http.request_mut(parent_req) {
            parent
                .postponed
                .retain(|node| !matches!(node, Postponed::Sub(sub) if *sub == rid.req));
        }
        http.active = Some(parent_req);
        // Drop the main-request reference the subrequest held.
        let main = http.request(parent_req).map(|r| r.main);
        if let Some(main) = main {
            if let Some(main_request) = http.request_mut(main) {
                main_request.count = main_request.count.saturating_sub(1);
            }
        }
        http.free_request(rid.req);
        self.post_request(Rid::new(rid.conn, parent_req));
    }

    /// Run the LOG phase and release the request; the connection either
    /// enters keepalive, drains via lingering close, or closes.
    fn terminate_request(&mut self, rid: Rid, error: bool) {
        let (count, logged, keepalive, body_pending, expects_unread_body) = {
            let Some(request) = self.req(rid) else {
                return;
            };
            let body_pending = matches!(
                request.body.remaining,
                Some(remaining) if remaining > 0
            ) || request
                .body
                .chunked
                .as_ref()
                .map(|_| request.body.mode != crate::http::request::BodyMode::Idle)
                .unwrap_or(false);
            let expects_unread_body = request.headers_in.has_body()
                && request.body.mode == crate::http::request::BodyMode::Idle;
            (
                request.count,
                request.logged,
                request.keepalive && !error,
                body_pending,
                expects_unread_body,
            )
        };
        if count > 1 {
            if let Some(request) = self.req_mut(rid) {
                request.count -= 1;
            }
            return;
        }

        if !logged {
            if let Some(request) = self.req_mut(rid) {
                request.logged = true;
            }
            let log_handlers = self.rt.engine.log_handlers.clone();
            for handler in log_handlers {
                handler(self, rid);
            }
        }
        // The request dies in whichever gauge it currently occupies.
        let still_reading = self
            .req(rid)
            .map(|r| r.counted_reading)
            .unwrap_or(false);
        if still_reading {
            SharedCounters::decr(&self.rt.counters.reading);
        } else {
            SharedCounters::decr(&self.rt.counters.writing);
        }

        let conn_error = self
            .conns
            .get(rid.conn)
            .map(|c| c.error)
            .unwrap_or(true);

        if keepalive && !conn_error && !body_pending && !expects_unread_body {
            self.set_keepalive(rid);
        } else if !conn_error && (body_pending || expects_unread_body) {
            self.release_request(rid);
            self.lingering_close(rid.conn);
        } else {
            self.release_request(rid);
            self.close_connection(rid.conn);
        }
    }

    fn release_request(&mut self, rid: Rid) {
        let Some(http) = self.conns.get_mut(rid.conn).and_then(|c| c.http.as_mut()) else {
            return;
        };
        // Free the whole tree rooted at this main request.
        let slots: Vec<usize> = http
            .requests
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r.main)))
            .filter(|(_, main)| *main == rid.req)
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            http.free_request(slot);
        }
        http.current = None;
        http.active = None;
    }

    /// Keep the connection for the next request: reset buffers, arm the
    /// keepalive timer, start immediately when a pipelined request is
    /// already buffered.
    fn set_keepalive(&mut self, rid: Rid) {
        let slot = rid.conn;
        debug!(peer = %self.conn_peer(slot), "keepalive");
        self.release_request(rid);

        let residue = {
            let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
                return;
            };
            http.nrequests += 1;
            http.keepalive_reset();
            http.residue() > 0
        };

        {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            conn.idle = true;
            conn.read.handler = ConnHandler::Keepalive;
            conn.write.handler = ConnHandler::Empty;
        }
        self.want_write(slot, false);
        self.clear_timer(EvId::write(slot));
        self.set_timer(EvId::read(slot), self.rt.http.keepalive_timeout_ms);
        self.conns.set_reusable(slot, true);
        SharedCounters::incr(&self.rt.counters.waiting);

        // A pipelined request may already be buffered, or sit unread in
        // the socket: the edge-triggered notifier will not fire again
        // for bytes that arrived before this point.
        let read_ready = self
            .conns
            .get(slot)
            .map(|c| c.read.ready)
            .unwrap_or(false);
        if residue || read_ready {
            self.keepalive_handler(slot);
        }
    }

    pub fn keepalive_handler(&mut self, slot: usize) {
        let timed_out = self
            .conns
            .get(slot)
            .map(|c| c.read.timed_out)
            .unwrap_or(true);
        if timed_out {
            debug!(slot, "keepalive timeout");
            SharedCounters::decr(&self.rt.counters.waiting);
            self.close_connection(slot);
            return;
        }

        let has_residue = self
            .conns
            .get(slot)
            .and_then(|c| c.http.as_ref())
            .map(|h| h.residue() > 0)
            .unwrap_or(false);

        let outcome = if has_residue {
            FillOutcome::Data
        } else {
            self.fill_header_buffer(slot)
        };
        match outcome {
            FillOutcome::WouldBlock => {}
            FillOutcome::Closed => {
                debug!(slot, "client closed keepalive connection");
                SharedCounters::decr(&self.rt.counters.waiting);
                self.close_connection(slot);
            }
            FillOutcome::NoRoom | FillOutcome::Data => {
                SharedCounters::decr(&self.rt.counters.waiting);
                {
                    let Some(conn) = self.conns.get_mut(slot) else {
                        return;
                    };
                    conn.idle = false;
                }
                self.conns.set_reusable(slot, false);
                self.start_request(slot);
            }
        }
    }

    /// Drain-then-close: give the client a bounded window to stop
    /// sending so the response is not lost to a reset.
    pub fn lingering_close(&mut self, slot: usize) {
        let lingering_time = self.rt.http.lingering_time_ms;
        let lingering_timeout = self.rt.http.lingering_timeout_ms;
        {
            let Some(conn) = self.conns.get_mut(slot) else {
                return;
            };
            conn.read.handler = ConnHandler::LingeringClose;
            conn.write.handler = ConnHandler::Empty;
            if let Some(http) = conn.http.as_mut() {
                http.lingering_deadline = self.clock.now_ms + lingering_time;
            }
            if let Some(stream) = conn.stream.as_ref() {
                stream.shutdown_write();
            }
        }
        self.want_write(slot, false);
        self.clear_timer(EvId::write(slot));
        self.set_timer(EvId::read(slot), lingering_timeout);
    }

    pub fn lingering_close_handler(&mut self, slot: usize) {
        let deadline = self
            .conns
            .get(slot)
            .and_then(|c| c.http.as_ref())
            .map(|h| h.lingering_deadline)
            .unwrap_or(0);
        let timed_out = self
            .conns
            .get(slot)
            .map(|c| c.read.timed_out)
            .unwrap_or(true);
        if timed_out || self.clock.now_ms >= deadline {
            self.close_connection(slot);
            return;
        }

        let mut scratch = [0u8; 4096];
        loop {
            let read = {
                let Some(conn) = self.conns.get_mut(slot) else {
                    return;
                };
                match conn.stream.as_mut() {
                    Some(stream) => stream.read(&mut scratch),
                    None => return,
                }
            };
            match read {
                Ok(0) => {
                    self.close_connection(slot);
                    return;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let timeout = self.rt.http.lingering_timeout_ms;
                    self.set_timer(EvId::read(slot), timeout);
                    return;
                }
                Err(_) => {
                    self.close_connection(slot);
                    return;
                }
            }
        }
    }

    /// Unregister, run request cleanups, release the slot. Stale
    /// readiness for the old occupant is dropped by the instance check.
    pub fn close_connection(&mut self, slot: usize) {
        self.clear_timer(EvId::read(slot));
        self.clear_timer(EvId::write(slot));
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        debug!(slot, peer = %conn.peer, "closing connection");
        if let Some(http) = conn.http.as_mut() {
            let slots: Vec<usize> = http
                .requests
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.as_ref().map(|_| i))
                .collect();
            for req_slot in slots {
                http.free_request(req_slot);
            }
        }
        if let Some(mut stream) = conn.stream.take() {
            let _ = self.reactor.deregister(&mut stream);
        }
        self.conns.release(slot);
        SharedCounters::decr(&self.rt.counters.active);
    }

    // Small shared helpers.

    pub fn current_rid(&self, slot: usize) -> Option<Rid> {
        let current = self
            .conns
            .get(slot)
            .and_then(|c| c.http.as_ref())
            .and_then(|h| h.current)?;
        Some(Rid::new(slot, current))
    }

    fn read_timed_out(&self, slot: usize) -> bool {
        self.conns
            .get(slot)
            .map(|c| c.read.timed_out)
            .unwrap_or(false)
    }

    /// Read available bytes into the header buffer without growing past
    /// its logical capacity.
    fn fill_header_buffer(&mut self, slot: usize) -> FillOutcome {
        let Some(conn) = self.conns.get_mut(slot) else {
            return FillOutcome::Closed;
        };
        let Some(http) = conn.http.as_mut() else {
            return FillOutcome::Closed;
        };
        let room = http.read_room();
        if room == 0 {
            return FillOutcome::NoRoom;
        }
        let mut scratch = vec![0u8; room];
        let Some(stream) = conn.stream.as_mut() else {
            return FillOutcome::Closed;
        };
        match stream.read(&mut scratch) {
            Ok(0) => {
                conn.read.eof = true;
                FillOutcome::Closed
            }
            Ok(n) => {
                http.hbuf.extend_from_slice(&scratch[..n]);
                FillOutcome::Data
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                conn.read.ready = false;
                FillOutcome::WouldBlock
            }
            Err(e) => {
                debug!(slot, error = %e, "read failed");
                conn.error = true;
                FillOutcome::Closed
            }
        }
    }

    /// Grow or refill the header buffer mid-parse; relocation shifts the
    /// parser spans of the in-flight request.
    fn replenish_header_buffer(&mut self, slot: usize, rid: Rid, in_request_line: bool) -> Replenish {
        let room = {
            let Some(http) = self.conns.get_mut(slot).and_then(|c| c.http.as_mut()) else {
                return Replenish::Stop;
            };
            http.ensure_header_room(in_request_line)
        };
        match room {
            Err(status) => {
                info!(peer = %self.conn_peer(slot), status, "request header too large");
                self.finalize_request(rid, Fin::Status(status));
                return Replenish::Stop;
            }
            Ok(HeaderRoom::Relocated(delta)) if delta > 0 => {
                if let Some(request) = self.req_mut(rid) {
                    request.line_parser.shift(delta);
                    request.header_parser.shift(delta);
                }
            }
            Ok(_) => {}
        }
        match self.fill_header_buffer(slot) {
            FillOutcome::Data => Replenish::More,
            FillOutcome::WouldBlock => Replenish::Wait,
            FillOutcome::NoRoom => Replenish::Wait,
            FillOutcome::Closed => {
                info!(peer = %self.conn_peer(slot), "client closed connection while sending request");
                self.finalize_request(rid, Fin::Status(HTTP_BAD_REQUEST));
                Replenish::Stop
            }
        }
    }
}

enum FillOutcome {
    Data,
    WouldBlock,
    Closed,
    NoRoom,
}

enum Replenish {
    More,
    Wait,
    Stop,
}

struct ValidatorReject(u16);
