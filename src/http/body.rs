//! Client request-body intake: identity and chunked readers, discard
//! mode, `Expect: 100-continue`, and the body timeout.

use std::io::Read;

use crate::buf::{Buf, Chain};
use crate::event::EvId;
use crate::http::lifecycle::Fin;
use crate::http::parse::{ChunkEvent, ChunkedParser};
use crate::http::request::{BodyMode, ReqHandler};
use crate::http::Version;
use crate::prelude::*;

pub type BodyDoneFn = fn(&mut Worker, Rid);

impl Worker {
    /// Begin consuming the request body into memory; `done` runs when the
    /// last byte arrives. Bodies are only read when a handler asks.
    pub fn read_client_request_body(&mut self, rid: Rid, done: BodyDoneFn) {
        self.start_body(rid, BodyMode::Read, Some(done));
    }

    /// Drain the body without storing it, so keepalive can survive a
    /// handler that ignores the payload.
    pub fn discard_request_body(&mut self, rid: Rid) {
        self.start_body(rid, BodyMode::Discard, None);
    }

    fn start_body(&mut self, rid: Rid, mode: BodyMode, done: Option<BodyDoneFn>) {
        let max_body = {
            let Some(request) = self.req(rid) else {
                return;
            };
            request.max_body_size()
        };

        let oversized = {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            request.body.mode = mode;
            request.body.post_handler = done;
            if request.headers_in.chunked {
                request.body.chunked = Some(ChunkedParser::new());
                request.body.remaining = None;
                false
            } else {
                let length = request.headers_in.content_length.unwrap_or(0);
                request.body.remaining = Some(length);
                max_body > 0 && length > max_body && mode == BodyMode::Read
            }
        };
        if oversized {
            self.finalize_request(rid, Fin::Status(HTTP_PAYLOAD_TOO_LARGE));
            return;
        }

        self.send_continue(rid);

        // Whatever arrived behind the headers is body.
        match self.consume_body_bytes(rid) {
            Ok(true) => {
                self.body_complete(rid);
                return;
            }
            Ok(false) => {}
            Err(()) => return,
        }

        let timeout = self.rt.http.client_body_timeout_ms;
        {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            request.read_handler = match mode {
                BodyMode::Discard => ReqHandler::DiscardBody,
                _ => ReqHandler::ReadBody,
            };
        }
        self.set_timer(EvId::read(rid.conn), timeout);
    }

    /// `Expect: 100-continue` — the interim line bypasses the filter
    /// chains entirely.
    fn send_continue(&mut self, rid: Rid) {
        let wanted = {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            if request.headers_in.expect_continue
                && !request.expect_sent
                && request.version >= Version::Http11
            {
                request.expect_sent = true;
                true
            } else {
                false
            }
        };
        if wanted {
            let mut chain = Chain::new();
            let mut buf = Buf::mem(b"HTTP/1.1 100 Continue\r\n\r\n".to_vec());
            buf.flush = true;
            chain.push_back(buf);
            let write_at = self.rt.filters.body.len().saturating_sub(1);
            let _ = self.next_body_filter(write_at, rid, chain);
        }
    }

    pub fn read_body_handler(&mut self, rid: Rid) {
        self.body_event(rid);
    }

    pub fn discard_body_handler(&mut self, rid: Rid) {
        self.body_event(rid);
    }

    fn body_event(&mut self, rid: Rid) {
        let timed_out = self
            .conns
            .get(rid.conn)
            .map(|c| c.read.timed_out)
            .unwrap_or(true);
        if timed_out {
            info!(peer = %self.conn_peer(rid.conn), "client timed out sending body");
            self.finalize_request(rid, Fin::Status(HTTP_REQUEST_TIMEOUT));
            return;
        }

        loop {
            match self.consume_body_bytes(rid) {
                Ok(true) => {
                    self.clear_timer(EvId::read(rid.conn));
                    self.body_complete(rid);
                    return;
                }
                Ok(false) => {}
                Err(()) => return,
            }
            match self.fill_body_buffer(rid.conn) {
                BodyFill::Data => continue,
                BodyFill::WouldBlock => {
                    let timeout = self.rt.http.client_body_timeout_ms;
                    self.set_timer(EvId::read(rid.conn), timeout);
                    return;
                }
                BodyFill::Closed => {
                    info!(peer = %self.conn_peer(rid.conn), "client closed connection mid-body");
                    self.finalize_request(rid, Fin::Status(HTTP_BAD_REQUEST));
                    return;
                }
            }
        }
    }

    /// Move buffered input into the body; `Ok(true)` when the body is
    /// complete, `Err` when the request was finalized with an error.
    fn consume_body_bytes(&mut self, rid: Rid) -> std::result::Result<bool, ()> {
        let max_body = self.req(rid).map(|r| r.max_body_size()).unwrap_or(0);
        let Some(http) = self.conns.get_mut(rid.conn).and_then(|c| c.http.as_mut()) else {
            return Err(());
        };
        let parsed = http.parsed;
        let hbuf = std::mem::take(&mut http.hbuf);
        let mut cursor = parsed;

        let (complete, overflow) = {
            let Some(request) = http.request_mut(rid.req) else {
                http.hbuf = hbuf;
                return Err(());
            };
            let store = request.body.mode == BodyMode::Read;
            if let Some(chunked) = request.body.chunked.as_mut() {
                let mut complete = false;
                let mut failed = false;
                loop {
                    match chunked.parse(&hbuf, &mut cursor) {
                        Ok(ChunkEvent::Data { start, end }) => {
                            if store {
                                request.body.received.extend_from_slice(&hbuf[start..end]);
                            }
                        }
                        Ok(ChunkEvent::Done) => {
                            complete = true;
                            break;
                        }
                        Ok(ChunkEvent::Again) => break,
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                }
                let overflow = max_body > 0 && store && chunked.received > max_body;
                if failed {
                    (None, overflow)
                } else {
                    (Some(complete), overflow)
                }
            } else {
                let remaining = request.body.remaining.unwrap_or(0);
                let available = (hbuf.len() - cursor) as u64;
                let take = remaining.min(available) as usize;
                if store && take > 0 {
                    request.body.received.extend_from_slice(&hbuf[cursor..cursor + take]);
                }
                cursor += take;
                let remaining = remaining - take as u64;
                request.body.remaining = Some(remaining);
                (Some(remaining == 0), false)
            }
        };

        http.hbuf = hbuf;
        http.parsed = cursor;

        match (complete, overflow) {
            (_, true) => {
                self.finalize_request(rid, Fin::Status(HTTP_PAYLOAD_TOO_LARGE));
                Err(())
            }
            (None, _) => {
                self.finalize_request(rid, Fin::Status(HTTP_BAD_REQUEST));
                Err(())
            }
            (Some(complete), _) => Ok(complete),
        }
    }

    /// Read more body bytes. They land in the header buffer, which is
    /// allowed to grow for body intake: body bytes drain out of it as
    /// fast as they are consumed.
    fn fill_body_buffer(&mut self, slot: usize) -> BodyFill {
        let Some(conn) = self.conns.get_mut(slot) else {
            return BodyFill::Closed;
        };
        let Some(http) = conn.http.as_mut() else {
            return BodyFill::Closed;
        };
        // Compact consumed bytes before reading more.
        if http.parsed > 0 && http.residue() == 0 {
            http.hbuf.clear();
            http.parsed = 0;
            http.req_start = 0;
        }
        let mut scratch = [0u8; 8192];
        let Some(stream) = conn.stream.as_mut() else {
            return BodyFill::Closed;
        };
        match stream.read(&mut scratch) {
            Ok(0) => {
                conn.read.eof = true;
                BodyFill::Closed
            }
            Ok(n) => {
                http.hbuf.extend_from_slice(&scratch[..n]);
                BodyFill::Data
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                conn.read.ready = false;
                BodyFill::WouldBlock
            }
            Err(_) => {
                conn.error = true;
                BodyFill::Closed
            }
        }
    }

    fn body_complete(&mut self, rid: Rid) {
        let handler = {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            request.read_handler = ReqHandler::BlockReading;
            request.body.mode = match request.body.mode {
                BodyMode::Discard => BodyMode::Idle,
                other => other,
            };
            request.body.chunked = None;
            request.body.post_handler.take()
        };
        if let Some(handler) = handler {
            handler(self, rid);
        }
    }
}

enum BodyFill {
    Data,
    WouldBlock,
    Closed,
}
