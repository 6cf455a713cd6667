//! The request record and the per-connection HTTP state that owns the
//! header buffer and the request arena.

use std::sync::Arc;

use crate::buf::Chain;
use crate::config::HttpConfig;
use crate::http::headers::{HeadersIn, HeadersOut};
use crate::http::location::LocationRuntime;
use crate::http::parse::{ChunkedParser, HeaderParser, RequestLineParser};
use crate::http::{Method, Version};
use crate::prelude::{HTTP_HEADERS_TOO_LARGE, HTTP_URI_TOO_LONG};
use crate::runtime::ServerRuntime;

/// Request-level event handlers, invoked by the connection's generic
/// dispatcher according to which side of the socket woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReqHandler {
    #[default]
    Empty,
    /// Body bytes are not wanted yet; only watches for a closed peer.
    BlockReading,
    /// Drive the phase engine from the current cursor.
    RunPhases,
    /// Re-enter the body filter chain when the socket drains.
    Writer,
    ReadBody,
    DiscardBody,
}

/// One element of a request's postponed list: either a child awaiting its
/// turn on the wire, or parent output accumulated while a child held it.
pub enum Postponed {
    Sub(usize),
    Data(Chain),
}

// Bits of `Request::buffered`.
pub const BUFFERED_POSTPONED: u8 = 0x01;
pub const BUFFERED_COPY: u8 = 0x02;

pub struct Request {
    /// Slot in the connection's request arena.
    pub slot: usize,
    /// Owning connection's pool slot.
    pub conn: usize,
    pub main: usize,
    pub parent: Option<usize>,

    pub srv: Arc<ServerRuntime>,
    pub loc: Option<Arc<LocationRuntime>>,

    pub method: Method,
    pub version: Version,
    pub request_line: String,
    pub uri: String,
    pub args: String,
    pub exten: String,
    pub unparsed_uri: String,

    pub headers_in: HeadersIn,
    pub headers_out: HeadersOut,

    /// Phase-engine cursor.
    pub phase: usize,
    pub read_handler: ReqHandler,
    pub write_handler: ReqHandler,

    /// Outstanding references: the lifecycle itself, live subrequests,
    /// deferred work. The request is torn down when this reaches zero.
    pub count: u32,
    pub blocked: u32,

    pub subrequests_left: u32,
    pub uri_changes_left: u32,

    pub postponed: VecDequeOf<Postponed>,
    /// Only meaningful on the main request.
    pub posted_requests: VecDequeOf<usize>,
    pub post_subrequest: Option<fn(&mut crate::worker::Worker, crate::worker::Rid, u16)>,

    /// Copy-filter recycling lists and resume state.
    pub out_busy: Chain,
    pub out_free: Vec<crate::buf::Buf>,
    pub copy_pending: Chain,
    pub copy_allocated: usize,
    pub buffered: u8,

    pub header_sent: bool,
    pub header_only: bool,
    pub done: bool,
    pub logged: bool,
    /// Which shared gauge the request currently occupies.
    pub counted_reading: bool,
    pub keepalive: bool,
    pub uri_changed: bool,
    pub internal: bool,
    pub error_page: bool,
    pub filter_finalize: bool,
    pub waited: bool,
    pub expect_sent: bool,

    pub body: RequestBody,
    pub access_code: Option<u16>,
    /// Error status pinned by an `error_page` redirect; overrides the
    /// redirected handler's status on the wire.
    pub err_status: Option<u16>,
    /// Lazily filled variable values, indexed by variable id.
    pub variables: Vec<Option<String>>,

    // Range-filter scratch, parsed from the Range header.
    pub ranges: Vec<(u64, u64)>,
    pub range_boundary: Option<String>,
    pub range_total: u64,
    pub range_offset: u64,
    pub range_entity: Chain,
    pub range_entity_type: Option<String>,

    pub chunked_out: bool,

    pub start_ms: u64,

    // Parser state, live until the header block is consumed.
    pub line_parser: RequestLineParser,
    pub header_parser: HeaderParser,

    /// Cleanup callbacks, run in reverse registration order at teardown.
    pub cleanups: Vec<Box<dyn FnOnce()>>,
}

type VecDequeOf<T> = std::collections::VecDeque<T>;

impl Request {
    pub fn new(
        slot: usize,
        conn: usize,
        srv: Arc<ServerRuntime>,
        conf: &HttpConfig,
        now_ms: u64,
        allow_underscores: bool,
    ) -> Request {
        Request {
            slot,
            conn,
            main: slot,
            parent: None,
            srv,
            loc: None,
            method: Method::Get,
            version: Version::Http11,
            request_line: String::new(),
            uri: String::new(),
            args: String::new(),
            exten: String::new(),
            unparsed_uri: String::new(),
            headers_in: HeadersIn::default(),
            headers_out: HeadersOut::default(),
            phase: 0,
            read_handler: ReqHandler::Empty,
            write_handler: ReqHandler::Empty,
            count: 1,
            blocked: 0,
            subrequests_left: conf.max_subrequests,
            uri_changes_left: conf.max_uri_changes,
            postponed: VecDequeOf::new(),
            posted_requests: VecDequeOf::new(),
            post_subrequest: None,
            out_busy: Chain::new(),
            out_free: Vec::new(),
            copy_pending: Chain::new(),
            copy_allocated: 0,
            buffered: 0,
            header_sent: false,
            header_only: false,
            done: false,
            logged: false,
            counted_reading: false,
            keepalive: false,
            uri_changed: false,
            internal: false,
            error_page: false,
            filter_finalize: false,
            waited: false,
            expect_sent: false,
            body: RequestBody::default(),
            access_code: None,
            err_status: None,
            variables: Vec::new(),
            ranges: Vec::new(),
            range_boundary: None,
            range_total: 0,
            range_offset: 0,
            range_entity: Chain::new(),
            range_entity_type: None,
            chunked_out: false,
            start_ms: now_ms,
            line_parser: RequestLineParser::new(),
            header_parser: HeaderParser::new(allow_underscores),
            cleanups: Vec::new(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.parent.is_none()
    }

    /// The body ceiling for this request's scope.
    pub fn max_body_size(&self) -> u64 {
        self.loc
            .as_ref()
            .and_then(|l| l.conf.client_max_body_size)
            .unwrap_or(self.srv.conf.client_max_body_size)
    }

    /// Document root for this request's scope.
    pub fn root(&self) -> &str {
        self.loc
            .as_ref()
            .and_then(|l| l.conf.root.as_deref())
            .unwrap_or(&self.srv.conf.root)
    }

    pub fn index_files(&self) -> &[String] {
        self.loc
            .as_ref()
            .and_then(|l| l.conf.index.as_deref())
            .unwrap_or(&self.srv.conf.index)
    }

    pub fn add_cleanup(&mut self, cleanup: Box<dyn FnOnce()>) {
        self.cleanups.push(cleanup);
    }

    pub fn run_cleanups(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyMode {
    #[default]
    Idle,
    Read,
    Discard,
}

#[derive(Default)]
pub struct RequestBody {
    pub mode: BodyMode,
    /// Bytes still expected for an identity body.
    pub remaining: Option<u64>,
    pub chunked: Option<ChunkedParser>,
    pub received: Vec<u8>,
    pub post_handler: Option<fn(&mut crate::worker::Worker, crate::worker::Rid)>,
}

/// Room check result for the header buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRoom {
    /// There is space to read into.
    Ok,
    /// A large buffer was allocated; recorded spans were shifted left by
    /// the returned offset.
    Relocated(usize),
}

/// Per-connection HTTP state: header buffer, request arena, wire
/// ownership, keepalive accounting.
pub struct HttpState {
    pub hbuf: Vec<u8>,
    /// Logical capacity; the vector never grows past it without a
    /// migration step.
    pub cap: usize,
    /// Parser cursor into `hbuf`.
    pub parsed: usize,
    /// Start of the in-flight request's bytes, kept for relocation.
    pub req_start: usize,
    pub large_count: usize,

    small_size: usize,
    large_size: usize,
    max_large: usize,

    pub requests: Vec<Option<Request>>,
    free_requests: Vec<usize>,
    /// The request owning the wire; mirror of the connection `data`
    /// pointer in the original design.
    pub active: Option<usize>,
    /// The request currently being parsed or served at the top level.
    pub current: Option<usize>,
    /// Requests served on this connection, against `keepalive_requests`.
    pub nrequests: usize,
    pub lingering_deadline: u64,
}

impl HttpState {
    pub fn new(conf: &HttpConfig) -> HttpState {
        HttpState {
            hbuf: Vec::with_capacity(conf.client_header_buffer_size),
            cap: conf.client_header_buffer_size,
            parsed: 0,
            req_start: 0,
            large_count: 0,
            small_size: conf.client_header_buffer_size,
            large_size: conf.large_client_header_buffers.size,
            max_large: conf.large_client_header_buffers.count,
            requests: Vec::new(),
            free_requests: Vec::new(),
            active: None,
            current: None,
            nrequests: 0,
            lingering_deadline: 0,
        }
    }

    pub fn alloc_request(&mut self, build: impl FnOnce(usize) -> Request) -> usize {
        match self.free_requests.pop() {
            Some(slot) => {
                self.requests[slot] = Some(build(slot));
                slot
            }
            None => {
                let slot = self.requests.len();
                self.requests.push(Some(build(slot)));
                slot
            }
        }
    }

    pub fn free_request(&mut self, slot: usize) {
        if let Some(mut request) = self.requests.get_mut(slot).and_then(Option::take) {
            request.run_cleanups();
            self.free_requests.push(slot);
        }
    }

    pub fn request(&self, slot: usize) -> Option<&Request> {
        self.requests.get(slot).and_then(Option::as_ref)
    }

    pub fn request_mut(&mut self, slot: usize) -> Option<&mut Request> {
        self.requests.get_mut(slot).and_then(Option::as_mut)
    }

    /// Unparsed input.
    pub fn residue(&self) -> usize {
        self.hbuf.len() - self.parsed
    }

    pub fn read_room(&self) -> usize {
        // Body intake may have grown the buffer past its header cap.
        self.cap.saturating_sub(self.hbuf.len())
    }

    /// Make room for more header bytes. When the current buffer is
    /// exhausted the in-flight request's bytes move into a fresh large
    /// buffer and every recorded span must be shifted by the returned
    /// offset; the caller owns that fix-up because it owns the parsers.
    ///
    /// `in_request_line` picks the failure status: 414 while the request
    /// line is incomplete, 494 (delivered as 400) for oversized headers.
    pub fn ensure_header_room(
        &mut self,
        in_request_line: bool,
    ) -> std::result::Result<HeaderRoom, u16> {
        if self.read_room() > 0 {
            return Ok(HeaderRoom::Ok);
        }
        if self.large_count >= self.max_large {
            return Err(if in_request_line {
                HTTP_URI_TOO_LONG
            } else {
                HTTP_HEADERS_TOO_LARGE
            });
        }
        let delta = self.req_start;
        if self.cap >= self.large_size && delta == 0 {
            // The request alone fills a large buffer.
            return Err(if in_request_line {
                HTTP_URI_TOO_LONG
            } else {
                HTTP_HEADERS_TOO_LARGE
            });
        }
        let mut fresh = Vec::with_capacity(self.large_size);
        fresh.extend_from_slice(&self.hbuf[delta..]);
        self.hbuf = fresh;
        self.cap = self.large_size;
        self.large_count += 1;
        self.parsed -= delta;
        self.req_start = 0;
        Ok(HeaderRoom::Relocated(delta))
    }

    /// Reset between keepalive requests: drop consumed bytes, release the
    /// large buffers, and fall back to the small buffer when the residue
    /// fits it.
    pub fn keepalive_reset(&mut self) {
        self.hbuf.drain(..self.parsed);
        self.parsed = 0;
        self.req_start = 0;
        self.large_count = 0;
        if self.cap > self.small_size && self.hbuf.len() <= self.small_size {
            let mut small = Vec::with_capacity(self.small_size);
            small.extend_from_slice(&self.hbuf);
            self.hbuf = small;
            self.cap = self.small_size;
        }
    }
}
