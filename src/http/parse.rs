//! Streaming HTTP/1.x parsers: request line, header fields, chunked bodies.
//!
//! All three are resumable state machines over the connection's header
//! buffer; runs of uninteresting bytes (header values, chunk extensions,
//! percent-free URI stretches) are skipped with `memchr` rather than
//! walked. They record *spans* (index ranges into the buffer) instead of
//! copying; when the lifecycle layer migrates partial input into a large
//! header buffer it shifts the recorded spans by the relocation offset
//! via `shift`.

use memchr::{memchr, memchr2};

use crate::error::ParseError;
use crate::http::{Method, Version};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    // Saturating: spans not yet recorded sit at zero and must stay there.
    fn shift(&mut self, delta: usize) {
        self.start = self.start.saturating_sub(delta);
        self.end = self.end.saturating_sub(delta);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Need more input.
    Again,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RlState {
    Start,
    Method,
    SpacesBeforeUri,
    Schema,
    SchemaSlash,
    SchemaSlashSlash,
    Host,
    Port,
    Uri,
    /// A space was seen inside the request target area; the next token is
    /// either the HTTP version or more URI.
    CheckVersion,
    VersionH,
    VersionHt,
    VersionHtt,
    VersionHttp,
    VersionSlash,
    VersionMajor,
    VersionDot,
    VersionMinor,
    SpacesAfterVersion,
    AlmostDone,
}

/// Request-line parser. Spans point into the header buffer passed to
/// `parse`; the buffer must only grow (or be relocated via `shift`)
/// between calls.
#[derive(Debug)]
pub struct RequestLineParser {
    state: RlState,
    pub request_start: usize,
    pub request_end: usize,

    pub method_span: Span,
    pub schema_span: Span,
    pub host_span: Span,
    pub port_span: Span,
    pub uri_span: Span,
    /// Offset of the first byte after `?`, absolute into the buffer.
    pub args_start: Option<usize>,

    pub http_major: u8,
    pub http_minor: u8,

    pub complex_uri: bool,
    pub quoted_uri: bool,
    pub plus_in_uri: bool,
    pub space_in_uri: bool,

    /// Set while scanning the path after a '/': a '.' here may be a dot
    /// segment.
    after_slash: bool,
}

impl RequestLineParser {
    pub fn new() -> RequestLineParser {
        RequestLineParser {
            state: RlState::Start,
            request_start: 0,
            request_end: 0,
            method_span: Span::default(),
            schema_span: Span::default(),
            host_span: Span::default(),
            port_span: Span::default(),
            uri_span: Span::default(),
            args_start: None,
            http_major: 0,
            http_minor: 0,
            complex_uri: false,
            quoted_uri: false,
            plus_in_uri: false,
            space_in_uri: false,
            after_slash: false,
        }
    }

    pub fn version(&self) -> Version {
        match (self.http_major, self.http_minor) {
            (0, 9) => Version::Http09,
            (1, 0) => Version::Http10,
            _ => Version::Http11,
        }
    }

    /// Relocate every recorded position after a buffer migration.
    pub fn shift(&mut self, delta: usize) {
        self.request_start = self.request_start.saturating_sub(delta);
        self.request_end = self.request_end.saturating_sub(delta);
        self.method_span.shift(delta);
        self.schema_span.shift(delta);
        self.host_span.shift(delta);
        self.port_span.shift(delta);
        self.uri_span.shift(delta);
        if let Some(args) = self.args_start.as_mut() {
            *args = args.saturating_sub(delta);
        }
    }

    pub fn parse(&mut self, buf: &[u8], cursor: &mut usize) -> Result<ParseStatus, ParseError> {
        let mut i = *cursor;
        while i < buf.len() {
            let c = buf[i];
            match self.state {
                RlState::Start => match c {
                    // Tolerate CRLFs ahead of the request line.
                    b'\r' | b'\n' => {}
                    _ => {
                        self.request_start = i;
                        self.method_span.start = i;
                        self.state = RlState::Method;
                        continue;
                    }
                },

                RlState::Method => match c {
                    b' ' => {
                        self.method_span.end = i;
                        if self.method_span.is_empty() {
                            return Err(ParseError::InvalidMethod);
                        }
                        self.state = RlState::SpacesBeforeUri;
                    }
                    b'A'..=b'Z' | b'_' | b'-' => {}
                    _ => return Err(ParseError::InvalidMethod),
                },

                RlState::SpacesBeforeUri => match c {
                    b' ' => {}
                    b'/' | b'*' => {
                        self.uri_span.start = i;
                        self.after_slash = c == b'/';
                        self.state = RlState::Uri;
                    }
                    b'a'..=b'z' | b'A'..=b'Z' => {
                        self.schema_span.start = i;
                        self.state = RlState::Schema;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::Schema => match c {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'+' | b'-' | b'.' => {}
                    b':' => {
                        self.schema_span.end = i;
                        self.state = RlState::SchemaSlash;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::SchemaSlash => match c {
                    b'/' => self.state = RlState::SchemaSlashSlash,
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::SchemaSlashSlash => match c {
                    b'/' => {
                        self.host_span.start = i + 1;
                        self.state = RlState::Host;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::Host => match c {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => {}
                    b':' => {
                        self.host_span.end = i;
                        self.port_span.start = i + 1;
                        self.state = RlState::Port;
                    }
                    b'/' => {
                        self.host_span.end = i;
                        self.uri_span.start = i;
                        self.after_slash = true;
                        self.state = RlState::Uri;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::Port => match c {
                    b'0'..=b'9' => {}
                    b'/' => {
                        self.port_span.end = i;
                        self.uri_span.start = i;
                        self.after_slash = true;
                        self.state = RlState::Uri;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },

                RlState::Uri => match c {
                    b' ' => {
                        self.uri_span.end = i;
                        self.state = RlState::CheckVersion;
                    }
                    b'\r' => {
                        self.uri_span.end = i;
                        self.http_major = 0;
                        self.http_minor = 9;
                        self.state = RlState::AlmostDone;
                    }
                    b'\n' => {
                        self.uri_span.end = i;
                        self.http_major = 0;
                        self.http_minor = 9;
                        self.request_end = i;
                        *cursor = i + 1;
                        return Ok(ParseStatus::Done);
                    }
                    b'#' => return Err(ParseError::InvalidRequest),
                    b'%' => {
                        self.quoted_uri = true;
                        self.complex_uri = true;
                        self.after_slash = false;
                    }
                    b'+' => {
                        self.plus_in_uri = true;
                        self.after_slash = false;
                    }
                    b'?' => {
                        if self.args_start.is_none() {
                            self.args_start = Some(i + 1);
                        }
                        self.after_slash = false;
                    }
                    b'.' => {
                        if self.after_slash && self.args_start.is_none() {
                            self.complex_uri = true;
                        }
                    }
                    b'/' => {
                        if self.after_slash && self.args_start.is_none() {
                            // "//" collapses during normalization.
                            self.complex_uri = true;
                        }
                        self.after_slash = true;
                    }
                    0x00..=0x1f | 0x7f => return Err(ParseError::InvalidRequest),
                    _ => self.after_slash = false,
                },

                RlState::CheckVersion => match c {
                    b' ' => {}
                    b'H' => self.state = RlState::VersionH,
                    b'\r' => {
                        self.http_major = 0;
                        self.http_minor = 9;
                        self.state = RlState::AlmostDone;
                    }
                    b'\n' => {
                        self.http_major = 0;
                        self.http_minor = 9;
                        self.request_end = i;
                        *cursor = i + 1;
                        return Ok(ParseStatus::Done);
                    }
                    _ => {
                        // The space belonged to the URI after all.
                        self.space_in_uri = true;
                        self.after_slash = false;
                        self.state = RlState::Uri;
                        continue;
                    }
                },

                RlState::VersionH => match c {
                    b'T' => self.state = RlState::VersionHt,
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionHt => match c {
                    b'T' => self.state = RlState::VersionHtt,
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionHtt => match c {
                    b'P' => self.state = RlState::VersionHttp,
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionHttp => match c {
                    b'/' => self.state = RlState::VersionSlash,
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionSlash => match c {
                    b'0'..=b'9' => {
                        self.http_major = c - b'0';
                        self.state = RlState::VersionMajor;
                    }
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionMajor => match c {
                    b'.' => self.state = RlState::VersionDot,
                    b'0'..=b'9' => {
                        self.http_major = self.http_major.saturating_mul(10) + (c - b'0');
                        if self.http_major > 9 {
                            return Err(ParseError::InvalidVersion);
                        }
                    }
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionDot => match c {
                    b'0'..=b'9' => {
                        self.http_minor = c - b'0';
                        self.state = RlState::VersionMinor;
                    }
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::VersionMinor => match c {
                    b'0'..=b'9' => {
                        self.http_minor = self.http_minor.saturating_mul(10) + (c - b'0');
                        if self.http_minor > 99 {
                            return Err(ParseError::InvalidVersion);
                        }
                    }
                    b' ' => self.state = RlState::SpacesAfterVersion,
                    b'\r' => self.state = RlState::AlmostDone,
                    b'\n' => {
                        self.request_end = i;
                        *cursor = i + 1;
                        return Ok(ParseStatus::Done);
                    }
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::SpacesAfterVersion => match c {
                    b' ' => {}
                    b'\r' => self.state = RlState::AlmostDone,
                    b'\n' => {
                        self.request_end = i;
                        *cursor = i + 1;
                        return Ok(ParseStatus::Done);
                    }
                    _ => return Err(ParseError::InvalidVersion),
                },
                RlState::AlmostDone => match c {
                    b'\n' => {
                        self.request_end = i.saturating_sub(1);
                        *cursor = i + 1;
                        return Ok(ParseStatus::Done);
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
            }
            i += 1;
        }
        *cursor = i;
        Ok(ParseStatus::Again)
    }

    pub fn method(&self, buf: &[u8]) -> Result<Method, ParseError> {
        Method::from_token(self.method_span.slice(buf)).ok_or(ParseError::InvalidMethod)
    }
}

impl Default for RequestLineParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HdrState {
    Start,
    Name,
    SpaceBeforeValue,
    Value,
    LineAlmostDone,
    /// CRLF consumed; the next byte decides between obsolete line folding
    /// and a new field.
    LineDone,
    HeadersAlmostDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Again,
    /// One complete field is available in `name`/`value`.
    Field,
    /// The empty line terminating the header block was consumed.
    Done,
}

/// Header-field parser with obsolete-LWS tolerance. Folded continuation
/// lines are rewritten in place (CRLF and leading whitespace become
/// spaces) so the value span stays contiguous.
#[derive(Debug)]
pub struct HeaderParser {
    state: HdrState,
    allow_underscores: bool,

    pub name: Span,
    pub value: Span,
    /// Running hash of the lowercased field name, for the well-known
    /// header table lookup.
    pub name_hash: u64,
    /// The field name contained bytes outside the token alphabet (or an
    /// underscore while those are disabled); the field is recorded but
    /// skipped by validators.
    pub invalid: bool,

    value_end: usize,
}

pub fn header_hash(name: &[u8]) -> u64 {
    name.iter()
        .fold(0u64, |hash, &b| {
            hash.wrapping_mul(31).wrapping_add((b | 0x20) as u64)
        })
}

impl HeaderParser {
    pub fn new(allow_underscores: bool) -> HeaderParser {
        HeaderParser {
            state: HdrState::Start,
            allow_underscores,
            name: Span::default(),
            value: Span::default(),
            name_hash: 0,
            invalid: false,
            value_end: 0,
        }
    }

    pub fn shift(&mut self, delta: usize) {
        self.name.shift(delta);
        self.value.shift(delta);
        self.value_end = self.value_end.saturating_sub(delta);
    }

    fn reset_field(&mut self, at: usize) {
        self.name = Span { start: at, end: at };
        self.value = Span::default();
        self.name_hash = 0;
        self.invalid = false;
        self.value_end = 0;
    }

    pub fn parse(
        &mut self,
        buf: &mut [u8],
        cursor: &mut usize,
    ) -> Result<HeaderStatus, ParseError> {
        let mut i = *cursor;
        while i < buf.len() {
            let c = buf[i];
            match self.state {
                HdrState::Start => match c {
                    b'\r' => self.state = HdrState::HeadersAlmostDone,
                    b'\n' => {
                        *cursor = i + 1;
                        return Ok(HeaderStatus::Done);
                    }
                    _ => {
                        self.reset_field(i);
                        self.state = HdrState::Name;
                        continue;
                    }
                },

                HdrState::Name => match c {
                    b':' => {
                        self.name.end = i;
                        if self.name.is_empty() {
                            return Err(ParseError::InvalidHeader);
                        }
                        self.state = HdrState::SpaceBeforeValue;
                    }
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => {
                        self.name_hash = self
                            .name_hash
                            .wrapping_mul(31)
                            .wrapping_add((c | 0x20) as u64);
                    }
                    b'_' => {
                        if !self.allow_underscores {
                            self.invalid = true;
                        }
                        self.name_hash = self.name_hash.wrapping_mul(31).wrapping_add(b'_' as u64);
                    }
                    b'\r' | b'\n' => return Err(ParseError::InvalidHeader),
                    _ => self.invalid = true,
                },

                HdrState::SpaceBeforeValue => match c {
                    b' ' | b'\t' => {}
                    b'\r' => {
                        self.value = Span { start: i, end: i };
                        self.state = HdrState::LineAlmostDone;
                    }
                    b'\n' => {
                        self.value = Span { start: i, end: i };
                        self.state = HdrState::LineDone;
                    }
                    _ => {
                        self.value.start = i;
                        self.value_end = i + 1;
                        self.state = HdrState::Value;
                    }
                },

                HdrState::Value => match c {
                    b'\r' => self.state = HdrState::LineAlmostDone,
                    b'\n' => self.state = HdrState::LineDone,
                    b' ' | b'\t' => {}
                    _ => {
                        // Jump to the line break; trailing whitespace in
                        // the skipped run does not extend the value.
                        let stop = memchr2(b'\r', b'\n', &buf[i..])
                            .map(|off| i + off)
                            .unwrap_or(buf.len());
                        let mut last = stop;
                        while last > i && matches!(buf[last - 1], b' ' | b'\t') {
                            last -= 1;
                        }
                        self.value_end = last;
                        i = stop;
                        continue;
                    }
                },

                HdrState::LineAlmostDone => match c {
                    b'\n' => self.state = HdrState::LineDone,
                    _ => return Err(ParseError::InvalidHeader),
                },

                HdrState::LineDone => match c {
                    b' ' | b'\t' => {
                        // Obsolete folding: flatten the break in place so
                        // the value span stays one range.
                        let mut back = i;
                        while back > 0 && matches!(buf[back - 1], b'\r' | b'\n') {
                            buf[back - 1] = b' ';
                            back -= 1;
                        }
                        self.state = HdrState::Value;
                    }
                    _ => {
                        self.value.end = self.value_end.max(self.value.start);
                        self.state = HdrState::Start;
                        *cursor = i;
                        return Ok(HeaderStatus::Field);
                    }
                },

                HdrState::HeadersAlmostDone => match c {
                    b'\n' => {
                        *cursor = i + 1;
                        return Ok(HeaderStatus::Done);
                    }
                    _ => return Err(ParseError::InvalidHeader),
                },
            }
            i += 1;
        }
        *cursor = i;
        Ok(HeaderStatus::Again)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeAlmostDone,
    Extension,
    Data,
    DataAfter,
    DataAfterAlmostDone,
    LastExtension,
    LastAlmostDone,
    Trailer,
    TrailerAlmostDone,
    TrailerLine,
    TrailerLineAlmostDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEvent {
    Again,
    /// A window of chunk payload is available at `start..end`.
    Data { start: usize, end: usize },
    Done,
}

/// Chunked transfer-coding parser. Emits payload windows as they become
/// available; a chunk whose size line straddles a read boundary resumes
/// mid-number.
#[derive(Debug)]
pub struct ChunkedParser {
    state: ChunkState,
    size: u64,
    seen_digit: bool,
    /// Total payload bytes seen, for the body-size ceiling.
    pub received: u64,
}

impl ChunkedParser {
    pub fn new() -> ChunkedParser {
        ChunkedParser {
            state: ChunkState::Size,
            size: 0,
            seen_digit: false,
            received: 0,
        }
    }

    pub fn parse(&mut self, buf: &[u8], cursor: &mut usize) -> Result<ChunkEvent, ParseError> {
        let mut i = *cursor;
        while i < buf.len() {
            let c = buf[i];
            match self.state {
                ChunkState::Size => match c {
                    b'0'..=b'9' => {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add((c - b'0') as u64))
                            .ok_or(ParseError::InvalidChunk)?;
                        self.seen_digit = true;
                    }
                    b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (c | 0x20) - b'a' + 10;
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit as u64))
                            .ok_or(ParseError::InvalidChunk)?;
                        self.seen_digit = true;
                    }
                    b';' if self.seen_digit => {
                        self.state = if self.size == 0 {
                            ChunkState::LastExtension
                        } else {
                            ChunkState::Extension
                        };
                    }
                    b'\r' if self.seen_digit => {
                        self.state = if self.size == 0 {
                            ChunkState::LastAlmostDone
                        } else {
                            ChunkState::SizeAlmostDone
                        };
                    }
                    _ => return Err(ParseError::InvalidChunk),
                },

                ChunkState::SizeAlmostDone => match c {
                    b'\n' => self.state = ChunkState::Data,
                    _ => return Err(ParseError::InvalidChunk),
                },

                ChunkState::Extension => match c {
                    b'\r' => self.state = ChunkState::SizeAlmostDone,
                    b'\n' => self.state = ChunkState::Data,
                    _ => {
                        i = memchr2(b'\r', b'\n', &buf[i..])
                            .map(|off| i + off)
                            .unwrap_or(buf.len());
                        continue;
                    }
                },

                ChunkState::Data => {
                    let available = buf.len() - i;
                    let take = (self.size as usize).min(available);
                    let start = i;
                    let end = i + take;
                    self.size -= take as u64;
                    self.received += take as u64;
                    if self.size == 0 {
                        self.state = ChunkState::DataAfter;
                        self.seen_digit = false;
                    }
                    *cursor = end;
                    return Ok(ChunkEvent::Data { start, end });
                }

                ChunkState::DataAfter => match c {
                    b'\r' => self.state = ChunkState::DataAfterAlmostDone,
                    b'\n' => self.state = ChunkState::Size,
                    _ => return Err(ParseError::InvalidChunk),
                },

                ChunkState::DataAfterAlmostDone => match c {
                    b'\n' => self.state = ChunkState::Size,
                    _ => return Err(ParseError::InvalidChunk),
                },

                ChunkState::LastExtension => match c {
                    b'\r' => self.state = ChunkState::LastAlmostDone,
                    b'\n' => self.state = ChunkState::Trailer,
                    _ => {
                        i = memchr2(b'\r', b'\n', &buf[i..])
                            .map(|off| i + off)
                            .unwrap_or(buf.len());
                        continue;
                    }
                },

                ChunkState::LastAlmostDone => match c {
                    b'\n' => self.state = ChunkState::Trailer,
                    _ => return Err(ParseError::InvalidChunk),
                },

                ChunkState::Trailer => match c {
                    b'\r' => self.state = ChunkState::TrailerAlmostDone,
                    b'\n' => {
                        *cursor = i + 1;
                        return Ok(ChunkEvent::Done);
                    }
                    _ => self.state = ChunkState::TrailerLine,
                },

                ChunkState::TrailerAlmostDone => match c {
                    b'\n' => {
                        *cursor = i + 1;
                        return Ok(ChunkEvent::Done);
                    }
                    _ => return Err(ParseError::InvalidChunk),
                },

                // Trailer fields are tolerated and dropped.
                ChunkState::TrailerLine => match c {
                    b'\r' => self.state = ChunkState::TrailerLineAlmostDone,
                    b'\n' => self.state = ChunkState::Trailer,
                    _ => {
                        i = memchr2(b'\r', b'\n', &buf[i..])
                            .map(|off| i + off)
                            .unwrap_or(buf.len());
                        continue;
                    }
                },

                ChunkState::TrailerLineAlmostDone => match c {
                    b'\n' => self.state = ChunkState::Trailer,
                    _ => return Err(ParseError::InvalidChunk),
                },
            }
            i += 1;
        }
        *cursor = i;
        Ok(ChunkEvent::Again)
    }
}

impl Default for ChunkedParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode and canonicalize a raw URI path: percent-decoding, dot-segment
/// resolution, optional slash merging. Fails when traversal escapes the
/// root. Idempotent: normalizing a normalized path is the identity.
pub fn normalize_uri(raw: &[u8], merge_slashes: bool) -> Result<String, ParseError> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = memchr(b'%', rest) {
        decoded.extend_from_slice(&rest[..pos]);
        let hi = rest.get(pos + 1).and_then(|b| hex_value(*b));
        let lo = rest.get(pos + 2).and_then(|b| hex_value(*b));
        match (hi, lo) {
            (Some(hi), Some(lo)) => {
                let byte = hi * 16 + lo;
                if byte == 0 {
                    return Err(ParseError::InvalidRequest);
                }
                decoded.push(byte);
            }
            _ => return Err(ParseError::InvalidRequest),
        }
        rest = &rest[pos + 3..];
    }
    decoded.extend_from_slice(rest);

    if decoded.first() != Some(&b'/') {
        // "*" (OPTIONS) passes through untouched.
        if decoded == b"*" {
            return Ok("*".to_string());
        }
        return Err(ParseError::InvalidRequest);
    }

    // Segment-wise dot resolution over the decoded path.
    let mut segments: Vec<&[u8]> = Vec::new();
    let mut directory = true;
    for segment in decoded[1..].split(|&b| b == b'/') {
        match segment {
            b"" => {
                // From "//" or a trailing slash; kept only when slash
                // merging is off and it is not the trailing empty piece.
                directory = true;
                if !merge_slashes {
                    segments.push(segment);
                }
            }
            b"." => directory = true,
            b".." => {
                directory = true;
                loop {
                    // Traversal above the root is rejected outright.
                    match segments.pop() {
                        None => return Err(ParseError::InvalidRequest),
                        Some(b"") => continue,
                        Some(_) => break,
                    }
                }
            }
            _ => {
                directory = false;
                segments.push(segment);
            }
        }
    }
    if !merge_slashes {
        while segments.last() == Some(&&b""[..]) {
            segments.pop();
        }
    }

    let mut out: Vec<u8> = Vec::with_capacity(decoded.len());
    out.push(b'/');
    for (n, segment) in segments.iter().enumerate() {
        if n > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(segment);
    }
    if directory && out.last() != Some(&b'/') {
        out.push(b'/');
    }

    String::from_utf8(out).map_err(|_| ParseError::InvalidRequest)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// File extension of a normalized path, empty when the final segment has
/// no dot.
pub fn uri_extension(uri: &str) -> &str {
    let segment = uri.rsplit('/').next().unwrap_or("");
    match segment.rfind('.') {
        Some(dot) if dot + 1 < segment.len() => &segment[dot + 1..],
        _ => "",
    }
}
