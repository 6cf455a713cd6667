pub use crate::buf::{Buf, BufTag, Chain};
pub use crate::error::{ParseError, Result, ServerError};
pub use crate::event::{EvId, EvKind};
pub use crate::http::{Method, Version};
pub use crate::worker::{Rid, Worker};

pub use std::collections::{HashMap, VecDeque};
pub use std::sync::Arc;

pub use tracing::{debug, error, info, trace, warn};

// 1xx/2xx/3xx
pub const HTTP_CONTINUE: u16 = 100;
pub const HTTP_OK: u16 = 200;
pub const HTTP_PARTIAL_CONTENT: u16 = 206;
pub const HTTP_MOVED_PERMANENTLY: u16 = 301;
pub const HTTP_FOUND: u16 = 302;
pub const HTTP_NOT_MODIFIED: u16 = 304;

// 4xx
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_LENGTH_REQUIRED: u16 = 411;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_URI_TOO_LONG: u16 = 414;
pub const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;

// Non-standard statuses shared with the original implementation. 499 is
// logged, never written to the peer; 494 is rewritten to 400 on the wire.
pub const HTTP_CLIENT_CLOSED_REQUEST: u16 = 499;
pub const HTTP_HEADERS_TOO_LARGE: u16 = 494;

// 5xx
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;
pub const HTTP_GATEWAY_TIMEOUT: u16 = 504;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;
