//! Conditional-request header filter: turns a 200 carrying validators
//! into a 304 when the client's copy is current.

use std::time::SystemTime;

use crate::http::filter::FilterCode;
use crate::http::Method;
use crate::prelude::*;

pub fn header_filter(w: &mut Worker, at: usize, rid: Rid) -> FilterCode {
    if let Some(request) = w.req_mut(rid) {
        let applicable = request.parent.is_none()
            && request.headers_out.status == HTTP_OK
            && matches!(request.method, Method::Get | Method::Head)
            && (request.headers_in.if_modified_since.is_some()
                || request.headers_in.if_none_match.is_some());

        if applicable && entity_is_current(request) {
            request.headers_out.status = HTTP_NOT_MODIFIED;
            request.headers_out.status_line = None;
            request.headers_out.content_length = None;
            request.headers_out.content_type = None;
            request.headers_out.chunked = false;
            request.header_only = true;
        }
    }
    w.next_header_filter(at + 1, rid)
}

fn entity_is_current(request: &crate::http::request::Request) -> bool {
    if let (Some(expected), Some(etag)) = (
        request.headers_in.if_none_match.as_deref(),
        request.headers_out.etag.as_deref(),
    ) {
        return expected == "*" || expected.split(',').any(|tag| tag.trim() == etag);
    }
    match (
        request.headers_in.if_modified_since,
        request.headers_out.last_modified,
    ) {
        (Some(since), Some(modified)) => at_second(modified) <= at_second(since),
        _ => false,
    }
}

/// Validators have one-second granularity on the wire.
fn at_second(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
