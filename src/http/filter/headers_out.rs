//! The header writer: the last header filter. Serializes the status line
//! and response headers into a buffer chain and hands it to the write
//! filter, so headers and body leave through the same path.

use std::time::UNIX_EPOCH;

use crate::buf::{Buf, BufTag, Chain};
use crate::http::filter::FilterCode;
use crate::http::{status_text, Version};
use crate::prelude::*;

const SERVER_NAME: &str = concat!("server_core/", env!("CARGO_PKG_VERSION"));
const SERVER_NAME_BARE: &str = "server_core";

pub fn header_writer(w: &mut Worker, _at: usize, rid: Rid) -> FilterCode {
    let server_tokens = w.rt.http.server_tokens;
    let date = w.clock.http_date().to_string();

    let (bytes, last_buf) = {
        let Some(request) = w.req_mut(rid) else {
            return FilterCode::Error;
        };
        // Only the main request speaks on the wire; subrequest "headers"
        // are internal bookkeeping.
        if request.parent.is_some() {
            return FilterCode::Ok;
        }
        if request.header_sent {
            return FilterCode::Ok;
        }
        request.header_sent = true;

        // An HTTP/0.9 response is the bare body.
        if request.version == Version::Http09 {
            return FilterCode::Ok;
        }

        let err_status = request.err_status;
        let out = &request.headers_out;
        // An error_page redirect without a status override keeps the
        // original error status regardless of what the fallback handler
        // produced.
        let status = err_status.unwrap_or(if out.status == 0 { HTTP_OK } else { out.status });
        let mut text = String::with_capacity(256);
        match &out.status_line {
            Some(line) => {
                text.push_str("HTTP/1.1 ");
                text.push_str(line);
            }
            None => {
                text.push_str(&format!("HTTP/1.1 {} {}", status, status_text(status)));
            }
        }
        text.push_str("\r\n");

        text.push_str("Server: ");
        text.push_str(if server_tokens {
            SERVER_NAME
        } else {
            SERVER_NAME_BARE
        });
        text.push_str("\r\nDate: ");
        text.push_str(&date);
        text.push_str("\r\n");

        if let Some(content_type) = &out.content_type {
            text.push_str("Content-Type: ");
            text.push_str(content_type);
            text.push_str("\r\n");
        }
        if let Some(length) = out.content_length {
            text.push_str(&format!("Content-Length: {length}\r\n"));
        }
        if let Some(modified) = out.last_modified {
            if modified.duration_since(UNIX_EPOCH).is_ok() {
                text.push_str("Last-Modified: ");
                text.push_str(&httpdate::fmt_http_date(modified));
                text.push_str("\r\n");
            }
        }
        if let Some(etag) = &out.etag {
            text.push_str("ETag: ");
            text.push_str(etag);
            text.push_str("\r\n");
        }
        if let Some(location) = &out.location {
            text.push_str("Location: ");
            text.push_str(location);
            text.push_str("\r\n");
        }
        if let Some(content_range) = &out.content_range {
            text.push_str("Content-Range: ");
            text.push_str(content_range);
            text.push_str("\r\n");
        }
        if out.accept_ranges {
            text.push_str("Accept-Ranges: bytes\r\n");
        }
        if out.chunked {
            text.push_str("Transfer-Encoding: chunked\r\n");
        }
        for (name, value) in &out.extra {
            text.push_str(name);
            text.push_str(": ");
            text.push_str(value);
            text.push_str("\r\n");
        }
        text.push_str("Connection: ");
        text.push_str(if request.keepalive { "keep-alive" } else { "close" });
        text.push_str("\r\n\r\n");

        // When no body follows, the header block terminates the response.
        let bodyless = request.header_only
            || status == HTTP_NOT_MODIFIED
            || status == 204
            || (100..200).contains(&status);
        (text.into_bytes(), bodyless)
    };

    // No flush bit: a header block small enough to batch rides out with
    // the first body chunk.
    let mut buf = Buf::mem(bytes);
    buf.tag = BufTag::Header;
    buf.last_buf = last_buf;
    let mut chain = Chain::new();
    chain.push_back(buf);

    // Straight to the write filter: intermediate body filters must not
    // reframe the header bytes.
    let write_at = w.rt.filters.body.len().saturating_sub(1);
    w.next_body_filter(write_at, rid, chain)
}
