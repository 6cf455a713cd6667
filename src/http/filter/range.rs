//! Range filter: answers `Range: bytes=…` with a single 206 partial
//! response (rewriting buffer windows in place, zero-copy for file
//! buffers) or a multipart/byteranges body for multiple ranges.

use std::rc::Rc;

use crate::buf::{Buf, BufKind, Chain};
use crate::http::filter::FilterCode;
use crate::http::Method;
use crate::prelude::*;

pub fn header_filter(w: &mut Worker, at: usize, rid: Rid) -> FilterCode {
    let now_ms = w.clock.now_ms;
    if let Some(request) = w.req_mut(rid) {
        let applicable = request.parent.is_none()
            && request.headers_out.status == HTTP_OK
            && matches!(request.method, Method::Get | Method::Head)
            && !request.headers_out.chunked;

        if applicable {
            if let (Some(total), Some(header)) = (
                request.headers_out.content_length,
                request.headers_in.range.clone(),
            ) {
                match parse_ranges(&header, total) {
                    RangeSet::Ignore => {}
                    RangeSet::Unsatisfiable => {
                        request.headers_out.status = HTTP_RANGE_NOT_SATISFIABLE;
                        request.headers_out.status_line = None;
                        request.headers_out.content_range = Some(format!("bytes */{total}"));
                        request.headers_out.content_length = Some(0);
                        request.headers_out.content_type = None;
                        request.header_only = true;
                    }
                    RangeSet::Single(start, end) => {
                        request.headers_out.status = HTTP_PARTIAL_CONTENT;
                        request.headers_out.status_line = None;
                        request.headers_out.content_range =
                            Some(format!("bytes {}-{}/{}", start, end - 1, total));
                        request.headers_out.content_length = Some(end - start);
                        request.ranges = vec![(start, end)];
                    }
                    RangeSet::Multi(ranges) => {
                        let boundary = format!("{:016x}{:08x}", now_ms, rid.conn);
                        request.headers_out.status = HTTP_PARTIAL_CONTENT;
                        request.headers_out.status_line = None;
                        request.range_entity_type = request.headers_out.content_type.take();
                        request.headers_out.content_type = Some(format!(
                            "multipart/byteranges; boundary={boundary}"
                        ));
                        // Length of the framed body is not precomputed;
                        // the chunked filter (or connection close) frames
                        // the response.
                        request.headers_out.content_length = None;
                        request.range_boundary = Some(boundary);
                        request.range_total = total;
                        request.ranges = ranges;
                    }
                }
            }
        }
    }
    w.next_header_filter(at + 1, rid)
}

enum RangeSet {
    /// Malformed header: serve the full entity.
    Ignore,
    Unsatisfiable,
    Single(u64, u64),
    Multi(Vec<(u64, u64)>),
}

/// Parse `bytes=a-b,c-,-d` against the entity length. Ranges are
/// half-open `(start, end)` internally.
fn parse_ranges(header: &str, total: u64) -> RangeSet {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeSet::Ignore;
    };
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let Some((from, to)) = part.split_once('-') else {
            return RangeSet::Ignore;
        };
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() {
            // Suffix form: last N bytes.
            let Ok(suffix) = to.parse::<u64>() else {
                return RangeSet::Ignore;
            };
            if suffix == 0 {
                continue;
            }
            let start = total.saturating_sub(suffix);
            if start < total {
                ranges.push((start, total));
            }
            continue;
        }
        let Ok(start) = from.parse::<u64>() else {
            return RangeSet::Ignore;
        };
        let end = if to.is_empty() {
            total
        } else {
            match to.parse::<u64>() {
                // The wire form is inclusive.
                Ok(last) => last.saturating_add(1).min(total),
                Err(_) => return RangeSet::Ignore,
            }
        };
        if start < end && start < total {
            ranges.push((start, end.min(total)));
        }
    }
    match ranges.len() {
        0 => RangeSet::Unsatisfiable,
        1 => RangeSet::Single(ranges[0].0, ranges[0].1),
        _ => RangeSet::Multi(ranges),
    }
}

pub fn body_filter(w: &mut Worker, at: usize, rid: Rid, chain: Chain) -> FilterCode {
    let plan = {
        let Some(request) = w.req(rid) else {
            return FilterCode::Error;
        };
        if request.ranges.is_empty() {
            Plan::Pass
        } else if request.range_boundary.is_some() {
            Plan::Multi
        } else {
            Plan::Single(request.ranges[0])
        }
    };

    match plan {
        Plan::Pass => w.next_body_filter(at + 1, rid, chain),
        Plan::Single(range) => {
            let chain = {
                let Some(request) = w.req_mut(rid) else {
                    return FilterCode::Error;
                };
                slice_single(request, range, chain)
            };
            w.next_body_filter(at + 1, rid, chain)
        }
        Plan::Multi => {
            let framed = {
                let Some(request) = w.req_mut(rid) else {
                    return FilterCode::Error;
                };
                accumulate_multipart(request, chain)
            };
            match framed {
                Some(chain) => w.next_body_filter(at + 1, rid, chain),
                None => FilterCode::Ok,
            }
        }
    }
}

enum Plan {
    Pass,
    Single((u64, u64)),
    Multi,
}

/// Trim the incoming chain to the single requested window, tracking the
/// running entity offset across calls. File buffers are adjusted in
/// place — no bytes are copied.
fn slice_single(
    request: &mut crate::http::request::Request,
    (start, end): (u64, u64),
    mut chain: Chain,
) -> Chain {
    let mut out = Chain::new();
    for mut buf in chain.drain(..) {
        if buf.special() {
            out.push_back(buf);
            continue;
        }
        let len = buf.len() as u64;
        let buf_start = request.range_offset;
        let buf_end = buf_start + len;
        request.range_offset = buf_end;

        let from = start.max(buf_start);
        let to = end.min(buf_end);
        if from >= to {
            continue;
        }
        let skip = (from - buf_start) as usize;
        let take = (to - from) as usize;
        if buf.in_file && !buf.in_memory() {
            buf.file_pos += skip as u64;
            buf.file_last = buf.file_pos + take as u64;
        } else {
            buf.pos += skip;
            buf.last = buf.pos + take;
        }
        out.push_back(buf);
    }
    out
}

/// Collect the entity; on last-buffer, emit every part with its own
/// `Content-Range` header, separated by the boundary.
fn accumulate_multipart(
    request: &mut crate::http::request::Request,
    mut chain: Chain,
) -> Option<Chain> {
    let mut saw_last = false;
    for buf in chain.drain(..) {
        if buf.last_buf {
            saw_last = true;
        }
        if buf.special() {
            continue;
        }
        request.range_entity.push_back(buf);
    }
    if !saw_last {
        return None;
    }

    let boundary = request.range_boundary.clone().unwrap_or_default();
    let total = request.range_total;
    let content_type = request.range_entity_type.clone();

    let mut out = Chain::new();
    let ranges = request.ranges.clone();
    for &(start, end) in &ranges {
        let mut part = format!("\r\n--{boundary}\r\n");
        if let Some(content_type) = &content_type {
            part.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        part.push_str(&format!(
            "Content-Range: bytes {}-{}/{}\r\n\r\n",
            start,
            end - 1,
            total
        ));
        out.push_back(Buf::mem(part.into_bytes()));
        for buf in extract_window(&request.range_entity, start, end) {
            out.push_back(buf);
        }
    }
    let mut trailer = Buf::mem(format!("\r\n--{boundary}--\r\n").into_bytes());
    trailer.last_buf = true;
    out.push_back(trailer);
    request.range_entity.clear();
    Some(out)
}

/// Copy-free projection of `start..end` out of the accumulated entity:
/// file windows are re-sliced, memory windows are copied.
fn extract_window(entity: &Chain, start: u64, end: u64) -> Vec<Buf> {
    let mut parts = Vec::new();
    let mut offset = 0u64;
    for buf in entity.iter() {
        let len = buf.len() as u64;
        let buf_start = offset;
        let buf_end = offset + len;
        offset = buf_end;

        let from = start.max(buf_start);
        let to = end.min(buf_end);
        if from >= to {
            continue;
        }
        let skip = (from - buf_start) as usize;
        let take = (to - from) as usize;
        match &buf.kind {
            BufKind::File(file) => {
                parts.push(Buf::file(
                    Rc::clone(file),
                    buf.file_pos + skip as u64,
                    buf.file_pos + (skip + take) as u64,
                ));
            }
            BufKind::Shared(shared) => {
                let mut slice = Buf::shared(Rc::clone(shared));
                slice.pos = buf.pos + skip;
                slice.last = slice.pos + take;
                parts.push(slice);
            }
            BufKind::Mem(bytes) => {
                parts.push(Buf::mem(
                    bytes[buf.pos + skip..buf.pos + skip + take].to_vec(),
                ));
            }
            BufKind::Sentinel => {}
        }
    }
    parts
}
