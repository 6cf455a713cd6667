//! The postpone filter: enforces byte-exact response ordering across a
//! request tree. Output from a request that does not own the wire is
//! parked on its postponed list; the active writer drains buffered data
//! ahead of it and hands the wire to the next pending subrequest.

use crate::buf::Chain;
use crate::http::filter::FilterCode;
use crate::http::request::{Postponed, BUFFERED_POSTPONED};
use crate::prelude::*;

pub fn body_filter(w: &mut Worker, at: usize, rid: Rid, mut chain: Chain) -> FilterCode {
    let active = w
        .conns
        .get(rid.conn)
        .and_then(|c| c.http.as_ref())
        .and_then(|h| h.active);
    let is_active = active == Some(rid.req);

    if !is_active {
        // Not this request's turn: park the bytes.
        let Some(request) = w.req_mut(rid) else {
            return FilterCode::Error;
        };
        if !chain.is_empty() {
            trace!(req = rid.req, "postponing output while wire is owned elsewhere");
            park(request, chain);
            request.buffered |= BUFFERED_POSTPONED;
        }
        return FilterCode::Ok;
    }

    let has_postponed = match w.req(rid) {
        Some(request) => !request.postponed.is_empty(),
        None => return FilterCode::Error,
    };
    if !has_postponed {
        return w.next_body_filter(at + 1, rid, chain);
    }

    // The request's own fresh output queues behind everything already
    // postponed, preserving emission order.
    if !chain.is_empty() {
        let Some(request) = w.req_mut(rid) else {
            return FilterCode::Error;
        };
        park(request, chain);
    }

    loop {
        let front = {
            let Some(request) = w.req_mut(rid) else {
                return FilterCode::Error;
            };
            let is_data = match request.postponed.front() {
                None => {
                    request.buffered &= !BUFFERED_POSTPONED;
                    return FilterCode::Ok;
                }
                Some(Postponed::Sub(_)) => false,
                Some(Postponed::Data(_)) => true,
            };
            if is_data {
                match request.postponed.pop_front() {
                    Some(Postponed::Data(data)) => Some(data),
                    _ => unreachable!("front was data"),
                }
            } else {
                None
            }
        };

        match front {
            Some(data) => {
                if w.next_body_filter(at + 1, rid, data) == FilterCode::Error {
                    return FilterCode::Error;
                }
            }
            None => {
                // A subrequest is next in line: it takes the wire and is
                // woken; this request stops writing until it finishes.
                let sub = {
                    let Some(request) = w.req(rid) else {
                        return FilterCode::Error;
                    };
                    match request.postponed.front() {
                        Some(Postponed::Sub(sub)) => *sub,
                        _ => unreachable!("front was a subrequest"),
                    }
                };
                if let Some(http) = w.conns.get_mut(rid.conn).and_then(|c| c.http.as_mut()) {
                    http.active = Some(sub);
                }
                w.post_request(Rid::new(rid.conn, sub));
                return FilterCode::Ok;
            }
        }
    }
}

fn park(request: &mut crate::http::request::Request, mut chain: Chain) {
    match request.postponed.back_mut() {
        Some(Postponed::Data(existing)) => existing.append(&mut chain),
        _ => request.postponed.push_back(Postponed::Data(chain)),
    }
}
