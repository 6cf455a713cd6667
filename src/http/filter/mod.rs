//! The output filter chains.
//!
//! Filters are collected in declaration order — innermost (the wire
//! writers) first — and the builder reverses the list, so execution runs
//! outermost-first and the earliest-declared filter touches the socket.
//!
//! Body execution order: range → copy → postpone → chunked → write.
//! Header execution order: not_modified → range → chunked → writer.

pub mod chunked;
pub mod copy;
pub mod headers_out;
pub mod not_modified;
pub mod postpone;
pub mod range;
pub mod write;

use crate::buf::Chain;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCode {
    /// Input fully handed on (possibly buffered downstream).
    Ok,
    /// Backpressure: re-enter when the write side drains.
    Again,
    Error,
}

pub type BodyFilterFn = fn(&mut Worker, usize, Rid, Chain) -> FilterCode;
pub type HeaderFilterFn = fn(&mut Worker, usize, Rid) -> FilterCode;

pub struct FilterChains {
    pub header: Vec<HeaderFilterFn>,
    pub body: Vec<BodyFilterFn>,
}

/// Collects filters innermost-first; `build` freezes the execution order.
#[derive(Default)]
pub struct FilterRegistry {
    header: Vec<HeaderFilterFn>,
    body: Vec<BodyFilterFn>,
}

impl FilterRegistry {
    pub fn new() -> FilterRegistry {
        FilterRegistry::default()
    }

    /// The built-in stack.
    pub fn standard() -> FilterRegistry {
        let mut registry = FilterRegistry::new();
        registry.body(write::body_filter);
        registry.body(chunked::body_filter);
        registry.body(postpone::body_filter);
        registry.body(copy::body_filter);
        registry.body(range::body_filter);

        registry.header(headers_out::header_writer);
        registry.header(chunked::header_filter);
        registry.header(range::header_filter);
        registry.header(not_modified::header_filter);
        registry
    }

    pub fn body(&mut self, filter: BodyFilterFn) {
        self.body.push(filter);
    }

    pub fn header(&mut self, filter: HeaderFilterFn) {
        self.header.push(filter);
    }

    pub fn build(mut self) -> FilterChains {
        self.header.reverse();
        self.body.reverse();
        FilterChains {
            header: self.header,
            body: self.body,
        }
    }
}

impl Worker {
    /// Run the header filter chain once. Idempotent per request; the
    /// serializer at the end of the chain sets `header_sent`.
    pub fn send_header(&mut self, rid: Rid) -> FilterCode {
        let already_sent = match self.req(rid) {
            Some(request) => request.header_sent && request.is_main(),
            None => return FilterCode::Error,
        };
        if already_sent {
            return FilterCode::Ok;
        }
        self.next_header_filter(0, rid)
    }

    pub fn next_header_filter(&mut self, at: usize, rid: Rid) -> FilterCode {
        let rt = Arc::clone(&self.rt);
        match rt.filters.header.get(at) {
            Some(filter) => filter(self, at, rid),
            None => FilterCode::Ok,
        }
    }

    /// Feed a body chain into the filter stack from the top.
    pub fn output_filter(&mut self, rid: Rid, chain: Chain) -> FilterCode {
        let code = self.next_body_filter(0, rid, chain);
        if code == FilterCode::Error {
            if let Some(request) = self.req_mut(rid) {
                request.filter_finalize = true;
            }
            if let Some(conn) = self.conns.get_mut(rid.conn) {
                conn.error = true;
            }
        }
        code
    }

    pub fn next_body_filter(&mut self, at: usize, rid: Rid, chain: Chain) -> FilterCode {
        let rt = Arc::clone(&self.rt);
        match rt.filters.body.get(at) {
            Some(filter) => filter(self, at, rid, chain),
            None => FilterCode::Ok,
        }
    }
}
