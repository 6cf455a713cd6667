//! Chunked transfer-coding filter: frames HTTP/1.1 responses with no
//! declared length and emits the terminating zero chunk on last-buffer.

use crate::buf::{chain_len, Buf, BufTag, Chain};
use crate::http::filter::FilterCode;
use crate::http::Version;
use crate::prelude::*;

pub fn header_filter(w: &mut Worker, at: usize, rid: Rid) -> FilterCode {
    if let Some(request) = w.req_mut(rid) {
        if request.parent.is_none() && !request.header_only {
            let status = request.headers_out.status;
            let has_body =
                status != HTTP_NOT_MODIFIED && status != 204 && !(100..200).contains(&status);
            if has_body && request.headers_out.content_length.is_none() {
                match request.version {
                    Version::Http11 => {
                        request.headers_out.chunked = true;
                        request.chunked_out = true;
                    }
                    // Older protocols delimit by connection close.
                    _ => request.keepalive = false,
                }
            }
        }
    }
    w.next_header_filter(at + 1, rid)
}

pub fn body_filter(w: &mut Worker, at: usize, rid: Rid, mut chain: Chain) -> FilterCode {
    let framing = match w.req(rid) {
        Some(request) => request.chunked_out && request.parent.is_none(),
        None => return FilterCode::Error,
    };
    if !framing {
        return w.next_body_filter(at + 1, rid, chain);
    }

    let size = chain_len(&chain);
    let mut saw_last = false;
    let mut saw_flush = false;
    let mut data = Chain::new();
    for mut buf in chain.drain(..) {
        if buf.last_buf {
            saw_last = true;
            buf.last_buf = false;
        }
        if buf.flush {
            saw_flush = true;
            buf.flush = false;
        }
        if buf.is_empty() {
            continue;
        }
        data.push_back(buf);
    }

    let mut framed = Chain::new();
    if size > 0 {
        let mut head = Buf::mem(format!("{size:x}\r\n").into_bytes());
        head.tag = BufTag::Chunked;
        framed.push_back(head);
        framed.append(&mut data);
        let mut tail = Buf::mem(b"\r\n".to_vec());
        tail.tag = BufTag::Chunked;
        framed.push_back(tail);
    }
    if saw_last {
        let mut zero = Buf::mem(b"0\r\n\r\n".to_vec());
        zero.tag = BufTag::Chunked;
        zero.last_buf = true;
        framed.push_back(zero);
    } else if saw_flush {
        match framed.back_mut() {
            Some(back) => back.flush = true,
            None => framed.push_back(Buf::flush_marker()),
        }
    }
    if framed.is_empty() {
        return FilterCode::Ok;
    }
    w.next_body_filter(at + 1, rid, framed)
}
