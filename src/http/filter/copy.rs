//! The copy filter: decides, per buffer, between passing file-backed
//! output through to sendfile and materializing it into the request's
//! pool of reusable temporary buffers.
//!
//! Starvation of the temporary pool surfaces as `Again`; the writer
//! re-enters this filter once the write filter drains the pending chain
//! and the consumed buffers come back through the recycling lists.

use std::io;

use crate::buf::{update_chains, Buf, BufKind, BufTag, Chain};
use crate::http::filter::FilterCode;
use crate::http::request::BUFFERED_COPY;
use crate::prelude::*;

pub fn body_filter(w: &mut Worker, at: usize, rid: Rid, chain: Chain) -> FilterCode {
    let buffers = w.rt.http.output_buffers;
    let pass_files = w.rt.http.sendfile && cfg!(target_os = "linux");

    // Buffers the wire finished with come home first.
    let drained = w
        .conns
        .get_mut(rid.conn)
        .map(|conn| std::mem::take(&mut conn.drained));

    let (out, starved) = {
        let Some(request) = w.req_mut(rid) else {
            return FilterCode::Error;
        };
        if let Some(mut drained) = drained {
            request.out_busy.append(&mut drained);
        }
        update_chains(&mut request.out_busy, &mut request.out_free, BufTag::Copy);

        // Unfinished input from the previous pass goes ahead of new data.
        let mut input = std::mem::take(&mut request.copy_pending);
        input.extend(chain);

        let mut out = Chain::new();
        let mut starved = false;
        while let Some(mut buf) = input.pop_front() {
            if buf.special() || buf.in_memory() || (buf.in_file && pass_files) {
                out.push_back(buf);
                continue;
            }

            // File window that must be present in memory.
            let mut failed = false;
            while buf.len() > 0 {
                let Some(mut temp) = take_temp(request, buffers.count, buffers.size) else {
                    starved = true;
                    break;
                };
                match fill_from_file(&buf, &mut temp) {
                    Ok(copied) => {
                        buf.file_pos += copied as u64;
                        temp.recycled = true;
                        out.push_back(temp);
                    }
                    Err(e) => {
                        debug!(error = %e, "file read failed in copy filter");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                return FilterCode::Error;
            }
            if buf.len() > 0 {
                // Out of temporaries mid-window: resume here later. The
                // last buffer's bit moves with the remainder.
                input.push_front(buf);
                request.copy_pending = input;
                request.buffered |= BUFFERED_COPY;
                break;
            }
            if buf.last_buf {
                match out.back_mut() {
                    Some(back) => back.last_buf = true,
                    None => out.push_back(Buf::last()),
                }
            }
        }
        if !starved {
            request.buffered &= !BUFFERED_COPY;
        }
        (out, starved)
    };

    let code = if out.is_empty() {
        FilterCode::Ok
    } else {
        w.next_body_filter(at + 1, rid, out)
    };
    match code {
        FilterCode::Error => FilterCode::Error,
        _ if starved => FilterCode::Again,
        code => code,
    }
}

/// A temporary buffer from the free list, or a fresh one while the
/// configured count allows.
fn take_temp(
    request: &mut crate::http::request::Request,
    count: usize,
    size: usize,
) -> Option<Buf> {
    if let Some(buf) = request.out_free.pop() {
        return Some(buf);
    }
    if request.copy_allocated < count {
        request.copy_allocated += 1;
        return Some(Buf::with_capacity(size, BufTag::Copy));
    }
    None
}

fn fill_from_file(src: &Buf, temp: &mut Buf) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let BufKind::File(file) = &src.kind else {
        return Err(io::ErrorKind::InvalidInput.into());
    };
    let window = src.len().min(temp.room());
    let mut scratch = vec![0u8; window];
    let mut filled = 0;
    while filled < window {
        let read = file.read_at(&mut scratch[filled..], src.file_pos + filled as u64)?;
        if read == 0 {
            // The file shrank underneath us.
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += read;
    }
    temp.write(&scratch[..filled]);
    Ok(filled)
}
