//! The terminal body filter: batches pending output on the connection's
//! send chain and performs the actual scatter-gather writes, using
//! sendfile for file-backed buffers where available.

use std::io::{self, IoSlice, Write};

use crate::buf::{chain_len, BufKind, Chain};
use crate::conn::Connection;
use crate::http::filter::FilterCode;
use crate::prelude::*;

pub fn body_filter(w: &mut Worker, _at: usize, rid: Rid, mut input: Chain) -> FilterCode {
    let postpone_output = w.rt.http.postpone_output;
    let send_timeout = w.rt.http.send_timeout_ms;

    enum Outcome {
        Buffered,
        Blocked,
        Done,
        Failed,
    }

    let outcome = {
        let Some(conn) = w.conns.get_mut(rid.conn) else {
            return FilterCode::Error;
        };
        if conn.error {
            Outcome::Failed
        } else {
            for buf in input.drain(..) {
                if buf.is_empty() && !buf.special() {
                    continue;
                }
                conn.out.push_back(buf);
            }

            let size = chain_len(&conn.out);
            let force = conn
                .out
                .iter()
                .any(|b| b.flush || b.last_buf || b.recycled);

            if !force && size < postpone_output {
                // Batch small pieces until a flush point arrives.
                Outcome::Buffered
            } else if conn.out.is_empty() {
                Outcome::Done
            } else {
                match send_chain(conn) {
                    Ok(true) => Outcome::Done,
                    Ok(false) => Outcome::Blocked,
                    Err(e) => {
                        debug!(peer = %conn.peer, error = %e, "send failed");
                        conn.error = true;
                        Outcome::Failed
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Buffered => FilterCode::Ok,
        Outcome::Done => {
            clear_write_wait(w, rid.conn);
            FilterCode::Ok
        }
        Outcome::Blocked => {
            w.want_write(rid.conn, true);
            w.set_timer(EvId::write(rid.conn), send_timeout);
            FilterCode::Again
        }
        Outcome::Failed => FilterCode::Error,
    }
}

fn clear_write_wait(w: &mut Worker, slot: usize) {
    w.clear_timer(EvId::write(slot));
    w.want_write(slot, false);
}

/// Push the pending chain into the socket. `Ok(true)` means drained,
/// `Ok(false)` means the socket stopped accepting bytes.
fn send_chain(conn: &mut Connection) -> io::Result<bool> {
    loop {
        while let Some(front) = conn.out.front() {
            if front.len() == 0 {
                stage_drained(conn.out.pop_front(), &mut conn.drained);
            } else {
                break;
            }
        }
        let Some(front) = conn.out.front() else {
            return Ok(true);
        };

        if front.in_memory() {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(16);
            for buf in conn.out.iter().take(64) {
                if !buf.in_memory() {
                    break;
                }
                if buf.len() > 0 {
                    slices.push(IoSlice::new(buf.bytes()));
                }
            }
            let stream = conn
                .stream
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            match stream.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    conn.sent += n as u64;
                    advance_memory(&mut conn.out, &mut conn.drained, n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        } else {
            match send_file_front(conn)? {
                0 => return Ok(false),
                _ => continue,
            }
        }
    }
}

/// Consume `n` written bytes from the leading memory buffers. Consumed
/// buffers carrying a filter tag are staged for recycling.
fn advance_memory(out: &mut Chain, drained: &mut Chain, mut n: usize) {
    while n > 0 {
        let Some(front) = out.front_mut() else {
            return;
        };
        if !front.in_memory() {
            return;
        }
        let take = front.len().min(n);
        front.pos += take;
        n -= take;
        if front.len() == 0 {
            stage_drained(out.pop_front(), drained);
        }
    }
}

/// Only tagged buffers are worth handing back; anonymous ones drop here.
fn stage_drained(buf: Option<crate::buf::Buf>, drained: &mut Chain) {
    if let Some(buf) = buf {
        if buf.tag != crate::buf::BufTag::None {
            drained.push_back(buf);
        }
    }
}

/// Send the leading file-backed buffer. Returns bytes moved; zero means
/// the socket is full.
#[cfg(target_os = "linux")]
fn send_file_front(conn: &mut Connection) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let out_fd = conn
        .stream
        .as_ref()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
        .as_raw_fd();
    let front = conn.out.front_mut().expect("file buffer present");
    let BufKind::File(file) = &front.kind else {
        return Err(io::ErrorKind::InvalidInput.into());
    };
    let count = (front.file_last - front.file_pos) as usize;
    let mut offset = front.file_pos as libc::off_t;

    let sent = unsafe { libc::sendfile(out_fd, file.as_raw_fd(), &mut offset, count) };
    if sent < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(0),
            io::ErrorKind::Interrupted => Ok(0),
            _ => Err(err),
        };
    }
    let sent = sent as usize;
    front.file_pos += sent as u64;
    conn.sent += sent as u64;
    if front.len() == 0 {
        conn.out.pop_front();
    }
    Ok(sent)
}

/// Portable fallback: read the file window and write it out.
#[cfg(not(target_os = "linux"))]
fn send_file_front(conn: &mut Connection) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let front = conn.out.front_mut().expect("file buffer present");
    let BufKind::File(file) = &front.kind else {
        return Err(io::ErrorKind::InvalidInput.into());
    };
    let window = ((front.file_last - front.file_pos) as usize).min(16 * 1024);
    let mut scratch = vec![0u8; window];
    let read = file.read_at(&mut scratch, front.file_pos)?;
    if read == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let stream = conn
        .stream
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
    match stream.write(&scratch[..read]) {
        Ok(0) => Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => {
            front.file_pos += n as u64;
            conn.sent += n as u64;
            if front.len() == 0 {
                conn.out.pop_front();
            }
            Ok(n)
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;

    #[test]
    fn advance_memory_pops_consumed_buffers() {
        let mut out: Chain = Chain::new();
        let mut drained = Chain::new();
        out.push_back(Buf::mem(b"abc".to_vec()));
        out.push_back(Buf::mem(b"defg".to_vec()));
        advance_memory(&mut out, &mut drained, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out.front().unwrap().bytes(), b"fg");
    }

    #[test]
    fn advance_memory_stops_at_file_buffers() {
        let mut out: Chain = Chain::new();
        let mut drained = Chain::new();
        out.push_back(Buf::mem(b"ab".to_vec()));
        let file = std::rc::Rc::new(tempfile());
        out.push_back(Buf::file(file, 0, 10));
        advance_memory(&mut out, &mut drained, 5);
        assert_eq!(out.len(), 1, "memory buffer consumed");
        assert!(out.front().unwrap().in_file);
    }

    #[test]
    fn tagged_buffers_are_staged_for_recycling() {
        let mut out: Chain = Chain::new();
        let mut drained = Chain::new();
        let mut tagged = Buf::with_capacity(4, crate::buf::BufTag::Copy);
        tagged.write(b"abcd");
        out.push_back(tagged);
        advance_memory(&mut out, &mut drained, 4);
        assert!(out.is_empty());
        assert_eq!(drained.len(), 1, "Copy-tagged buffer staged, not dropped");
    }

    fn tempfile() -> std::fs::File {
        let dir = std::env::temp_dir().join("server_core_write_tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("t-{}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
