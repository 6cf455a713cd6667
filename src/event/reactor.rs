use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Listener tokens occupy `0..CONN_TOKEN_BASE`; connection tokens encode
/// the pool slot and the connection's current instance bit above it.
const CONN_TOKEN_BASE: usize = 1024;

/// What a readiness token resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTarget {
    Listener(usize),
    Conn { slot: usize, instance: bool },
}

/// One readiness report, decoded. The instance bit is the one the source
/// was registered with; dispatch compares it against the connection's
/// current bit to drop stale reports for reissued slots.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub target: TokenTarget,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
}

pub fn conn_token(slot: usize, instance: bool) -> Token {
    Token(CONN_TOKEN_BASE + slot * 2 + instance as usize)
}

pub fn listener_token(index: usize) -> Token {
    debug_assert!(index < CONN_TOKEN_BASE);
    Token(index)
}

fn decode(token: Token) -> TokenTarget {
    if token.0 < CONN_TOKEN_BASE {
        TokenTarget::Listener(token.0)
    } else {
        let raw = token.0 - CONN_TOKEN_BASE;
        TokenTarget::Conn {
            slot: raw / 2,
            instance: raw & 1 == 1,
        }
    }
}

/// Thin wrapper over the readiness notifier. Owns the poll handle and the
/// event buffer; hands decoded readiness reports to the worker.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(capacity: usize) -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(64)),
        })
    }

    pub fn register_listener<S: Source>(&self, source: &mut S, index: usize) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, listener_token(index), Interest::READABLE)
    }

    pub fn deregister<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// First registration of a connection source.
    pub fn register_conn<S: Source>(
        &self,
        source: &mut S,
        slot: usize,
        instance: bool,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, conn_token(slot, instance), interest)
    }

    /// Interest update; idempotent with respect to already-merged flags.
    pub fn reregister_conn<S: Source>(
        &self,
        source: &mut S,
        slot: usize,
        instance: bool,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, conn_token(slot, instance), interest)
    }

    /// Block for up to `timeout`, decoding readiness reports into `out`.
    /// Returns the number of reports.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<ReadyEvent>,
    ) -> io::Result<usize> {
        out.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            out.push(ReadyEvent {
                target: decode(event.token()),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
            });
        }
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        for slot in [0usize, 1, 7, 5000] {
            for instance in [false, true] {
                let target = decode(conn_token(slot, instance));
                assert_eq!(target, TokenTarget::Conn { slot, instance });
            }
        }
        assert_eq!(decode(listener_token(3)), TokenTarget::Listener(3));
    }

    #[test]
    fn instance_flip_changes_token() {
        assert_ne!(conn_token(9, false), conn_token(9, true));
    }
}
