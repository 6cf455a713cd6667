use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::IpAddr;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};

use crate::buf::Chain;
use crate::event::Event;
use crate::http::request::HttpState;

/// A connected socket, TCP or Unix domain. The rest of the core never
/// cares which; TLS would slot in here as a third variant wrapping either.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Text form of the peer address, formatted once at accept.
    pub fn format_peer(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "-".to_string()),
            Stream::Unix(_) => "unix:".to_string(),
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok().map(|a| a.ip()),
            Stream::Unix(_) => None,
        }
    }

    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.peek(buf),
            // No peek on unix sockets; report "nothing buffered" and let
            // the read path discover EOF.
            Stream::Unix(_) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    pub fn shutdown_write(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(std::net::Shutdown::Write),
            Stream::Unix(s) => s.shutdown(std::net::Shutdown::Write),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write_vectored(bufs),
            Stream::Unix(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// One slot of the connection pool.
///
/// `instance` flips every time the slot is reissued; readiness tokens are
/// minted with the bit current at registration, so a report for a closed
/// and reissued slot no longer matches and is discarded. One bit means a
/// pathological open/close/open/close of the same slot inside a single
/// poll batch can alias; the original accepts the same risk.
pub struct Connection {
    pub slot: usize,
    pub instance: bool,
    pub open: bool,

    pub stream: Option<Stream>,
    /// Index of the listening endpoint that accepted this connection.
    pub listener: usize,
    pub peer: String,
    pub peer_ip: Option<IpAddr>,

    pub read: Event,
    pub write: Event,

    /// Member of the reusable-idle queue, eligible for forced reclaim.
    pub reusable: bool,
    pub idle: bool,
    pub error: bool,

    /// Pending-send chain owned by the write filter.
    pub out: Chain,
    /// Consumed tagged buffers staged for the owning filter's free list.
    pub drained: Chain,
    /// Bytes handed to the socket, for the access log.
    pub sent: u64,

    pub http: Option<HttpState>,
}

impl Connection {
    fn vacant(slot: usize) -> Connection {
        Connection {
            slot,
            instance: false,
            open: false,
            stream: None,
            listener: 0,
            peer: String::new(),
            peer_ip: None,
            read: Event::default(),
            write: Event::default(),
            reusable: false,
            idle: false,
            error: false,
            out: Chain::new(),
            drained: Chain::new(),
            sent: 0,
            http: None,
        }
    }

    /// Reinitialize a slot for a freshly accepted stream. The instance
    /// bit flips here, invalidating any readiness still in flight for the
    /// previous occupant.
    pub fn occupy(&mut self, stream: Stream, listener: usize) {
        self.instance = !self.instance;
        self.open = true;
        self.peer = stream.format_peer();
        self.peer_ip = stream.peer_ip();
        self.stream = Some(stream);
        self.listener = listener;
        self.read.reset();
        self.write.reset();
        self.reusable = false;
        self.idle = false;
        self.error = false;
        self.out.clear();
        self.drained.clear();
        self.sent = 0;
        self.http = None;
    }

    pub fn release(&mut self) {
        self.open = false;
        self.stream = None;
        self.http = None;
        self.out.clear();
        self.drained.clear();
        self.read.reset();
        self.write.reset();
        self.reusable = false;
        self.idle = false;
    }
}

/// Fixed-size pool: a free-list stack over preallocated slots plus the
/// reusable-idle queue. When the free list runs dry the worker forcibly
/// closes the oldest idle keepalive connection to reclaim a slot.
pub struct ConnectionPool {
    pub slots: Vec<Connection>,
    free: Vec<usize>,
    pub reusable: VecDeque<usize>,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> ConnectionPool {
        let mut slots = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            slots.push(Connection::vacant(slot));
        }
        // Stack order: lowest slots are handed out first.
        let free = (0..capacity).rev().collect();
        ConnectionPool {
            slots,
            free,
            reusable: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Take a slot from the free list, if any. Forced reclaim of an idle
    /// connection is the worker's job since it owns the reactor and
    /// timers.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    pub fn release(&mut self, slot: usize) {
        self.set_reusable(slot, false);
        self.slots[slot].release();
        self.free.push(slot);
    }

    /// The oldest idle connection, candidate for forced reclaim.
    pub fn oldest_reusable(&self) -> Option<usize> {
        self.reusable.front().copied()
    }

    /// Enter or leave the reusable-idle queue. Newly idle connections go
    /// to the back; reclaim takes from the front.
    pub fn set_reusable(&mut self, slot: usize, reusable: bool) {
        let was = self.slots[slot].reusable;
        if was == reusable {
            return;
        }
        self.slots[slot].reusable = reusable;
        if reusable {
            self.reusable.push_back(slot);
        } else {
            self.reusable.retain(|&s| s != slot);
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.slots.get(slot).filter(|c| c.open)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot).filter(|c| c.open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_each_slot_once() {
        let mut pool = ConnectionPool::new(4);
        let mut seen = std::collections::HashSet::new();
        while let Some(slot) = pool.acquire() {
            assert!(seen.insert(slot));
        }
        assert_eq!(seen.len(), 4);
        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
    }

    #[test]
    fn reusable_queue_is_fifo_and_deduplicated() {
        let mut pool = ConnectionPool::new(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.slots[a].open = true;
        pool.slots[b].open = true;
        pool.set_reusable(a, true);
        pool.set_reusable(b, true);
        pool.set_reusable(a, true); // no duplicate entry
        assert_eq!(pool.oldest_reusable(), Some(a));
        pool.set_reusable(a, false);
        assert_eq!(pool.oldest_reusable(), Some(b));
    }

    #[test]
    fn reissued_slot_flips_the_instance_bit() {
        // A readiness token minted for the old occupant must not match
        // after the slot is closed and handed to a new connection.
        let mut pool = ConnectionPool::new(1);
        let slot = pool.acquire().unwrap();
        let before = pool.slots[slot].instance;

        let (a, _b) = make_pair();
        pool.slots[slot].occupy(Stream::Tcp(a), 0);
        assert_ne!(pool.slots[slot].instance, before);

        pool.release(slot);
        let slot = pool.acquire().unwrap();
        let (a, _b) = make_pair();
        let second = pool.slots[slot].instance;
        pool.slots[slot].occupy(Stream::Tcp(a), 0);
        assert_ne!(pool.slots[slot].instance, second);
    }

    fn make_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn release_clears_reusable_membership() {
        let mut pool = ConnectionPool::new(2);
        let a = pool.acquire().unwrap();
        pool.slots[a].open = true;
        pool.set_reusable(a, true);
        pool.release(a);
        assert!(pool.oldest_reusable().is_none());
    }
}
