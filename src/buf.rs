use std::collections::VecDeque;
use std::fs::File;
use std::rc::Rc;

/// Identifies the filter that owns a buffer for recycling purposes.
/// `update_chains` returns drained buffers to the free list of the filter
/// whose tag they carry and discards the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufTag {
    #[default]
    None,
    Copy,
    Chunked,
    Content,
    Header,
}

/// Where a buffer's bytes live. A buffer has exactly one location by
/// construction; the sentinel variant carries no payload and exists only
/// for its `flush`/`sync`/`last_buf` bits.
pub enum BufKind {
    /// Writable memory owned by this buffer.
    Mem(Vec<u8>),
    /// Read-only memory shared with other buffers (static bodies, mmap'd
    /// regions surfaced by the open-file service).
    Shared(Rc<[u8]>),
    /// A region of an open file, to be sent with sendfile or read into
    /// memory by the copy filter.
    File(Rc<File>),
    /// No payload.
    Sentinel,
}

impl std::fmt::Debug for BufKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufKind::Mem(v) => write!(f, "Mem({})", v.len()),
            BufKind::Shared(v) => write!(f, "Shared({})", v.len()),
            BufKind::File(_) => write!(f, "File"),
            BufKind::Sentinel => write!(f, "Sentinel"),
        }
    }
}

/// One buffer. `pos..last` is the unconsumed window for memory buffers,
/// `file_pos..file_last` for file buffers. Consumers advance `pos`
/// (or `file_pos`); producers advance `last`.
#[derive(Debug)]
pub struct Buf {
    pub kind: BufKind,
    pub pos: usize,
    pub last: usize,
    pub file_pos: u64,
    pub file_last: u64,
    pub tag: BufTag,

    pub temporary: bool,
    pub memory: bool,
    pub in_file: bool,
    pub recycled: bool,
    pub flush: bool,
    pub sync: bool,
    pub last_buf: bool,
    pub last_in_chain: bool,
}

impl Buf {
    fn empty() -> Buf {
        Buf {
            kind: BufKind::Sentinel,
            pos: 0,
            last: 0,
            file_pos: 0,
            file_last: 0,
            tag: BufTag::None,
            temporary: false,
            memory: false,
            in_file: false,
            recycled: false,
            flush: false,
            sync: false,
            last_buf: false,
            last_in_chain: false,
        }
    }

    /// Writable buffer owning `data` in full.
    pub fn mem(data: Vec<u8>) -> Buf {
        let last = data.len();
        Buf {
            kind: BufKind::Mem(data),
            last,
            temporary: true,
            ..Buf::empty()
        }
    }

    /// Writable buffer with `capacity` reserved and no payload yet.
    pub fn with_capacity(capacity: usize, tag: BufTag) -> Buf {
        Buf {
            kind: BufKind::Mem(Vec::with_capacity(capacity)),
            tag,
            temporary: true,
            ..Buf::empty()
        }
    }

    /// Read-only buffer over shared bytes.
    pub fn shared(data: Rc<[u8]>) -> Buf {
        let last = data.len();
        Buf {
            kind: BufKind::Shared(data),
            last,
            memory: true,
            ..Buf::empty()
        }
    }

    /// File-backed buffer covering `file_pos..file_last`.
    pub fn file(file: Rc<File>, file_pos: u64, file_last: u64) -> Buf {
        Buf {
            kind: BufKind::File(file),
            file_pos,
            file_last,
            in_file: true,
            ..Buf::empty()
        }
    }

    /// End-of-response marker.
    pub fn last() -> Buf {
        Buf {
            last_buf: true,
            ..Buf::empty()
        }
    }

    /// Flush marker: overrides the write filter's output batching.
    pub fn flush_marker() -> Buf {
        Buf {
            flush: true,
            ..Buf::empty()
        }
    }

    pub fn in_memory(&self) -> bool {
        matches!(self.kind, BufKind::Mem(_) | BufKind::Shared(_))
    }

    /// True when this buffer carries no payload and only its marker bits
    /// matter.
    pub fn special(&self) -> bool {
        self.len() == 0 && (self.flush || self.sync || self.last_buf)
    }

    pub fn len(&self) -> usize {
        if self.in_file && !self.in_memory() {
            (self.file_last - self.file_pos) as usize
        } else {
            self.last - self.pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The unconsumed bytes of a memory buffer.
    pub fn bytes(&self) -> &[u8] {
        match &self.kind {
            BufKind::Mem(v) => &v[self.pos..self.last],
            BufKind::Shared(v) => &v[self.pos..self.last],
            _ => &[],
        }
    }

    /// Append into a writable buffer, up to its reserved capacity.
    /// Returns the number of bytes taken.
    pub fn write(&mut self, src: &[u8]) -> usize {
        match &mut self.kind {
            BufKind::Mem(v) => {
                let room = v.capacity() - v.len();
                let n = room.min(src.len());
                v.extend_from_slice(&src[..n]);
                self.last = v.len();
                n
            }
            _ => 0,
        }
    }

    /// Remaining writable room of a temporary buffer.
    pub fn room(&self) -> usize {
        match &self.kind {
            BufKind::Mem(v) => v.capacity() - v.len(),
            _ => 0,
        }
    }

    /// Reset a drained temporary buffer for reuse, keeping its allocation.
    pub fn reset(&mut self) {
        if let BufKind::Mem(v) = &mut self.kind {
            v.clear();
        }
        self.pos = 0;
        self.last = 0;
        self.file_pos = 0;
        self.file_last = 0;
        self.recycled = false;
        self.flush = false;
        self.sync = false;
        self.last_buf = false;
        self.last_in_chain = false;
    }
}

/// The universal currency between filters. Moving a `Buf` between chains
/// transfers ownership; a link can never belong to two chains at once.
pub type Chain = VecDeque<Buf>;

/// Total unconsumed payload bytes in a chain.
pub fn chain_len(chain: &Chain) -> usize {
    chain.iter().map(Buf::len).sum()
}

/// True if any buffer in the chain carries the flush or last-buffer bit.
pub fn chain_needs_flush(chain: &Chain) -> bool {
    chain.iter().any(|b| b.flush || b.last_buf)
}

/// Post-write bookkeeping: walk `busy` front-to-back, releasing every
/// fully consumed buffer. Buffers tagged for this filter go back to its
/// `free` list with their allocation intact; foreign buffers are dropped.
/// Stops at the first buffer that still has unconsumed bytes.
pub fn update_chains(busy: &mut Chain, free: &mut Vec<Buf>, tag: BufTag) {
    while let Some(head) = busy.front() {
        if head.len() != 0 {
            break;
        }
        let mut buf = busy.pop_front().expect("non-empty busy chain");
        if buf.tag == tag {
            buf.reset();
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_buf_window() {
        let mut b = Buf::mem(b"hello".to_vec());
        assert_eq!(b.len(), 5);
        assert_eq!(b.bytes(), b"hello");
        b.pos += 2;
        assert_eq!(b.bytes(), b"llo");
    }

    #[test]
    fn capacity_buf_fills_to_room() {
        let mut b = Buf::with_capacity(4, BufTag::Copy);
        assert_eq!(b.write(b"abcdef"), 4);
        assert_eq!(b.bytes(), b"abcd");
        assert_eq!(b.room(), 0);
    }

    #[test]
    fn sentinel_is_special() {
        assert!(Buf::last().special());
        assert!(Buf::flush_marker().special());
        assert!(!Buf::mem(b"x".to_vec()).special());
    }

    #[test]
    fn update_chains_recycles_by_tag() {
        let mut busy: Chain = Chain::new();
        let mut ours = Buf::with_capacity(8, BufTag::Copy);
        ours.write(b"aa");
        ours.pos = ours.last; // fully consumed
        busy.push_back(ours);

        let mut theirs = Buf::mem(b"bb".to_vec());
        theirs.pos = theirs.last;
        busy.push_back(theirs);

        let mut pending = Buf::mem(b"cc".to_vec());
        pending.pos = 1; // one byte left
        busy.push_back(pending);

        let mut free = Vec::new();
        update_chains(&mut busy, &mut free, BufTag::Copy);

        assert_eq!(free.len(), 1, "only the Copy-tagged buffer is recycled");
        assert_eq!(busy.len(), 1, "the pending buffer stays busy");
        assert_eq!(busy.front().map(Buf::len), Some(1));
    }

    #[test]
    fn chain_len_ignores_sentinels() {
        let mut chain: Chain = Chain::new();
        chain.push_back(Buf::mem(b"abc".to_vec()));
        chain.push_back(Buf::last());
        assert_eq!(chain_len(&chain), 3);
        assert!(chain_needs_flush(&chain));
    }
}
