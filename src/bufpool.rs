use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// 池容量上限，超出的缓冲区直接丢弃以限制内存 / pool cap, buffers beyond it are dropped to bound memory
const POOL_MAX_IDLE: usize = 1024;

// 消息缓冲区初始容量，足以容纳带 EDNS 的 UDP 报文 / initial capacity, enough for an EDNS UDP message
const MSG_BUF_CAPACITY: usize = 2048;
const PACK_BUF_CAPACITY: usize = 4096;

/// A pool of reusable byte buffers. Acquire/release is tracked so tests can
/// assert that every lease taken during a dispatch comes back.
struct BufPool {
    idle: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    live: AtomicUsize,
}

impl BufPool {
    const fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            live: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> Vec<u8> {
        self.live.fetch_add(1, Ordering::Relaxed);
        let mut idle = self.idle.lock().expect("buffer pool poisoned");
        idle.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    fn release(&self, mut buf: Vec<u8>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        buf.clear();
        let mut idle = self.idle.lock().expect("buffer pool poisoned");
        if idle.len() < POOL_MAX_IDLE {
            idle.push(buf);
        }
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

static MSG_POOL: BufPool = BufPool::new(MSG_BUF_CAPACITY);
static PACK_POOL: BufPool = BufPool::new(PACK_BUF_CAPACITY);

/// Lease on a finished wire-format message. The bytes are owned by the lease
/// and return to the message pool exactly once, when the lease is dropped.
/// Moving the lease (into a channel, to another task) transfers ownership,
/// so the loser of a race releases by dropping and the winner's reader
/// releases when it is done with the reply.
#[derive(Debug)]
pub struct MsgBuf {
    buf: Option<Vec<u8>>,
}

impl MsgBuf {
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }
}

impl Drop for MsgBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            MSG_POOL.release(buf);
        }
    }
}

/// Copies `src` into a pooled message buffer. Use this when the bytes must
/// outlive the producer's scratch space.
pub fn acquire_msg_buf_copy(src: &[u8]) -> MsgBuf {
    let mut buf = MSG_POOL.acquire();
    buf.extend_from_slice(src);
    MsgBuf { buf: Some(buf) }
}

/// Scratch lease for wire encoding. Hand `as_mut_vec()` to a `BinEncoder`,
/// then read the packed bytes back with `bytes()`.
#[derive(Debug)]
pub struct PackBuf {
    buf: Option<Vec<u8>>,
}

impl PackBuf {
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("pack buffer already released")
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl Drop for PackBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            PACK_POOL.release(buf);
        }
    }
}

pub fn acquire_pack_buf() -> PackBuf {
    PackBuf {
        buf: Some(PACK_POOL.acquire()),
    }
}

/// Number of message leases currently out of the pool.
pub fn live_msg_leases() -> usize {
    MSG_POOL.live()
}

/// Serialises tests that assert on the lease gauge; the gauge is global, so
/// concurrent pool traffic from other tests would make exact counts flaky.
#[cfg(test)]
pub(crate) fn test_gauge_guard() -> std::sync::MutexGuard<'static, ()> {
    static GAUGE_LOCK: Mutex<()> = Mutex::new(());
    GAUGE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_buf_returns_to_pool_on_drop() {
        let _gauge = test_gauge_guard();
        let before = live_msg_leases();
        let buf = acquire_msg_buf_copy(b"\x12\x34");
        assert_eq!(buf.bytes(), b"\x12\x34");
        assert_eq!(live_msg_leases(), before + 1);
        drop(buf);
        assert_eq!(live_msg_leases(), before);
    }

    #[test]
    fn reused_buffer_starts_empty() {
        let _gauge = test_gauge_guard();
        let first = acquire_msg_buf_copy(b"leftover bytes");
        drop(first);
        let second = acquire_msg_buf_copy(b"xy");
        assert_eq!(second.bytes(), b"xy");
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn pack_buf_accumulates_and_releases() {
        let mut pack = acquire_pack_buf();
        pack.as_mut_vec().extend_from_slice(b"abc");
        assert_eq!(pack.bytes(), b"abc");
        drop(pack);
        let pack = acquire_pack_buf();
        assert!(pack.bytes().is_empty());
    }
}
