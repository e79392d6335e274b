use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bufpool::{acquire_msg_buf_copy, MsgBuf};

const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;
const MAX_UDP_REPLY: usize = 4096;
const TCP_INFLIGHT_LIMIT: usize = 128;

/// The single capability the dispatcher needs from a DNS server: send raw
/// query bytes, get raw reply bytes or an error. Implementations must be
/// safe under concurrent invocation; cancellation is by dropping the future
/// or aborting the calling task.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, qraw: &[u8]) -> Result<MsgBuf>;

    fn addr(&self) -> &str;
}

/// UDP exchange over a fresh connected socket per query. A connected socket
/// only receives datagrams from the upstream, and the transaction ID is
/// still verified before a reply is accepted.
pub struct UdpUpstream {
    addr: SocketAddr,
    addr_str: String,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(addr: &str, exchange_timeout: Duration) -> Result<Self> {
        let parsed: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid upstream address [{addr}]"))?;
        Ok(Self {
            addr: parsed,
            addr_str: addr.to_string(),
            timeout: exchange_timeout,
        })
    }

    fn make_socket(&self) -> Result<tokio::net::UdpSocket> {
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
        if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUF_SIZE) {
            warn!(error = %err, "failed to set udp recv buffer size");
        }
        if let Err(err) = socket.set_send_buffer_size(SOCKET_BUF_SIZE) {
            warn!(error = %err, "failed to set udp send buffer size");
        }
        socket.set_nonblocking(true).context("set nonblocking")?;
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&bind_addr.into()).context("bind udp socket")?;
        tokio::net::UdpSocket::from_std(socket.into()).context("register udp socket")
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, qraw: &[u8]) -> Result<MsgBuf> {
        if qraw.len() < 2 {
            bail!("query too short");
        }
        let sock = self.make_socket()?;
        sock.connect(self.addr).await.context("connect")?;
        sock.send(qraw).await.context("send")?;

        let mut buf = [0u8; MAX_UDP_REPLY];
        let recv = timeout(self.timeout, async {
            loop {
                let size = sock.recv(&mut buf).await.context("recv")?;
                // 事务 ID 不符的报文直接丢弃 / drop datagrams whose transaction id mismatches
                if size >= 2 && buf[0] == qraw[0] && buf[1] == qraw[1] {
                    return Ok::<_, anyhow::Error>(acquire_msg_buf_copy(&buf[..size]));
                }
            }
        })
        .await;

        match recv {
            Ok(res) => res,
            Err(_) => bail!("udp exchange timeout"),
        }
    }

    fn addr(&self) -> &str {
        &self.addr_str
    }
}

/// TCP exchange over a multiplexed connection with 2-byte length framing.
/// Concurrent queries share one stream; each query's transaction ID is
/// rewritten to a connection-unique ID and a reader task routes replies back
/// by that ID, restoring the original before completing the waiter.
pub struct TcpUpstream {
    addr_str: String,
    timeout: Duration,
    conn: Arc<Mutex<Option<OwnedWriteHalf>>>,
    pending: Arc<DashMap<u16, Waiter>>,
    next_id: AtomicU16,
    inflight_limit: Semaphore,
    write_lock: Mutex<()>,
}

struct Waiter {
    original_id: u16,
    tx: oneshot::Sender<MsgBuf>,
}

impl TcpUpstream {
    pub fn new(addr: &str, exchange_timeout: Duration) -> Result<Self> {
        let _: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid upstream address [{addr}]"))?;
        Ok(Self {
            addr_str: addr.to_string(),
            timeout: exchange_timeout,
            conn: Arc::new(Mutex::new(None)),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU16::new(1),
            inflight_limit: Semaphore::new(TCP_INFLIGHT_LIMIT),
            write_lock: Mutex::new(()),
        })
    }

    async fn ensure_conn(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr_str)
            .await
            .context("tcp connect")?;
        let (read_half, write_half) = stream.into_split();
        *guard = Some(write_half);
        drop(guard);
        self.spawn_reader(read_half);
        Ok(())
    }

    fn spawn_reader(&self, mut reader: OwnedReadHalf) {
        let pending = Arc::clone(&self.pending);
        let conn = Arc::clone(&self.conn);
        let upstream = self.addr_str.clone();
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 2];
                if let Err(err) = reader.read_exact(&mut len_buf).await {
                    debug!(upstream = %upstream, error = %err, "tcp read len failed");
                    Self::fail_all(&pending, &conn).await;
                    break;
                }
                let frame_len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; frame_len];
                if let Err(err) = reader.read_exact(&mut buf).await {
                    debug!(upstream = %upstream, error = %err, "tcp read body failed");
                    Self::fail_all(&pending, &conn).await;
                    break;
                }
                if frame_len < 2 {
                    continue;
                }
                let resp_id = u16::from_be_bytes([buf[0], buf[1]]);
                if let Some((_, waiter)) = pending.remove(&resp_id) {
                    buf[0..2].copy_from_slice(&waiter.original_id.to_be_bytes());
                    let _ = waiter.tx.send(acquire_msg_buf_copy(&buf));
                } else {
                    debug!(upstream = %upstream, resp_id, "tcp reply with unknown id");
                }
            }
        });
    }

    // Dropping the waiters' senders wakes every in-flight exchange with an
    // error; the connection is rebuilt on the next query.
    async fn fail_all(pending: &DashMap<u16, Waiter>, conn: &Mutex<Option<OwnedWriteHalf>>) {
        let ids: Vec<u16> = pending.iter().map(|item| *item.key()).collect();
        for id in ids {
            pending.remove(&id);
        }
        let mut guard = conn.lock().await;
        *guard = None;
    }

    async fn reset_conn(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    fn alloc_id(&self) -> Result<u16> {
        let mut tries = 0;
        loop {
            let cand = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !self.pending.contains_key(&cand) {
                return Ok(cand);
            }
            tries += 1;
            if tries > u16::MAX as usize {
                bail!("no free transaction ids on tcp connection");
            }
        }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn exchange(&self, qraw: &[u8]) -> Result<MsgBuf> {
        if qraw.len() < 2 {
            bail!("query too short");
        }
        let start = tokio::time::Instant::now();
        let _permit = timeout(self.timeout, self.inflight_limit.acquire())
            .await
            .map_err(|_| anyhow::anyhow!("tcp inflight limit timeout"))?
            .context("inflight semaphore closed")?;

        let original_id = u16::from_be_bytes([qraw[0], qraw[1]]);
        let new_id = self.alloc_id()?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(new_id, Waiter { original_id, tx });

        let remaining = self.timeout.saturating_sub(start.elapsed());
        let write_res = timeout(remaining, async {
            self.ensure_conn().await?;
            let mut frame = Vec::with_capacity(2 + qraw.len());
            frame.extend_from_slice(&(qraw.len() as u16).to_be_bytes());
            frame.extend_from_slice(qraw);
            frame[2..4].copy_from_slice(&new_id.to_be_bytes());

            let _wguard = self.write_lock.lock().await;
            let mut guard = self.conn.lock().await;
            let writer = guard.as_mut().context("tcp write half missing")?;
            writer.write_all(&frame).await.context("tcp write")?;
            Ok::<(), anyhow::Error>(())
        })
        .await;

        match write_res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.pending.remove(&new_id);
                self.reset_conn().await;
                return Err(err);
            }
            Err(_) => {
                self.pending.remove(&new_id);
                self.reset_conn().await;
                bail!("tcp write timeout");
            }
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        match timeout(remaining, rx).await {
            Ok(Ok(rraw)) => Ok(rraw),
            Ok(Err(_)) => {
                self.pending.remove(&new_id);
                bail!("tcp connection lost while waiting for reply");
            }
            Err(_) => {
                self.pending.remove(&new_id);
                self.reset_conn().await;
                bail!("tcp reply timeout");
            }
        }
    }

    fn addr(&self) -> &str {
        &self.addr_str
    }
}
