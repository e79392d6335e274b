mod bufpool;
mod config;
mod dispatcher;
mod domainlist;
mod ecs;
mod netlist;
mod policy;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bufpool::acquire_msg_buf_copy;
use crate::config::load_config;
use crate::dispatcher::Dispatcher;

const MAX_UDP_QUERY: usize = 4096;
const MAX_TCP_FRAME: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "splitdns: race a near DNS upstream against a trusted remote", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/splitdns.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load config")?;
    let bind_addr: SocketAddr = cfg.bind.addr.parse().context("parse bind addr")?;

    let dispatcher = Arc::new(Dispatcher::new(&cfg).context("init dispatcher")?);
    let query_permits = Arc::new(Semaphore::new(dispatcher.max_concurrent_queries));

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(bind = %bind_addr, udp_workers, "splitdns started");

    let mut udp_handles = Vec::with_capacity(udp_workers);

    #[cfg(unix)]
    {
        // SO_REUSEPORT 下每个 worker 独享 socket，由内核分发报文
        for worker_id in 0..udp_workers {
            let dispatcher = dispatcher.clone();
            let permits = query_permits.clone();
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(Arc::new(socket), dispatcher, permits).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .context("bind udp socket")?,
        );
        for worker_id in 0..udp_workers {
            let dispatcher = dispatcher.clone();
            let permits = query_permits.clone();
            let socket = Arc::clone(&socket);
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, dispatcher, permits).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .context("bind tcp listener")?;
    let tcp_dispatcher = dispatcher.clone();
    let tcp_permits = query_permits.clone();
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_dispatcher, tcp_permits).await {
            error!(error = %err, "tcp server exited");
        }
    });

    let _ = tcp_handle.await;
    for handle in udp_handles {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 每个 worker 一个 SO_REUSEPORT socket，内核按四元组散列分发
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("create udp socket")?;
    socket.set_reuse_address(true).context("set SO_REUSEADDR")?;
    socket.set_reuse_port(true).context("set SO_REUSEPORT")?;
    if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    Ok(socket.into())
}

async fn run_udp_worker(
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_UDP_QUERY);

    loop {
        buf.resize(MAX_UDP_QUERY, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = &buf[..len];
                let q = match Message::from_bytes(packet) {
                    Ok(q) => q,
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "dropping unparsable query");
                        continue;
                    }
                };

                // 超出并发上限的查询直接丢弃 / queries beyond the concurrency
                // bound are dropped
                let permit = match permits.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(peer = %peer, "too many concurrent queries, dropping");
                        continue;
                    }
                };

                let qraw = acquire_msg_buf_copy(packet);
                let dispatcher = dispatcher.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(rraw) = dispatcher.handle_query(q, qraw).await {
                        let _ = socket.send_to(rraw.bytes(), peer).await;
                    }
                    drop(permit);
                });
            }
            Err(err) => {
                debug!(error = %err, "udp recv error");
                buf.clear();
            }
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, dispatcher, permits).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut packet = vec![0u8; frame_len];
        if stream.read_exact(&mut packet).await.is_err() {
            return Ok(());
        }

        let q = match Message::from_bytes(&packet) {
            Ok(q) => q,
            Err(err) => {
                debug!(peer = %peer, error = %err, "dropping unparsable tcp query");
                continue;
            }
        };

        let _permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "too many concurrent queries, dropping");
                continue;
            }
        };

        let qraw = acquire_msg_buf_copy(&packet);
        // 超时的查询不回包，连接继续处理后续帧 / a timed-out query gets no
        // reply, the connection moves on to the next frame
        let Some(rraw) = dispatcher.handle_query(q, qraw).await else {
            continue;
        };

        if rraw.len() <= u16::MAX as usize {
            let len_bytes = (rraw.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(rraw.bytes()).await.is_err() {
                return Ok(());
            }
        }
    }
}
