use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::opt::ClientSubnet;
use hickory_proto::rr::{DNSClass, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bufpool::{acquire_msg_buf_copy, acquire_pack_buf, MsgBuf};
use crate::config::{Config, Protocol};
use crate::ecs::{append_ecs_if_absent, parse_subnet};
use crate::netlist;
use crate::policy::{parse_policies, DomainPolicies, IpPolicies, PolicyKind, Verdict};
use crate::upstream::{TcpUpstream, UdpUpstream, Upstream};

/// Global per-query deadline. Hardcoded; the remote delay must stay below it.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_MAX_CONCURRENT: usize = 150;

/// The only two errors that escape the dispatcher core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeError {
    ServerFailed,
    ServerTimedOut,
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerFailed => write!(f, "server failed"),
            Self::ServerTimedOut => write!(f, "server timed out"),
        }
    }
}

impl std::error::Error for ServeError {}

/// Per-process dispatcher. Read-only after construction; per-query state
/// lives on the task.
pub struct Dispatcher {
    pub max_concurrent_queries: usize,
    local: Option<Arc<LocalUpstream>>,
    remote: Option<Arc<RemoteUpstream>>,
}

struct LocalUpstream {
    client: Box<dyn Upstream>,
    deny_unusual_types: bool,
    deny_result_without_ip: bool,
    check_cname: bool,
    ip_policies: Option<IpPolicies>,
    domain_policies: Option<DomainPolicies>,
    ecs: Option<ClientSubnet>,
}

struct RemoteUpstream {
    client: Box<dyn Upstream>,
    delay_start: Duration,
    ecs: Option<ClientSubnet>,
}

enum LocalOutcome {
    Done,
    Failed,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.server.local.is_none() && cfg.server.remote.is_none() {
            bail!("missing args: both local and remote upstream are empty");
        }

        let max_concurrent_queries = if cfg.dispatcher.max_concurrent_queries == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            cfg.dispatcher.max_concurrent_queries
        };

        let mut local = None;
        if let Some(lc) = &cfg.server.local {
            let client = new_client(&lc.addr, lc.protocol)
                .with_context(|| format!("init local upstream [{}]", lc.addr))?;

            let domain_policies = if lc.domain_policies.is_empty() {
                None
            } else {
                let raw = parse_policies(&lc.domain_policies, PolicyKind::Domain)
                    .context("invalid domain policies string")?;
                Some(DomainPolicies::load(raw).context("loading domain policies")?)
            };
            let ip_policies = if lc.ip_policies.is_empty() {
                None
            } else {
                let raw = parse_policies(&lc.ip_policies, PolicyKind::Ip)
                    .context("invalid ip policies string")?;
                Some(IpPolicies::load(raw).context("loading ip policies")?)
            };
            let ecs = match &cfg.ecs.local {
                Some(s) => {
                    let subnet = parse_subnet(s).context("parsing local ECS subnet")?;
                    info!("local ECS enabled");
                    Some(subnet)
                }
                None => None,
            };

            local = Some(Arc::new(LocalUpstream {
                client,
                deny_unusual_types: lc.deny_unusual_types,
                deny_result_without_ip: lc.deny_result_without_ip,
                check_cname: lc.check_cname,
                ip_policies,
                domain_policies,
                ecs,
            }));
        }

        let mut remote = None;
        if let Some(rc) = &cfg.server.remote {
            let client = new_client(&rc.addr, rc.protocol)
                .with_context(|| format!("init remote upstream [{}]", rc.addr))?;
            let delay_start = Duration::from_millis(rc.delay_start_ms);
            if delay_start >= QUERY_TIMEOUT {
                bail!(
                    "remote delay_start {}ms is not shorter than the query timeout {:?}",
                    rc.delay_start_ms,
                    QUERY_TIMEOUT
                );
            }
            let ecs = match &cfg.ecs.remote {
                Some(s) => {
                    let subnet = parse_subnet(s).context("parsing remote ECS subnet")?;
                    info!("remote ECS enabled");
                    Some(subnet)
                }
                None => None,
            };
            remote = Some(Arc::new(RemoteUpstream {
                client,
                delay_start,
                ecs,
            }));
        }

        Ok(Self {
            max_concurrent_queries,
            local,
            remote,
        })
    }

    /// Serves one client query and returns the raw reply to send back.
    /// `None` means the query is dropped without an answer (global timeout).
    /// When every attempted upstream fails, a SERVFAIL reply is synthesised
    /// from the question.
    pub async fn handle_query(&self, q: Message, qraw: MsgBuf) -> Option<MsgBuf> {
        let qname = q
            .queries()
            .first()
            .map(|question| question.name().to_string())
            .unwrap_or_default();
        let q = Arc::new(q);

        match self.serve_raw(q.clone(), qraw, &qname).await {
            Ok(rraw) => Some(rraw),
            Err(ServeError::ServerFailed) => {
                warn!(qname = %qname, "all upstreams failed");
                match build_servfail(&q) {
                    Ok(rraw) => Some(rraw),
                    Err(err) => {
                        warn!(qname = %qname, error = %err, "pack servfail reply failed");
                        None
                    }
                }
            }
            Err(ServeError::ServerTimedOut) => {
                warn!(qname = %qname, "query timed out");
                None
            }
        }
    }

    async fn serve_raw(
        &self,
        q: Arc<Message>,
        qraw: MsgBuf,
        qname: &str,
    ) -> Result<MsgBuf, ServeError> {
        let query_start = tokio::time::Instant::now();
        let deadline = tokio::time::sleep_until(query_start + QUERY_TIMEOUT);
        tokio::pin!(deadline);

        // 查询缓冲区由所有上游任务共享，最后一个持有者归还租约
        // the query lease is shared by the upstream tasks, the last holder
        // returns it to the pool
        let qraw = Arc::new(qraw);

        // admission
        let mut force_local = false;
        let mut local_branch: Option<Arc<LocalUpstream>> = None;
        if let Some(local) = &self.local {
            let mut do_local = true;
            if is_unusual_type(&q) {
                do_local = !local.deny_unusual_types;
            } else if let Some(policies) = &local.domain_policies {
                match policies.check(qname) {
                    Verdict::Force => {
                        do_local = true;
                        force_local = true;
                    }
                    Verdict::Accept => do_local = true,
                    Verdict::Deny => do_local = false,
                    Verdict::Missing => {}
                }
                debug!(qname = %qname, do_local, force_local, "domain policy applied");
            }
            if do_local {
                local_branch = Some(local.clone());
            }
        }
        let do_local = local_branch.is_some();
        let remote_branch = if force_local {
            None
        } else {
            self.remote.clone()
        };

        let (res_tx, mut res_rx) = mpsc::channel::<MsgBuf>(1);
        let winner = Arc::new(AtomicBool::new(false));
        let (outcome_tx, mut outcome_rx) = oneshot::channel::<LocalOutcome>();
        let mut tasks = Vec::new();

        if let Some(local) = local_branch {
            let q = q.clone();
            let qraw = qraw.clone();
            let res_tx = res_tx.clone();
            let winner = winner.clone();
            let qname = qname.to_string();
            tasks.push(tokio::spawn(async move {
                let res =
                    exchange_with_ecs(local.client.as_ref(), &q, qraw.bytes(), local.ecs.as_ref())
                        .await;
                let rtt_ms = query_start.elapsed().as_millis() as u64;
                match res {
                    Err(err) => {
                        warn!(qname = %qname, rtt_ms, error = %err, "local upstream failed");
                        let _ = outcome_tx.send(LocalOutcome::Failed);
                    }
                    Ok(rraw) => {
                        if !force_local && !local.accept_reply(rraw.bytes(), &qname) {
                            debug!(qname = %qname, rtt_ms, "local result denied");
                            drop(rraw);
                            let _ = outcome_tx.send(LocalOutcome::Failed);
                            return;
                        }
                        match res_tx.try_send(rraw) {
                            Ok(()) => {
                                winner.store(true, Ordering::Release);
                                debug!(qname = %qname, rtt_ms, "local result accepted");
                            }
                            // a winner is already in the slot, the lease is
                            // handed back and released here
                            Err(_) => debug!(qname = %qname, rtt_ms, "local result dropped"),
                        }
                        let _ = outcome_tx.send(LocalOutcome::Done);
                    }
                }
            }));
        } else {
            drop(outcome_tx);
        }

        if let Some(remote) = remote_branch {
            let mut skip_remote = false;
            if do_local && remote.delay_start > Duration::ZERO {
                // 先等本地：成功则跳过远程，失败或超过延迟则立刻启动
                // wait for local first: skip remote on success, start at once
                // on failure or when the delay elapses
                tokio::select! {
                    outcome = &mut outcome_rx => {
                        if matches!(outcome, Ok(LocalOutcome::Done)) {
                            skip_remote = true;
                        }
                    }
                    _ = tokio::time::sleep(remote.delay_start) => {}
                }
            }

            if !skip_remote {
                let q = q.clone();
                let qraw = qraw.clone();
                let res_tx = res_tx.clone();
                let winner = winner.clone();
                let qname = qname.to_string();
                tasks.push(tokio::spawn(async move {
                    let res = exchange_with_ecs(
                        remote.client.as_ref(),
                        &q,
                        qraw.bytes(),
                        remote.ecs.as_ref(),
                    )
                    .await;
                    let rtt_ms = query_start.elapsed().as_millis() as u64;
                    match res {
                        Err(err) => {
                            warn!(qname = %qname, rtt_ms, error = %err, "remote upstream failed");
                        }
                        Ok(rraw) => {
                            debug!(qname = %qname, rtt_ms, "got reply from remote");
                            if res_tx.try_send(rraw).is_ok() {
                                winner.store(true, Ordering::Release);
                            }
                        }
                    }
                }));
            }
        }

        drop(res_tx);
        drop(qraw);

        // janitor: joins every producer, then raises server-failed only when
        // no winner was recorded. The flag is set before a producer exits, so
        // a late winner can never be lost to this signal.
        let (failed_tx, failed_rx) = oneshot::channel::<()>();
        {
            let winner = winner.clone();
            tokio::spawn(async move {
                for task in tasks {
                    let _ = task.await;
                }
                if !winner.load(Ordering::Acquire) {
                    let _ = failed_tx.send(());
                }
            });
        }

        tokio::select! {
            res = res_rx.recv() => match res {
                Some(rraw) => Ok(rraw),
                None => Err(ServeError::ServerFailed),
            },
            _ = failed_rx => Err(ServeError::ServerFailed),
            _ = &mut deadline => Err(ServeError::ServerTimedOut),
        }
    }
}

impl LocalUpstream {
    /// Screens a raw local reply. Rejection fails the local branch of the
    /// race, it never fails the query by itself.
    fn accept_reply(&self, rraw: &[u8], qname: &str) -> bool {
        let res = match Message::from_bytes(rraw) {
            Ok(res) => res,
            Err(err) => {
                debug!(qname = %qname, error = %err, "local reply unparsable");
                return false;
            }
        };
        self.accept_parsed(&res, qname)
    }

    fn accept_parsed(&self, res: &Message, qname: &str) -> bool {
        if res.response_code() != ResponseCode::NoError {
            debug!(qname = %qname, rcode = ?res.response_code(), "local result denied: rcode");
            return false;
        }

        if is_unusual_type(res) {
            return !self.deny_unusual_types;
        }

        // CNAME 策略先于 IP 策略，便于按 CDN 域名提前放行或拦截
        // CNAME policies run before IP policies so CDN names can short-circuit
        if self.check_cname {
            if let Some(policies) = &self.domain_policies {
                for record in res.answers() {
                    if let Some(RData::CNAME(target)) = record.data() {
                        match policies.check(&target.0.to_string()) {
                            Verdict::Accept | Verdict::Force => {
                                debug!(qname = %qname, "local result accepted by cname");
                                return true;
                            }
                            Verdict::Deny => {
                                debug!(qname = %qname, "local result denied by cname");
                                return false;
                            }
                            Verdict::Missing => {}
                        }
                    }
                }
            }
        }

        let mut has_ip = false;
        if let Some(policies) = &self.ip_policies {
            for record in res.answers() {
                let ip = match record.data() {
                    Some(RData::A(a)) => netlist::conv(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => netlist::conv(IpAddr::V6(aaaa.0)),
                    _ => continue,
                };
                has_ip = true;
                match policies.check(ip) {
                    Verdict::Accept => {
                        debug!(qname = %qname, "local result accepted by ip");
                        return true;
                    }
                    Verdict::Deny => {
                        debug!(qname = %qname, "local result denied by ip");
                        return false;
                    }
                    Verdict::Force | Verdict::Missing => {}
                }
            }
        }

        if self.deny_result_without_ip && !has_ip {
            debug!(qname = %qname, "local result denied: no ip record");
            return false;
        }

        true
    }
}

fn new_client(addr: &str, protocol: Protocol) -> Result<Box<dyn Upstream>> {
    Ok(match protocol {
        Protocol::Udp => Box::new(UdpUpstream::new(addr, QUERY_TIMEOUT)?),
        Protocol::Tcp => Box::new(TcpUpstream::new(addr, QUERY_TIMEOUT)?),
    })
}

/// A query is unusual unless it is a single-question IN-class A or AAAA
/// lookup with opcode QUERY. Unusual queries bypass domain policies.
pub fn is_unusual_type(msg: &Message) -> bool {
    if msg.op_code() != OpCode::Query || msg.queries().len() != 1 {
        return true;
    }
    let question = &msg.queries()[0];
    question.query_class() != DNSClass::IN
        || !matches!(question.query_type(), RecordType::A | RecordType::AAAA)
}

/// Injects ECS when configured, packing the modified copy into fresh bytes;
/// otherwise the original raw query goes out untouched.
async fn exchange_with_ecs(
    client: &dyn Upstream,
    q: &Message,
    qraw: &[u8],
    ecs: Option<&ClientSubnet>,
) -> Result<MsgBuf> {
    if let Some(subnet) = ecs {
        if let Some(q_ecs) = append_ecs_if_absent(q, subnet) {
            let mut pack = acquire_pack_buf();
            {
                let mut encoder = BinEncoder::new(pack.as_mut_vec());
                q_ecs.emit(&mut encoder).context("pack query with ecs")?;
            }
            return client.exchange(pack.bytes()).await;
        }
    }
    client.exchange(qraw).await
}

/// Builds the reply for a query whose every branch failed: question copied,
/// rcode ServerFailure.
fn build_servfail(q: &Message) -> Result<MsgBuf> {
    let mut msg = Message::new();
    msg.set_id(q.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(q.op_code());
    msg.set_recursion_desired(q.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::ServFail);
    let queries: Vec<_> = q.queries().iter().cloned().collect();
    msg.add_queries(queries);

    let mut pack = acquire_pack_buf();
    {
        let mut encoder = BinEncoder::new(pack.as_mut_vec());
        msg.emit(&mut encoder).context("pack servfail reply")?;
    }
    Ok(acquire_msg_buf_copy(pack.bytes()))
}
