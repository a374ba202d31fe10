//! UDP half of a listener rule: demux datagrams into pseudo-sessions, one
//! egress socket and idle timer per session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

use crate::config::{Listener, UDP_SESSION_IDLE_MS};
use crate::identity::PendingFlow;
use crate::notify::embeds;
use crate::ppv2;

use super::ForwarderContext;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUF: usize = 64 * 1024;

struct UdpSession {
    egress: Arc<UdpSocket>,
    target_addr_rx: watch::Receiver<Option<SocketAddr>>,
    ppv2_sent: AtomicBool,
    notified: AtomicBool,
    logged: AtomicBool,
    last_seen_ms: AtomicI64,
    player_name: Mutex<Option<String>>,
}

impl UdpSession {
    fn touch(&self) {
        self.last_seen_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_seen_ms.load(Ordering::Relaxed)
    }

    async fn set_player_name(&self, name: String) {
        *self.player_name.lock().await = Some(name);
    }
}

pub async fn serve(listener: Arc<Listener>, ctx: Arc<ForwarderContext>) -> anyhow::Result<()> {
    let port = listener.udp.context("udp forwarder started without a udp port")?;
    let bind_addr = format!("{}:{port}", listener.bind);
    let socket = Arc::new(
        UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("bind udp {bind_addr}"))?,
    );

    tracing::info!(bind = %bind_addr, target = %listener.target.host, "udp: listening");

    let sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>> = Arc::new(DashMap::new());

    {
        let sessions = sessions.clone();
        let listener = listener.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            sweep_loop(sessions, listener, ctx).await;
        });
    }

    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        if n == 0 {
            continue;
        }
        let datagram = buf[..n].to_vec();

        let session = match session_for(&sessions, peer, &socket, &listener) {
            Some(session) => session,
            None => continue,
        };
        session.touch();

        let listener = listener.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_datagram(&session, datagram, peer, &listener, &ctx).await;
        });
    }
}

/// Looks up the existing pseudo-session for `peer`, creating one on first
/// sight. The same `(ip, port)` always maps to the same session for as
/// long as it lives, so PPv2/notification latches fire at most once.
fn session_for(
    sessions: &DashMap<SocketAddr, Arc<UdpSession>>,
    peer: SocketAddr,
    listen_socket: &Arc<UdpSocket>,
    listener: &Listener,
) -> Option<Arc<UdpSession>> {
    if let Some(existing) = sessions.get(&peer) {
        return Some(existing.clone());
    }

    match new_session(peer, listen_socket.clone(), listener) {
        Ok(session) => {
            sessions.insert(peer, session.clone());
            Some(session)
        }
        Err(e) => {
            tracing::warn!(client = %peer, error = %e, "udp: failed to create session");
            None
        }
    }
}

fn new_session(
    peer: SocketAddr,
    listen_socket: Arc<UdpSocket>,
    listener: &Listener,
) -> anyhow::Result<Arc<UdpSession>> {
    let bind_any = if peer.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let egress = std::net::UdpSocket::bind(bind_any).context("bind udp egress socket")?;
    egress.set_nonblocking(true)?;
    let egress = Arc::new(UdpSocket::from_std(egress)?);

    let (tx, rx) = watch::channel(None);
    let target_host = listener.target.host.clone();
    let target_port = listener.target.udp.unwrap_or(0);
    tokio::spawn(async move {
        match resolve_target(&target_host, target_port).await {
            Ok(addr) => {
                let _ = tx.send(Some(addr));
            }
            Err(e) => {
                tracing::warn!(host = %target_host, error = %e, "udp: target resolution failed");
            }
        }
    });

    let session = Arc::new(UdpSession {
        egress: egress.clone(),
        target_addr_rx: rx,
        ppv2_sent: AtomicBool::new(false),
        notified: AtomicBool::new(false),
        logged: AtomicBool::new(false),
        last_seen_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        player_name: Mutex::new(None),
    });

    tokio::spawn(async move {
        egress_read_loop(egress, listen_socket, peer).await;
    });

    Ok(session)
}

async fn resolve_target(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().context("dns lookup returned no addresses")
}

async fn egress_read_loop(egress: Arc<UdpSocket>, listen_socket: Arc<UdpSocket>, peer: SocketAddr) {
    let mut buf = vec![0u8; RECV_BUF];
    loop {
        match egress.recv(&mut buf).await {
            Ok(n) => {
                let _ = listen_socket.send_to(&buf[..n], peer).await;
            }
            Err(_) => break,
        }
    }
}

async fn handle_datagram(
    session: &Arc<UdpSession>,
    datagram: Vec<u8>,
    peer: SocketAddr,
    listener: &Listener,
    ctx: &ForwarderContext,
) {
    let chain = ppv2::decode_chain(&datagram);
    let (original_ip, original_port, payload) = match chain.original_client() {
        Some((ip, port)) => (ip, port, chain.payload.to_vec()),
        None => (peer.ip(), peer.port(), datagram),
    };

    let dst = {
        let mut rx = session.target_addr_rx.clone();
        if rx.borrow().is_none() {
            let _ = rx.changed().await;
        }
        *rx.borrow()
    };
    let Some(dst) = dst else {
        tracing::debug!(peer = %peer, "udp: dropping datagram, target unresolved");
        return;
    };

    let mut out = payload;
    if listener.haproxy && !session.ppv2_sent.swap(true, Ordering::SeqCst) {
        let header = ppv2::encode((original_ip, original_port), (dst.ip(), dst.port()), true);
        let mut framed = header;
        framed.extend_from_slice(&out);
        out = framed;
    }

    if session.egress.send_to(&out, dst).await.is_err() {
        return;
    }

    if !session.logged.swap(true, Ordering::SeqCst) {
        tracing::info!(client = %peer, original_ip = %original_ip, original_port = original_port, "udp: session established");
    }

    if !session.notified.swap(true, Ordering::SeqCst) {
        if let Some(webhook) = listener.webhook_url() {
            if ctx.correlation_mode {
                let flow = PendingFlow {
                    ip: original_ip.to_string(),
                    port: original_port,
                    protocol: "udp".into(),
                    arrival_ts: chrono::Utc::now().timestamp_millis(),
                };
                let rx = ctx.pending.insert(flow);
                let session = session.clone();
                tokio::spawn(async move {
                    if let Ok(Some(name)) = rx.await {
                        session.set_player_name(name).await;
                    }
                });
            } else {
                ctx.aggregator.add_connect(
                    webhook,
                    &listener.target.host,
                    &original_ip.to_string(),
                    original_port,
                    "udp",
                );
            }
        }
    }
}

async fn sweep_loop(
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    listener: Arc<Listener>,
    ctx: Arc<ForwarderContext>,
) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        sweep_once(&sessions, &listener, &ctx, UDP_SESSION_IDLE_MS, now_ms).await;
    }
}

/// One eviction pass: removes and reports every session idle past
/// `idle_ms` as of `now_ms`. Split out of `sweep_loop` so tests can drive
/// eviction with a short threshold instead of waiting on real time.
async fn sweep_once(
    sessions: &DashMap<SocketAddr, Arc<UdpSession>>,
    listener: &Listener,
    ctx: &ForwarderContext,
    idle_ms: i64,
    now_ms: i64,
) {
    let expired: Vec<SocketAddr> = sessions
        .iter()
        .filter(|e| e.value().idle_for_ms(now_ms) > idle_ms)
        .map(|e| *e.key())
        .collect();

    for peer in expired {
        if let Some((_, session)) = sessions.remove(&peer) {
            emit_leave(&session, peer, listener, ctx).await;
        }
    }
}

async fn emit_leave(
    session: &UdpSession,
    peer: SocketAddr,
    listener: &Listener,
    ctx: &ForwarderContext,
) {
    if let Some(webhook) = listener.webhook_url() {
        let name = session.player_name.lock().await.clone();
        match name {
            Some(name) => {
                let embed = embeds::leave_embed(&name, &peer.ip().to_string(), "udp");
                crate::notify::webhook::post_embed(&ctx_client(ctx), webhook, embed).await;
            }
            None if !ctx.correlation_mode => {
                ctx.aggregator.add_disconnect(
                    webhook,
                    &listener.target.host,
                    &peer.ip().to_string(),
                    peer.port(),
                    "udp",
                );
            }
            None => {}
        }
    }
    tracing::debug!(client = %peer, "udp: session expired");
}

fn ctx_client(ctx: &ForwarderContext) -> reqwest::Client {
    ctx.aggregator.http_client()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::identity::PendingBuffer;
    use crate::notify::Aggregator;

    fn test_listener(haproxy: bool, webhook: Option<&str>) -> Arc<Listener> {
        Arc::new(Listener {
            bind: "127.0.0.1".into(),
            tcp: None,
            udp: Some(19132),
            haproxy,
            webhook: webhook.map(String::from),
            target: Target {
                host: "127.0.0.1".into(),
                tcp: None,
                udp: Some(25565),
            },
        })
    }

    fn test_ctx(correlation_mode: bool) -> Arc<ForwarderContext> {
        Arc::new(ForwarderContext {
            correlation_mode,
            pending: PendingBuffer::new(),
            aggregator: Aggregator::new(reqwest::Client::new()),
        })
    }

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn session_with_resolved_dst(egress: Arc<UdpSocket>, dst: Option<SocketAddr>) -> Arc<UdpSession> {
        let (_tx, rx) = watch::channel(dst);
        Arc::new(UdpSession {
            egress,
            target_addr_rx: rx,
            ppv2_sent: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            logged: AtomicBool::new(false),
            last_seen_ms: AtomicI64::new(0),
            player_name: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_session_for_reuses_existing_session_for_same_peer() {
        let sessions: DashMap<SocketAddr, Arc<UdpSession>> = DashMap::new();
        let listen_socket = bound_socket().await;
        let listener = test_listener(false, None);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let first = session_for(&sessions, peer, &listen_socket, &listener).unwrap();
        let second = session_for(&sessions, peer, &listen_socket, &listener).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_datagram_sends_ppv2_header_once_per_session() {
        let backend = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let egress = bound_socket().await;
        let session = session_with_resolved_dst(egress, Some(backend_addr));

        let listener = test_listener(true, None);
        let ctx = test_ctx(false);
        let peer: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        handle_datagram(&session, b"hello".to_vec(), peer, &listener, &ctx).await;
        handle_datagram(&session, b"world".to_vec(), peer, &listener, &ctx).await;

        let mut buf = [0u8; 1024];
        let (n1, _) = backend.recv_from(&mut buf).await.unwrap();
        assert!(buf[..n1].starts_with(&ppv2::SIGNATURE), "first datagram carries the ppv2 preamble");

        let (n2, _) = backend.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"world", "second datagram on the same session carries no preamble");
    }

    #[tokio::test]
    async fn test_handle_datagram_forwards_without_ppv2_when_haproxy_disabled() {
        let backend = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let egress = bound_socket().await;
        let session = session_with_resolved_dst(egress, Some(backend_addr));

        let listener = test_listener(false, None);
        let ctx = test_ctx(false);
        let peer: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        handle_datagram(&session, b"hello".to_vec(), peer, &listener, &ctx).await;

        let mut buf = [0u8; 1024];
        let (n, _) = backend.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_sweep_once_evicts_sessions_past_idle_threshold() {
        let sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>> = Arc::new(DashMap::new());
        let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let egress = bound_socket().await;
        let session = session_with_resolved_dst(egress, None);
        sessions.insert(peer, session);

        let listener = test_listener(false, None);
        let ctx = test_ctx(false);

        sweep_once(&sessions, &listener, &ctx, 1_000, 500).await;
        assert_eq!(sessions.len(), 1, "not idle past threshold yet");

        sweep_once(&sessions, &listener, &ctx, 1_000, 5_000).await;
        assert_eq!(sessions.len(), 0, "idle past threshold evicted");
    }
}
