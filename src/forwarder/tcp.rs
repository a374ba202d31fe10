//! TCP half of a listener rule: accept, connect, optionally emit PPv2,
//! splice both directions.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Listener;
use crate::identity::PendingFlow;
use crate::ppv2;

use super::ForwarderContext;

const FIRST_CHUNK_BUF: usize = 64 * 1024;

pub async fn serve(listener: Arc<Listener>, ctx: Arc<ForwarderContext>) -> anyhow::Result<()> {
    let port = listener.tcp.context("tcp forwarder started without a tcp port")?;
    let bind_addr = format!("{}:{port}", listener.bind);
    let tcp_listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind tcp {bind_addr}"))?;

    tracing::info!(bind = %bind_addr, target = %listener.target.host, "tcp: listening");

    loop {
        let (client, peer) = tcp_listener.accept().await?;
        let listener = listener.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(client, peer, listener, ctx).await;
        });
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    listener: Arc<Listener>,
    ctx: Arc<ForwarderContext>,
) {
    let target_port = match listener.target.tcp {
        Some(p) => p,
        None => return,
    };
    let target_addr = format!("{}:{target_port}", listener.target.host);

    let mut backend = match TcpStream::connect(&target_addr).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target = %target_addr, error = %e, "tcp: backend connect failed");
            return;
        }
    };

    let mut buf = vec![0u8; FIRST_CHUNK_BUF];
    let first_chunk = match client.read(&mut buf).await {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "tcp: client read failed before first chunk");
            None
        }
    };

    let (original_ip, original_port, remaining_payload) = match &first_chunk {
        Some(data) => {
            let chain = ppv2::decode_chain(data);
            match chain.original_client() {
                Some((ip, port)) => {
                    tracing::info!(client = %peer, original_ip = %ip, original_port = port, "tcp: adopted inbound ppv2 chain");
                    (ip, port, chain.payload.to_vec())
                }
                None => (peer.ip(), peer.port(), data.clone()),
            }
        }
        None => (peer.ip(), peer.port(), Vec::new()),
    };

    if listener.haproxy {
        match backend.peer_addr() {
            Ok(dst) => {
                let header = ppv2::encode((original_ip, original_port), (dst.ip(), dst.port()), false);
                if let Err(e) = backend.write_all(&header).await {
                    tracing::warn!(target = %target_addr, error = %e, "tcp: failed writing ppv2 preamble");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(target = %target_addr, error = %e, "tcp: backend peer_addr unavailable, skipping ppv2 preamble");
            }
        }
    }

    if !remaining_payload.is_empty() {
        if let Err(e) = backend.write_all(&remaining_payload).await {
            tracing::warn!(target = %target_addr, error = %e, "tcp: failed writing captured first chunk");
            return;
        }
    }

    notify_connect(&listener, &ctx, original_ip, original_port);

    let result = tokio::io::copy_bidirectional(&mut client, &mut backend).await;
    match result {
        Ok((client_to_backend, backend_to_client)) => {
            tracing::info!(
                client = %peer,
                target = %target_addr,
                bytes_client_to_backend = client_to_backend,
                bytes_backend_to_client = backend_to_client,
                "tcp: connection closed"
            );
        }
        Err(e) => {
            tracing::debug!(client = %peer, target = %target_addr, error = %e, "tcp: splice ended with error");
        }
    }
}

fn notify_connect(
    listener: &Listener,
    ctx: &ForwarderContext,
    original_ip: std::net::IpAddr,
    original_port: u16,
) {
    let webhook = match listener.webhook_url() {
        Some(w) => w,
        None => return,
    };

    if ctx.correlation_mode {
        let flow = PendingFlow {
            ip: original_ip.to_string(),
            port: original_port,
            protocol: "tcp".into(),
            arrival_ts: chrono::Utc::now().timestamp_millis(),
        };
        let _ = ctx.pending.insert(flow);
    } else {
        ctx.aggregator.add_connect(
            webhook,
            &listener.target.host,
            &original_ip.to_string(),
            original_port,
            "tcp",
        );
    }
}
