use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::StubConfig;
use crate::constants::{NSID_SALT, TCP_SIZE_MAX};
use crate::dispatch::Dispatcher;
use crate::dns::Transport;
use crate::error::Result;
use crate::listener::{ListenerScope, ListenerSockets, bind_extra, bind_primary};
use crate::machine_id::{machine_app_specific_id, nsid_string};
use crate::query::{InFlightTable, ReplySink};
use crate::resolver::Resolver;

/// Bind every configured endpoint and serve until shutdown is
/// broadcast. In-flight queries are dropped silently at shutdown.
pub async fn run(
    config: StubConfig,
    resolver: Arc<dyn Resolver>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let nsid = match machine_app_specific_id(&NSID_SALT) {
        Ok(id) => Some(nsid_string(&id).into_bytes()),
        Err(err) => {
            warn!("cannot derive NSID identifier, disabling NSID: {err}");
            None
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(resolver, nsid));

    let mut listeners: Vec<ListenerSockets> = Vec::new();
    if config.stub_listener {
        if let Some(primary) = bind_primary()? {
            listeners.push(primary);
        }
    }
    for (index, extra) in config.extra_listeners.iter().enumerate() {
        if let Some(sockets) = bind_extra(index, extra) {
            listeners.push(sockets);
        }
    }

    if listeners.is_empty() {
        warn!("no stub listeners could be set up");
        return Ok(());
    }

    let mut servers = JoinSet::new();
    for sockets in listeners {
        let ListenerSockets {
            scope,
            udp,
            tcp,
            inflight,
        } = sockets;
        if let Some(socket) = udp {
            servers.spawn(run_udp(
                socket,
                scope,
                dispatcher.clone(),
                inflight.clone(),
                shutdown_tx.subscribe(),
            ));
        }
        if let Some(listener) = tcp {
            servers.spawn(run_tcp(
                listener,
                scope,
                dispatcher.clone(),
                inflight.clone(),
                shutdown_tx.subscribe(),
            ));
        }
    }

    while servers.join_next().await.is_some() {}
    info!("stub server shut down");
    Ok(())
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    scope: ListenerScope,
    dispatcher: Arc<Dispatcher>,
    inflight: Arc<InFlightTable>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let destination = socket.local_addr().ok();
    let mut buf = vec![0u8; TCP_SIZE_MAX];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(?scope, "udp listener received shutdown signal");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (read, sender) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?scope, "udp receive error: {err}");
                        continue;
                    }
                };
                let bytes = buf[..read].to_vec();
                let sink = ReplySink::Udp {
                    socket: socket.clone(),
                    peer: sender,
                };
                if let Some(prepared) = dispatcher
                    .ingress(bytes, Transport::Udp, sender, destination, scope, sink, &inflight)
                    .await
                {
                    // UDP queries cannot be cancelled externally; they
                    // complete or run into the resolver timeout.
                    tokio::spawn(dispatcher.clone().run_query(prepared));
                }
            }
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    scope: ListenerScope,
    dispatcher: Arc<Dispatcher>,
    inflight: Arc<InFlightTable>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(?scope, "tcp listener received shutdown signal");
                break;
            }
            result = listener.accept() => {
                let (stream, sender) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?scope, "tcp accept error: {err}");
                        continue;
                    }
                };
                let dispatcher = dispatcher.clone();
                let inflight = inflight.clone();
                tokio::spawn(async move {
                    handle_stream(stream, sender, scope, dispatcher, inflight).await;
                });
            }
        }
    }
}

/// Serve length-framed DNS messages on one TCP stream. Replies go
/// through a single writer task, so clients see them in completion
/// order. When the stream ends, every query it still carries is
/// cancelled before the stream's resources are dropped.
async fn handle_stream(
    stream: TcpStream,
    sender: SocketAddr,
    scope: ListenerScope,
    dispatcher: Arc<Dispatcher>,
    inflight: Arc<InFlightTable>,
) {
    let destination = stream.local_addr().ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<bytes::Bytes>(32);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = (message.len() as u16).to_be_bytes();
            if write_half.write_all(&frame).await.is_err()
                || write_half.write_all(&message).await.is_err()
            {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut queries = JoinSet::new();
    loop {
        let mut frame = [0u8; 2];
        match read_half.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                debug!(%sender, "tcp read error: {err}");
                break;
            }
        }
        let length = u16::from_be_bytes(frame) as usize;
        if length == 0 {
            warn!(%sender, "zero-length tcp message, closing stream");
            break;
        }

        let mut message = vec![0u8; length];
        if let Err(err) = read_half.read_exact(&mut message).await {
            debug!(%sender, "tcp read error: {err}");
            break;
        }

        let sink = ReplySink::Tcp { tx: tx.clone() };
        if let Some(prepared) = dispatcher
            .ingress(message, Transport::Tcp, sender, destination, scope, sink, &inflight)
            .await
        {
            queries.spawn(dispatcher.clone().run_query(prepared));
        }
    }

    // Cancel carried queries; their in-flight entries are released by
    // the aborted tasks' guards.
    queries.shutdown().await;
    drop(tx);
    let _ = writer.await;
}
