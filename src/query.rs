use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::dns::{DNS_HEADER_SIZE, Packet, Transport};
use crate::listener::ListenerScope;

/// Duplicate-detection key for in-flight requests: transport, sender
/// endpoint (family, address, port) and the raw 12-byte header. Nothing
/// else participates in hashing or equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    transport: Transport,
    sender: SocketAddr,
    header: [u8; DNS_HEADER_SIZE],
}

impl RequestKey {
    pub fn new(transport: Transport, sender: SocketAddr, raw: &[u8]) -> Option<Self> {
        let header: [u8; DNS_HEADER_SIZE] = raw.get(..DNS_HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            transport,
            sender,
            header,
        })
    }
}

pub enum Registration {
    /// Entry installed; the returned guard removes it on drop.
    Registered(InFlightGuard),
    /// Same key, byte-equal payload: a client retransmit.
    Duplicate,
    /// Same key but a different payload; suppression is skipped for this
    /// request (installation is best-effort).
    Skipped,
}

/// Per-listener table of in-flight requests, used only for duplicate
/// suppression. A retransmit arriving while the original resolution is
/// pending must not spawn a second resolver transaction.
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: DashMap<RequestKey, Vec<u8>>,
}

impl InFlightTable {
    pub fn register(table: &Arc<InFlightTable>, key: RequestKey, raw: &[u8]) -> Registration {
        if let Some(existing) = table.entries.get(&key) {
            if existing.value() == raw {
                return Registration::Duplicate;
            }
            return Registration::Skipped;
        }
        table.entries.insert(key.clone(), raw.to_vec());
        Registration::Registered(InFlightGuard {
            table: table.clone(),
            key,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes the in-flight entry when the query completes or its task is
/// aborted.
#[derive(Debug)]
pub struct InFlightGuard {
    table: Arc<InFlightTable>,
    key: RequestKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.entries.remove(&self.key);
    }
}

/// Where the finished reply is written.
#[derive(Clone)]
pub enum ReplySink {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// Replies are handed to the stream's single writer task, which
    /// applies the 2-byte length framing; per-stream ordering is the
    /// completion order.
    Tcp { tx: mpsc::Sender<Bytes> },
}

impl ReplySink {
    /// Transport failures are logged and dropped; this layer never
    /// retries.
    pub async fn send(&self, reply: &Packet) {
        match self {
            ReplySink::Udp { socket, peer } => {
                if let Err(err) = socket.send_to(reply.as_bytes(), *peer).await {
                    error!(id = reply.id(), transport = "udp", %peer, "failed to send reply: {err}");
                }
            }
            ReplySink::Tcp { tx } => {
                if tx.send(Bytes::copy_from_slice(reply.as_bytes())).await.is_err() {
                    debug!(
                        id = reply.id(),
                        transport = "tcp",
                        "stream closed before reply could be written"
                    );
                }
            }
        }
    }
}

/// One in-flight client request owned by its query task.
pub struct StubQuery {
    pub request: Packet,
    pub scope: ListenerScope,
    pub bypass: bool,
    pub sink: ReplySink,
}
