use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::config::StubConfig;
use crate::constants::{ADVERTISED_UDP_SIZE_EXTRA, TCP_SIZE_MAX};
use crate::dns::{
    DNS_HEADER_SIZE, DnsQuestion, DnsRecord, Packet, Rcode, RecordType, Transport, names_equal,
};
use crate::error::{Result, StubError};
use crate::resolver::{
    AnswerItem, DnssecResult, QueryFlags, Resolver, ResolverAnswer, ResolverQuery, ResolverState,
    SectionHint,
};

/// A [`Resolver`] that forwards questions to configured upstream
/// servers: UDP first, retried over TCP when the upstream truncates.
/// This is plain forwarding, not recursion; it exists so the binary is
/// a complete local stub on its own.
pub struct ForwardResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    attempts: usize,
    /// (transaction id, lowercased question name) of queries currently
    /// on the wire, so looped-back copies of them can be recognized.
    pending: DashMap<(u16, String), ()>,
}

impl ForwardResolver {
    pub fn new(config: &StubConfig) -> Self {
        Self {
            servers: config.upstream_servers.clone(),
            timeout: config.upstream_timeout,
            attempts: config.upstream_attempts.max(1),
            pending: DashMap::new(),
        }
    }

    fn build_query(&self, id: u16, question: &DnsQuestion, dnssec_ok: bool) -> Result<Vec<u8>> {
        let mut packet = Packet::new(TCP_SIZE_MAX, Transport::Udp);
        packet.set_id(id);
        packet.set_rd(true);
        packet.append_question(question)?;
        packet.append_opt(ADVERTISED_UDP_SIZE_EXTRA, dnssec_ok, 0, None)?;
        Ok(packet.as_bytes().to_vec())
    }

    async fn exchange(&self, wire: &[u8], id: u16) -> Result<Packet> {
        if self.servers.is_empty() {
            return Err(StubError::NoUpstreamServers);
        }

        let mut last_err = StubError::UpstreamTimeout;
        for _ in 0..self.attempts {
            for &server in &self.servers {
                match self.exchange_udp(server, wire, id).await {
                    Ok(reply) if reply.tc() => {
                        debug!(id, %server, "upstream reply truncated, retrying over tcp");
                        match self.exchange_tcp(server, wire, id).await {
                            Ok(reply) => return Ok(reply),
                            Err(err) => last_err = err,
                        }
                    }
                    Ok(reply) => return Ok(reply),
                    Err(err) => {
                        debug!(id, %server, "upstream exchange failed: {err}");
                        last_err = err;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn exchange_udp(&self, server: SocketAddr, wire: &[u8], id: u16) -> Result<Packet> {
        let local: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("static address is valid")
        } else {
            "[::]:0".parse().expect("static address is valid")
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; TCP_SIZE_MAX];
        let read = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| StubError::UpstreamTimeout)??;

        let reply = Packet::decode(&buf[..read], Transport::Udp)?;
        if reply.id() != id || !reply.qr() {
            return Err(StubError::InvalidUpstreamReply);
        }
        Ok(reply)
    }

    async fn exchange_tcp(&self, server: SocketAddr, wire: &[u8], id: u16) -> Result<Packet> {
        let exchange = async {
            let mut stream = TcpStream::connect(server).await?;
            stream
                .write_all(&(wire.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(wire).await?;

            let mut frame = [0u8; 2];
            stream.read_exact(&mut frame).await?;
            let length = u16::from_be_bytes(frame) as usize;
            let mut message = vec![0u8; length];
            stream.read_exact(&mut message).await?;
            Ok::<Vec<u8>, StubError>(message)
        };
        let message = timeout(self.timeout, exchange)
            .await
            .map_err(|_| StubError::UpstreamTimeout)??;

        let reply = Packet::decode(&message, Transport::Tcp)?;
        if reply.id() != id || !reply.qr() {
            return Err(StubError::InvalidUpstreamReply);
        }
        Ok(reply)
    }

    fn answer_from_reply(&self, reply: Packet, bypass: bool) -> ResolverAnswer {
        let rcode = reply
            .opt
            .as_ref()
            .map(|opt| opt.combined_rcode(reply.rcode()))
            .unwrap_or(reply.rcode() as u16);
        let state = match rcode {
            Rcode::NOERROR => ResolverState::Success,
            Rcode::NXDOMAIN => ResolverState::NotFound,
            _ => ResolverState::RcodeFailure,
        };
        let fully_authenticated = reply.ad();

        let items = match collect_items(&reply, fully_authenticated) {
            Ok(items) => items,
            Err(err) => {
                debug!(id = reply.id(), "failed to extract upstream records: {err}");
                return ResolverAnswer::failure(ResolverState::InvalidReply);
            }
        };

        ResolverAnswer {
            state,
            rcode,
            dnssec: DnssecResult::NotValidated,
            items,
            upstream: bypass.then(|| reply.duplicate()),
            fully_authenticated,
            fully_synthetic: false,
        }
    }
}

#[async_trait]
impl Resolver for ForwardResolver {
    async fn submit(&self, query: ResolverQuery, flags: QueryFlags) -> ResolverAnswer {
        let id: u16 = rand::random();
        let bypass = matches!(query, ResolverQuery::RawPacket(_));

        let (wire, qname) = match query {
            ResolverQuery::Question(question) => {
                let wire = match self.build_query(id, &question, flags.require_primary) {
                    Ok(wire) => wire,
                    Err(_) => return ResolverAnswer::failure(ResolverState::Errno),
                };
                (wire, question.name.to_ascii_lowercase())
            }
            ResolverQuery::RawPacket(mut bytes) => {
                // Never reuse the client's transaction id upstream.
                bytes[0..2].copy_from_slice(&id.to_be_bytes());
                let qname = Packet::decode(&bytes, Transport::Udp)
                    .ok()
                    .and_then(|packet| packet.question().map(|q| q.name.to_ascii_lowercase()))
                    .unwrap_or_default();
                (bytes, qname)
            }
        };

        self.pending.insert((id, qname.clone()), ());
        let outcome = self.exchange(&wire, id).await;
        self.pending.remove(&(id, qname));

        match outcome {
            Ok(reply) => self.answer_from_reply(reply, bypass),
            Err(StubError::UpstreamTimeout) => ResolverAnswer::failure(ResolverState::Timeout),
            Err(StubError::NoUpstreamServers) => ResolverAnswer::failure(ResolverState::NoServers),
            Err(StubError::InvalidUpstreamReply) => {
                ResolverAnswer::failure(ResolverState::InvalidReply)
            }
            Err(StubError::Io(_)) => ResolverAnswer::failure(ResolverState::Errno),
            Err(_) => ResolverAnswer::failure(ResolverState::InvalidReply),
        }
    }

    fn packet_is_our_own(&self, packet: &Packet) -> bool {
        if packet.qr() {
            return false;
        }
        let Some(question) = packet.question() else {
            return false;
        };
        self.pending
            .contains_key(&(packet.id(), question.name.to_ascii_lowercase()))
    }
}

/// Walk the reply sections into answer items, attaching each RRSIG to
/// the record it covers (same section, same owner) as a sidecar.
fn collect_items(reply: &Packet, authenticated: bool) -> Result<Vec<AnswerItem>> {
    let bytes = reply.as_bytes();
    let mut pos = DNS_HEADER_SIZE;
    for _ in 0..reply.qdcount() {
        let (_, next) = DnsQuestion::parse(bytes, pos)?;
        pos = next;
    }

    let mut items = Vec::new();
    let sections = [
        (reply.ancount(), SectionHint::Answer),
        (reply.nscount(), SectionHint::Authority),
        (reply.arcount(), SectionHint::Additional),
    ];
    for (count, hint) in sections {
        let section_start = items.len();
        for _ in 0..count {
            let (record, next) = DnsRecord::parse(bytes, pos)?;
            pos = next;
            if record.rtype == RecordType::OPT {
                continue;
            }
            if record.rtype == RecordType::RRSIG {
                if let Some(item) = covered_item(&mut items[section_start..], &record) {
                    item.rrsig = Some(record);
                    continue;
                }
            }
            items.push(
                AnswerItem::new(record)
                    .with_hint(hint)
                    .authenticated(authenticated),
            );
        }
    }
    Ok(items)
}

fn covered_item<'a>(
    section: &'a mut [AnswerItem],
    rrsig: &DnsRecord,
) -> Option<&'a mut AnswerItem> {
    let covered: RecordType = u16::from_be_bytes([
        *rrsig.rdata.first()?,
        *rrsig.rdata.get(1)?,
    ])
    .into();
    section.iter_mut().find(|item| {
        item.rrsig.is_none()
            && item.record.rtype == covered
            && names_equal(&item.record.name, &rrsig.name)
    })
}
