use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dns::{DNS_HEADER_SIZE, Packet, Rcode, Transport};
use crate::listener::ListenerScope;
use crate::query::{InFlightGuard, InFlightTable, Registration, ReplySink, RequestKey, StubQuery};
use crate::reply;
use crate::resolver::{QueryFlags, Resolver, ResolverQuery};

/// A validated request ready to be run as a query task.
pub struct PreparedQuery {
    pub query: StubQuery,
    pub resolver_query: ResolverQuery,
    pub flags: QueryFlags,
    pub guard: Option<InFlightGuard>,
}

/// Translates wire requests into resolver transactions: ingress
/// validation, duplicate suppression, mode selection.
pub struct Dispatcher {
    resolver: Arc<dyn Resolver>,
    /// Precomputed NSID payload, handed out on the primary listener.
    nsid: Option<Vec<u8>>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn Resolver>, nsid: Option<Vec<u8>>) -> Self {
        Self { resolver, nsid }
    }

    pub fn nsid(&self) -> Option<&[u8]> {
        self.nsid.as_deref()
    }

    /// Run the ingress pipeline on one wire message. Rejections are
    /// answered (or dropped) here; `Some` means a resolver transaction
    /// should be started for the returned query.
    pub async fn ingress(
        &self,
        bytes: Vec<u8>,
        transport: Transport,
        sender: SocketAddr,
        destination: Option<SocketAddr>,
        scope: ListenerScope,
        sink: ReplySink,
        inflight: &Arc<InFlightTable>,
    ) -> Option<PreparedQuery> {
        // The primary listener serves the local host only.
        if scope.is_primary() && !sender.ip().is_loopback() {
            debug!(%sender, transport = transport.as_str(), "dropping non-loopback packet on stub listener");
            return None;
        }

        if bytes.len() < DNS_HEADER_SIZE {
            debug!(%sender, transport = transport.as_str(), "dropping runt datagram");
            return None;
        }

        // Duplicate suppression works on the raw bytes, before parsing.
        let key = RequestKey::new(transport, sender, &bytes)?;
        let guard = match InFlightTable::register(inflight, key, &bytes) {
            Registration::Duplicate => {
                debug!(
                    id = u16::from_be_bytes([bytes[0], bytes[1]]),
                    %sender,
                    transport = transport.as_str(),
                    "dropping retransmit of in-flight query"
                );
                return None;
            }
            Registration::Registered(guard) => Some(guard),
            Registration::Skipped => None,
        };

        let mut request = match Packet::decode(&bytes, transport) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(
                    id = u16::from_be_bytes([bytes[0], bytes[1]]),
                    %sender,
                    transport = transport.as_str(),
                    "failed to parse query, replying FORMERR: {err}"
                );
                self.send_raw_failure(&bytes, transport, scope, &sink).await;
                return None;
            }
        };
        request.sender = Some(sender);
        request.destination = destination;

        if self.resolver.packet_is_our_own(&request) {
            debug!(
                id = request.id(),
                transport = transport.as_str(),
                "dropping looped-back copy of our own upstream query"
            );
            return None;
        }
        if request.qr() {
            debug!(
                id = request.id(),
                transport = transport.as_str(),
                "dropping unexpected response packet"
            );
            return None;
        }

        if request.opcode() != 0 {
            self.send_failure(&request, scope, Rcode::NOTIMP, &sink).await;
            return None;
        }

        if request.questions.len() != 1 {
            self.send_failure(&request, scope, Rcode::FORMERR, &sink).await;
            return None;
        }

        if let Some(opt) = &request.opt {
            if opt.version > crate::constants::EDNS_VERSION {
                self.send_failure(&request, scope, Rcode::BADVERS, &sink).await;
                return None;
            }
        }

        let question = request.questions[0].clone();
        if question.qtype.is_obsolete() || question.qtype.is_zone_transfer() {
            self.send_failure(&request, scope, Rcode::REFUSED, &sink).await;
            return None;
        }

        // A stub serves resolving clients only.
        if !request.rd() {
            self.send_failure(&request, scope, Rcode::REFUSED, &sink).await;
            return None;
        }

        // DO+CD clients get the upstream packet passed through almost
        // verbatim; everyone else gets assembled replies.
        let bypass = request.do_bit() && request.cd();
        let (resolver_query, flags) = if bypass {
            (ResolverQuery::RawPacket(bytes), QueryFlags::bypass())
        } else {
            (
                ResolverQuery::Question(question),
                QueryFlags::stub(request.do_bit()),
            )
        };

        Some(PreparedQuery {
            query: StubQuery {
                request,
                scope,
                bypass,
                sink,
            },
            resolver_query,
            flags,
            guard,
        })
    }

    /// Drive one prepared query to completion: resolver transaction,
    /// section assembly, finalization, egress. The in-flight guard drops
    /// (and deregisters) when this future finishes or is aborted.
    pub async fn run_query(self: Arc<Self>, prepared: PreparedQuery) {
        let PreparedQuery {
            query,
            resolver_query,
            flags,
            guard: _guard,
        } = prepared;

        let answer = self.resolver.submit(resolver_query, flags).await;

        match reply::finalize(&query.request, query.scope, &answer, self.nsid()) {
            Ok(Some(reply)) => query.sink.send(&reply).await,
            Ok(None) => debug!(
                id = query.request.id(),
                transport = query.request.transport.as_str(),
                state = ?answer.state,
                "resolver transaction ended without a reply"
            ),
            Err(err) => {
                warn!(
                    id = query.request.id(),
                    transport = query.request.transport.as_str(),
                    "failed to finalize reply, sending SERVFAIL: {err}"
                );
                self.send_failure(&query.request, query.scope, Rcode::SERVFAIL, &query.sink)
                    .await;
            }
        }
    }

    async fn send_failure(&self, request: &Packet, scope: ListenerScope, rcode: u16, sink: &ReplySink) {
        match reply::failure(request, scope, rcode, self.nsid()) {
            Ok(packet) => sink.send(&packet).await,
            Err(err) => warn!(
                id = request.id(),
                transport = request.transport.as_str(),
                "failed to build failure reply: {err}"
            ),
        }
    }

    /// FORMERR for a request that did not parse: echo the transaction ID
    /// and RD bit from the raw header, nothing else.
    async fn send_raw_failure(
        &self,
        bytes: &[u8],
        transport: Transport,
        scope: ListenerScope,
        sink: &ReplySink,
    ) {
        sink.send(&raw_formerr(bytes, transport, scope)).await;
    }
}

fn raw_formerr(bytes: &[u8], transport: Transport, scope: ListenerScope) -> Packet {
    let mut reply = Packet::new(scope.advertised_udp_size() as usize, transport);
    reply.set_id(u16::from_be_bytes([bytes[0], bytes[1]]));
    reply.set_qr(true);
    reply.set_rd(bytes[2] & 0x01 != 0);
    reply.set_ra(true);
    reply.set_rcode(Rcode::FORMERR as u8);
    reply
}
