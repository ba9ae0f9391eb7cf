mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{MockResolver, QueryOpts, build_query, decode_reply};
use tokio::sync::mpsc;

use mimir::dispatch::Dispatcher;
use mimir::dns::{DnsRecord, Packet, Rcode, RecordType, Transport};
use mimir::listener::ListenerScope;
use mimir::query::{InFlightTable, ReplySink};
use mimir::resolver::{
    AnswerItem, DnssecResult, ResolverAnswer, ResolverQuery, ResolverState, SectionHint,
};

fn sender() -> SocketAddr {
    "127.0.0.1:45000".parse().unwrap()
}

fn success_answer(items: Vec<AnswerItem>) -> ResolverAnswer {
    ResolverAnswer {
        state: ResolverState::Success,
        rcode: Rcode::NOERROR,
        dnssec: DnssecResult::NotValidated,
        items,
        upstream: None,
        fully_authenticated: false,
        fully_synthetic: false,
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<MockResolver>,
    inflight: Arc<InFlightTable>,
    tx: mpsc::Sender<bytes::Bytes>,
    rx: mpsc::Receiver<bytes::Bytes>,
}

impl Harness {
    fn new(resolver: Arc<MockResolver>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(resolver.clone(), Some(b"nsid".to_vec())));
        let (tx, rx) = mpsc::channel(8);
        Self {
            dispatcher,
            resolver,
            inflight: Arc::new(InFlightTable::default()),
            tx,
            rx,
        }
    }

    async fn ingress(&self, bytes: Vec<u8>) -> Option<mimir::dispatch::PreparedQuery> {
        self.dispatcher
            .ingress(
                bytes,
                Transport::Udp,
                sender(),
                Some("127.0.0.53:53".parse().unwrap()),
                ListenerScope::Primary,
                ReplySink::Tcp {
                    tx: self.tx.clone(),
                },
                &self.inflight,
            )
            .await
    }

    async fn expect_reply(&mut self) -> Packet {
        let bytes = self.rx.recv().await.expect("a reply must be sent");
        decode_reply(&bytes)
    }
}

#[tokio::test]
async fn axfr_is_refused_without_resolver_contact() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let query = build_query(0x0401, "example.test", RecordType::AXFR, QueryOpts::plain());

    assert!(harness.ingress(query).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.rcode() as u16, Rcode::REFUSED);
    assert_eq!(reply.ancount(), 0);
    assert_eq!(harness.resolver.submission_count(), 0);
}

#[tokio::test]
async fn obsolete_type_is_refused() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let query = build_query(0x0402, "example.test", RecordType::MD, QueryOpts::plain());

    assert!(harness.ingress(query).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.rcode() as u16, Rcode::REFUSED);
}

#[tokio::test]
async fn missing_rd_is_refused() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let opts = QueryOpts {
        rd: false,
        ..QueryOpts::plain()
    };
    let query = build_query(0x0403, "example.test", RecordType::A, opts);

    assert!(harness.ingress(query).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.rcode() as u16, Rcode::REFUSED);
}

#[tokio::test]
async fn garbage_gets_formerr_with_mirrored_id() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    // Valid header claiming one question, but no question bytes follow.
    let mut bytes = vec![0u8; 12];
    bytes[0] = 0xAB;
    bytes[1] = 0xCD;
    bytes[4..6].copy_from_slice(&1u16.to_be_bytes());

    assert!(harness.ingress(bytes).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.id(), 0xABCD);
    assert_eq!(reply.rcode() as u16, Rcode::FORMERR);
    assert!(reply.qr());
}

#[tokio::test]
async fn runt_datagram_is_dropped_silently() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    assert!(harness.ingress(vec![0xFF; 5]).await.is_none());
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_edns_version_gets_badvers() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let mut query = build_query(0x0404, "example.test", RecordType::A, QueryOpts::edns());
    // Bump the version byte inside the OPT TTL field, locating the OPT
    // record by its type bytes.
    let opt_type = 41u16.to_be_bytes();
    let type_at = (1..query.len() - 1)
        .find(|&i| query[i] == opt_type[0] && query[i + 1] == opt_type[1] && query[i - 1] == 0)
        .expect("query has an OPT record");
    // TTL = type(2) + class(2), version is its second byte.
    query[type_at + 5] = 1;

    assert!(harness.ingress(query).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.rcode() as u16, 0); // low nibble of 16
    let rcode = reply.rcode();
    let opt = reply.opt.expect("BADVERS reply must carry an OPT");
    assert_eq!(opt.combined_rcode(rcode), Rcode::BADVERS);
}

#[tokio::test]
async fn non_query_opcode_gets_notimp() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let mut query = build_query(0x0405, "example.test", RecordType::A, QueryOpts::plain());
    query[2] |= 5 << 3; // opcode UPDATE

    assert!(harness.ingress(query).await.is_none());
    let reply = harness.expect_reply().await;
    assert_eq!(reply.rcode() as u16, Rcode::NOTIMP);
}

#[tokio::test]
async fn response_packets_are_dropped() {
    let mut harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let mut query = build_query(0x0406, "example.test", RecordType::A, QueryOpts::plain());
    query[2] |= 0x80; // QR

    assert!(harness.ingress(query).await.is_none());
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn own_upstream_packets_are_dropped() {
    let mut harness = Harness::new(MockResolver::claiming_own_packets());
    let query = build_query(0x0407, "example.test", RecordType::A, QueryOpts::plain());

    assert!(harness.ingress(query).await.is_none());
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn non_loopback_sender_is_dropped_on_primary() {
    let harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let query = build_query(0x0408, "example.test", RecordType::A, QueryOpts::plain());
    let outside: SocketAddr = "192.0.2.99:12345".parse().unwrap();

    let prepared = harness
        .dispatcher
        .ingress(
            query,
            Transport::Udp,
            outside,
            None,
            ListenerScope::Primary,
            ReplySink::Tcp {
                tx: harness.tx.clone(),
            },
            &harness.inflight,
        )
        .await;
    assert!(prepared.is_none());
}

#[tokio::test]
async fn duplicate_retransmit_resolves_once_and_replies_once() {
    let record = DnsRecord::a("example.test", 300, "203.0.113.7".parse().unwrap());
    let answer = success_answer(vec![AnswerItem::new(record).with_hint(SectionHint::Answer)]);
    let mut harness = Harness::new(MockResolver::returning(answer));

    let query = build_query(0x0501, "example.test", RecordType::A, QueryOpts::plain());
    let prepared = harness
        .ingress(query.clone())
        .await
        .expect("first copy starts a transaction");

    // Retransmit arrives while the first is still pending.
    assert!(harness.ingress(query.clone()).await.is_none());

    harness.dispatcher.clone().run_query(prepared).await;
    assert_eq!(harness.resolver.submission_count(), 1);

    let reply = harness.expect_reply().await;
    assert_eq!(reply.ancount(), 1);
    assert!(harness.rx.try_recv().is_err(), "exactly one reply");

    // Completion released the in-flight entry: a later identical query
    // resolves again.
    assert!(harness.ingress(query).await.is_some());
}

#[tokio::test]
async fn do_cd_selects_bypass_mode() {
    let harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let opts = QueryOpts {
        cd: true,
        ..QueryOpts::dnssec()
    };
    let query = build_query(0x0601, "example.test", RecordType::A, opts);

    let prepared = harness.ingress(query).await.expect("query accepted");
    assert!(prepared.query.bypass);
    assert!(matches!(prepared.resolver_query, ResolverQuery::RawPacket(_)));
    assert!(prepared.flags.no_cname);
    assert!(prepared.flags.no_validate);
    assert!(prepared.flags.require_primary);
}

#[tokio::test]
async fn plain_do_stays_in_normal_mode() {
    let harness = Harness::new(MockResolver::returning(success_answer(vec![])));
    let query = build_query(0x0602, "example.test", RecordType::A, QueryOpts::dnssec());

    let prepared = harness.ingress(query).await.expect("query accepted");
    assert!(!prepared.query.bypass);
    assert!(matches!(
        prepared.resolver_query,
        ResolverQuery::Question(_)
    ));
    assert!(prepared.flags.require_primary);
    assert!(!prepared.flags.no_cname);

    let plain = build_query(0x0603, "example.test", RecordType::A, QueryOpts::plain());
    let prepared = harness.ingress(plain).await.expect("query accepted");
    assert!(!prepared.flags.require_primary);
}
