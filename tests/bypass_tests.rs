mod common;

use std::time::{Duration, Instant};

use common::{QueryOpts, build_query, decode_reply};

use mimir::dns::{
    DnsQuestion, DnsRecord, Packet, Rcode, RecordClass, RecordType, Section, Transport,
};
use mimir::listener::ListenerScope;
use mimir::reply;
use mimir::resolver::{DnssecResult, ResolverAnswer, ResolverState};

fn decode_request(bytes: &[u8]) -> Packet {
    let mut packet = Packet::decode(bytes, Transport::Udp).unwrap();
    packet.sender = Some("127.0.0.1:40000".parse().unwrap());
    packet
}

fn bypass_request(id: u16) -> Packet {
    let opts = QueryOpts {
        cd: true,
        ..QueryOpts::dnssec()
    };
    decode_request(&build_query(id, "example.test", RecordType::A, opts))
}

/// An upstream reply packet as the resolver would hand it over,
/// received `age` ago.
fn upstream_reply(id: u16, ttl: u32, age: Duration, extra_answers: usize) -> Packet {
    let mut packet = Packet::new(65535, Transport::Udp);
    packet.set_id(id);
    packet.set_qr(true);
    packet.set_rd(true);
    packet.set_ra(true);
    packet
        .append_question(&DnsQuestion::new(
            "example.test",
            RecordType::A,
            RecordClass::IN,
        ))
        .unwrap();
    packet
        .append_record(
            &DnsRecord::a("example.test", ttl, std::net::Ipv4Addr::new(203, 0, 113, 7)),
            Section::Answer,
        )
        .unwrap();
    for i in 0..extra_answers {
        packet
            .append_record(
                &DnsRecord::new(
                    "example.test",
                    RecordType::TXT,
                    RecordClass::IN,
                    ttl,
                    {
                        let mut rdata = vec![100u8];
                        rdata.extend(std::iter::repeat(i as u8).take(100));
                        rdata
                    },
                ),
                Section::Answer,
            )
            .unwrap();
    }
    packet.append_opt(1232, true, 0, None).unwrap();

    let mut upstream = Packet::decode(packet.as_bytes(), Transport::Udp).unwrap();
    upstream.timestamp = Instant::now() - age;
    upstream
}

fn bypass_answer(upstream: Packet) -> ResolverAnswer {
    ResolverAnswer {
        state: ResolverState::Success,
        rcode: Rcode::NOERROR,
        dnssec: DnssecResult::NotValidated,
        items: Vec::new(),
        upstream: Some(upstream),
        fully_authenticated: false,
        fully_synthetic: false,
    }
}

#[test]
fn bypass_patches_id_size_and_ttls_only() {
    // S6 and the round-trip idempotence property: upstream of 300 s
    // TTLs received 2 s ago comes back with only ID, OPT size and TTLs
    // changed.
    let request = bypass_request(0x6001);
    let upstream = upstream_reply(0x9999, 300, Duration::from_secs(2), 0);
    let upstream_bytes = upstream.as_bytes().to_vec();

    let reply = reply::finalize(
        &request,
        ListenerScope::Primary,
        &bypass_answer(upstream),
        None,
    )
    .unwrap()
    .expect("bypass produces a reply");

    // Expected: same bytes, with the three patches applied by hand.
    let mut expected = Packet::decode(&upstream_bytes, Transport::Udp).unwrap();
    expected.set_id(0x6001);
    expected.patch_max_udp_size(65494).unwrap();
    expected.patch_ttls(Duration::from_secs(2)).unwrap();

    assert_eq!(reply.as_bytes(), expected.as_bytes());
    assert_eq!(reply.len(), upstream_bytes.len(), "wire length unchanged");

    let decoded = decode_reply(reply.as_bytes());
    assert_eq!(decoded.id(), 0x6001);
    assert_eq!(decoded.opt.as_ref().unwrap().udp_payload_size, 65494);
    let (answer_rrs, _, _) = common::section_records(&decoded);
    assert_eq!(answer_rrs[0].ttl, 298);
}

#[test]
fn bypass_preserves_upstream_rcode_and_flags() {
    let request = bypass_request(0x6002);
    let mut upstream = upstream_reply(0x9999, 60, Duration::from_secs(0), 0);
    upstream.set_rcode(Rcode::NXDOMAIN as u8);
    let upstream = Packet::decode(upstream.as_bytes(), Transport::Udp).unwrap();

    let reply = reply::finalize(
        &request,
        ListenerScope::Primary,
        &bypass_answer(upstream),
        None,
    )
    .unwrap()
    .unwrap();
    assert_eq!(reply.rcode() as u16, Rcode::NXDOMAIN);
    assert!(reply.qr());
}

#[test]
fn oversized_bypass_reply_is_cut_with_tc() {
    // Client advertises 512; upstream reply is far larger.
    let opts = QueryOpts {
        cd: true,
        dnssec_ok: true,
        udp_size: 512,
        edns: true,
        ..QueryOpts::plain()
    };
    let request = decode_request(&build_query(0x6003, "example.test", RecordType::A, opts));
    let upstream = upstream_reply(0x9999, 60, Duration::from_secs(0), 10);
    assert!(upstream.len() > 512);

    let reply = reply::finalize(
        &request,
        ListenerScope::Primary,
        &bypass_answer(upstream),
        None,
    )
    .unwrap()
    .unwrap();

    assert!(reply.tc());
    assert!(reply.len() <= 512);
    // Counts were fixed up to the surviving records.
    let decoded = decode_reply(reply.as_bytes());
    let (answer_rrs, _, _) = common::section_records(&decoded);
    assert_eq!(answer_rrs.len() as u16, decoded.ancount());
}

#[test]
fn bypass_without_upstream_packet_falls_back_to_assembly() {
    let request = bypass_request(0x6004);
    let answer = ResolverAnswer {
        state: ResolverState::Success,
        rcode: Rcode::NOERROR,
        dnssec: DnssecResult::NotValidated,
        items: vec![mimir::resolver::AnswerItem::new(DnsRecord::a(
            "example.test",
            300,
            std::net::Ipv4Addr::new(203, 0, 113, 7),
        ))],
        upstream: None,
        fully_authenticated: false,
        fully_synthetic: false,
    };

    let reply = reply::finalize(&request, ListenerScope::Primary, &answer, None)
        .unwrap()
        .unwrap();
    assert_eq!(reply.ancount(), 1);
    let decoded = decode_reply(reply.as_bytes());
    assert!(decoded.opt.is_some(), "assembled path still mirrors OPT");
}
