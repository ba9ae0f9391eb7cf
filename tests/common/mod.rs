#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use mimir::dns::{
    DnsQuestion, DnsRecord, Packet, RecordClass, RecordType, Transport,
};
use mimir::resolver::{
    QueryFlags, Resolver, ResolverAnswer, ResolverQuery, ResolverState,
};

/// Scripted resolver: returns a canned answer and records what was
/// submitted.
pub struct MockResolver {
    answer: Mutex<ResolverAnswer>,
    pub submissions: AtomicUsize,
    pub last_flags: Mutex<Option<QueryFlags>>,
    pub last_query: Mutex<Option<ResolverQuery>>,
    own_packets: bool,
}

impl MockResolver {
    pub fn returning(answer: ResolverAnswer) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(answer),
            submissions: AtomicUsize::new(0),
            last_flags: Mutex::new(None),
            last_query: Mutex::new(None),
            own_packets: false,
        })
    }

    pub fn claiming_own_packets() -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(ResolverAnswer::failure(ResolverState::Aborted)),
            submissions: AtomicUsize::new(0),
            last_flags: Mutex::new(None),
            last_query: Mutex::new(None),
            own_packets: true,
        })
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn submit(&self, query: ResolverQuery, flags: QueryFlags) -> ResolverAnswer {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        *self.last_flags.lock() = Some(flags);
        *self.last_query.lock() = Some(query);
        self.answer.lock().clone()
    }

    fn packet_is_our_own(&self, _packet: &Packet) -> bool {
        self.own_packets
    }
}

#[derive(Clone, Copy, Default)]
pub struct QueryOpts {
    pub rd: bool,
    pub ad: bool,
    pub cd: bool,
    pub edns: bool,
    pub dnssec_ok: bool,
    pub nsid: bool,
    pub udp_size: u16,
}

impl QueryOpts {
    pub fn plain() -> Self {
        Self {
            rd: true,
            ..Self::default()
        }
    }

    pub fn edns() -> Self {
        Self {
            rd: true,
            edns: true,
            udp_size: 4096,
            ..Self::default()
        }
    }

    pub fn dnssec() -> Self {
        Self {
            dnssec_ok: true,
            ..Self::edns()
        }
    }
}

/// Build a client query in wire form.
pub fn build_query(id: u16, name: &str, qtype: RecordType, opts: QueryOpts) -> Vec<u8> {
    let mut packet = Packet::new(65535, Transport::Udp);
    packet.set_id(id);
    packet.set_rd(opts.rd);
    packet.set_ad(opts.ad);
    packet.set_cd(opts.cd);
    packet
        .append_question(&DnsQuestion::new(name, qtype, RecordClass::IN))
        .unwrap();
    if opts.edns {
        let nsid: Option<&[u8]> = if opts.nsid { Some(b"") } else { None };
        packet
            .append_opt(opts.udp_size, opts.dnssec_ok, 0, nsid)
            .unwrap();
    }
    packet.as_bytes().to_vec()
}

pub fn decode_reply(bytes: &[u8]) -> Packet {
    Packet::decode(bytes, Transport::Udp).expect("reply must decode")
}

/// Owner-sorted (name, type) pairs of all records in a reply section,
/// parsed straight off the wire.
pub fn section_records(reply: &Packet) -> (Vec<DnsRecord>, Vec<DnsRecord>, Vec<DnsRecord>) {
    let bytes = reply.as_bytes();
    let mut pos = 12;
    for _ in 0..reply.qdcount() {
        let (_, next) = DnsQuestion::parse(bytes, pos).unwrap();
        pos = next;
    }
    let mut take = |count: u16| -> Vec<DnsRecord> {
        let mut records = Vec::new();
        for _ in 0..count {
            let (record, next) = DnsRecord::parse(bytes, pos).unwrap();
            pos = next;
            records.push(record);
        }
        records
    };
    let answer = take(reply.ancount());
    let authority = take(reply.nscount());
    let additional = take(reply.arcount());
    (answer, authority, additional)
}

pub fn rrsig_for(name: &str, covered: RecordType) -> DnsRecord {
    let mut rdata = u16::from(covered).to_be_bytes().to_vec();
    rdata.extend_from_slice(&[8, 2, 0, 0, 1, 44]);
    rdata.extend_from_slice(&[0u8; 16]);
    DnsRecord::new(name, RecordType::RRSIG, RecordClass::IN, 300, rdata)
}

pub fn soa_record(zone: &str) -> DnsRecord {
    let mut rdata = Vec::new();
    mimir::dns::append_name(&mut rdata, &format!("ns1.{zone}")).unwrap();
    mimir::dns::append_name(&mut rdata, &format!("admin.{zone}")).unwrap();
    rdata.extend_from_slice(&[0u8; 20]);
    DnsRecord::new(zone, RecordType::SOA, RecordClass::IN, 3600, rdata)
}
