use std::net::SocketAddr;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use super::edns::{EdnsOpt, append_opt_record, opt_record_len};
use super::header::{DNS_HEADER_SIZE, DnsHeader};
use super::name::skip_name;
use super::question::DnsQuestion;
use super::record::DnsRecord;
use crate::error::{Result, StubError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// Reply section a record is written into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// A DNS message in wire form plus ingress metadata. The byte buffer is
/// authoritative; parsed questions and OPT data are extracted views.
///
/// Construction methods are atomic with respect to the declared maximum
/// size: an append that would overflow leaves the written length
/// unchanged and returns [`StubError::SizeExceeded`].
#[derive(Clone, Debug)]
pub struct Packet {
    data: Vec<u8>,
    max_size: usize,
    reserved: usize,
    pub transport: Transport,
    pub sender: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub timestamp: Instant,
    pub questions: SmallVec<[DnsQuestion; 1]>,
    pub opt: Option<EdnsOpt>,
    opt_offset: Option<usize>,
}

struct RawRecord {
    start: usize,
    rtype: u16,
    ttl_at: usize,
    next: usize,
}

fn walk_record(data: &[u8], offset: usize) -> Result<RawRecord> {
    let fixed_at = skip_name(data, offset)?;
    let fixed = data
        .get(fixed_at..fixed_at + 10)
        .ok_or(StubError::TruncatedRecord)?;
    let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
    let next = fixed_at + 10 + rdlength;
    if data.len() < next {
        return Err(StubError::TruncatedRecord);
    }
    Ok(RawRecord {
        start: offset,
        rtype,
        ttl_at: fixed_at + 4,
        next,
    })
}

impl Packet {
    /// Start a new message bounded to `max_size` bytes on the wire.
    pub fn new(max_size: usize, transport: Transport) -> Self {
        Self {
            data: vec![0; DNS_HEADER_SIZE],
            max_size,
            reserved: 0,
            transport,
            sender: None,
            destination: None,
            timestamp: Instant::now(),
            questions: SmallVec::new(),
            opt: None,
            opt_offset: None,
        }
    }

    /// Parse a wire message. Header counts must agree exactly with the
    /// sections present.
    pub fn decode(bytes: &[u8], transport: Transport) -> Result<Self> {
        let header = DnsHeader::parse(bytes)?;
        let mut pos = DNS_HEADER_SIZE;

        let mut questions = SmallVec::new();
        for _ in 0..header.qdcount {
            let (question, next) = DnsQuestion::parse(bytes, pos)?;
            questions.push(question);
            pos = next;
        }

        let mut opt = None;
        let mut opt_offset = None;
        let record_total =
            header.ancount as usize + header.nscount as usize + header.arcount as usize;
        for _ in 0..record_total {
            let raw = walk_record(bytes, pos)?;
            if raw.rtype == u16::from(super::enums::RecordType::OPT) {
                if opt.is_some() {
                    return Err(StubError::InvalidOpt);
                }
                let (record, _) = DnsRecord::parse(bytes, raw.start)?;
                let class: u16 = record.class.into();
                opt = Some(EdnsOpt::parse_from_record(class, record.ttl, &record.rdata)?);
                opt_offset = Some(raw.start);
            }
            pos = raw.next;
        }

        if pos != bytes.len() {
            return Err(StubError::CountMismatch);
        }

        Ok(Self {
            data: bytes.to_vec(),
            max_size: bytes.len(),
            reserved: 0,
            transport,
            sender: None,
            destination: None,
            timestamp: Instant::now(),
            questions,
            opt,
            opt_offset,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Byte-form equality; metadata is not compared.
    pub fn wire_eq(&self, other: &Packet) -> bool {
        self.data == other.data
    }

    pub fn duplicate(&self) -> Packet {
        self.clone()
    }

    /// Hold back `bytes` from the append budget, typically for an OPT RR
    /// that is appended last.
    pub fn reserve(&mut self, bytes: usize) {
        self.reserved = bytes;
    }

    // Header field accessors over the raw buffer.

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn set_id(&mut self, id: u16) {
        self.data[0..2].copy_from_slice(&id.to_be_bytes());
    }

    pub fn qr(&self) -> bool {
        self.data[2] & 0x80 != 0
    }

    pub fn opcode(&self) -> u8 {
        (self.data[2] >> 3) & 0x0F
    }

    pub fn aa(&self) -> bool {
        self.data[2] & 0x04 != 0
    }

    pub fn tc(&self) -> bool {
        self.data[2] & 0x02 != 0
    }

    pub fn rd(&self) -> bool {
        self.data[2] & 0x01 != 0
    }

    pub fn ra(&self) -> bool {
        self.data[3] & 0x80 != 0
    }

    pub fn ad(&self) -> bool {
        self.data[3] & 0x20 != 0
    }

    pub fn cd(&self) -> bool {
        self.data[3] & 0x10 != 0
    }

    /// The 4-bit header rcode; the extended high bits live in the OPT RR.
    pub fn rcode(&self) -> u8 {
        self.data[3] & 0x0F
    }

    pub fn set_qr(&mut self, value: bool) {
        self.set_bit(2, 0x80, value);
    }

    pub fn set_opcode(&mut self, opcode: u8) {
        self.data[2] = (self.data[2] & !0x78) | ((opcode & 0x0F) << 3);
    }

    pub fn set_aa(&mut self, value: bool) {
        self.set_bit(2, 0x04, value);
    }

    pub fn set_tc(&mut self, value: bool) {
        self.set_bit(2, 0x02, value);
    }

    pub fn set_rd(&mut self, value: bool) {
        self.set_bit(2, 0x01, value);
    }

    pub fn set_ra(&mut self, value: bool) {
        self.set_bit(3, 0x80, value);
    }

    pub fn set_ad(&mut self, value: bool) {
        self.set_bit(3, 0x20, value);
    }

    pub fn set_cd(&mut self, value: bool) {
        self.set_bit(3, 0x10, value);
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.data[3] = (self.data[3] & 0xF0) | (rcode & 0x0F);
    }

    fn set_bit(&mut self, index: usize, mask: u8, value: bool) {
        if value {
            self.data[index] |= mask;
        } else {
            self.data[index] &= !mask;
        }
    }

    pub fn qdcount(&self) -> u16 {
        self.count_at(4)
    }

    pub fn ancount(&self) -> u16 {
        self.count_at(6)
    }

    pub fn nscount(&self) -> u16 {
        self.count_at(8)
    }

    pub fn arcount(&self) -> u16 {
        self.count_at(10)
    }

    fn count_at(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.data[index], self.data[index + 1]])
    }

    fn set_count_at(&mut self, index: usize, value: u16) {
        self.data[index..index + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn header(&self) -> Result<DnsHeader> {
        DnsHeader::parse(&self.data)
    }

    /// First (and in practice only) question.
    pub fn question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    /// DO bit from the OPT RR, false without EDNS.
    pub fn do_bit(&self) -> bool {
        self.opt.as_ref().map(EdnsOpt::do_flag).unwrap_or(false)
    }

    /// UDP reply budget granted by the client: the OPT payload size
    /// (clamped up to 512), or 512 without EDNS.
    pub fn client_udp_size(&self) -> u16 {
        self.opt
            .as_ref()
            .map(|opt| opt.udp_payload_size.max(crate::constants::UDP_SIZE_MIN))
            .unwrap_or(crate::constants::UDP_SIZE_MIN)
    }

    // Construction.

    fn budget(&self) -> usize {
        self.max_size.saturating_sub(self.reserved)
    }

    fn append_atomic(&mut self, write: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<()> {
        let rollback = self.data.len();
        if let Err(err) = write(&mut self.data) {
            self.data.truncate(rollback);
            return Err(err);
        }
        if self.data.len() > self.budget() {
            self.data.truncate(rollback);
            return Err(StubError::SizeExceeded);
        }
        Ok(())
    }

    pub fn append_question(&mut self, question: &DnsQuestion) -> Result<()> {
        self.append_atomic(|buf| question.append_to(buf))?;
        let count = self.qdcount() + 1;
        self.set_count_at(4, count);
        self.questions.push(question.clone());
        Ok(())
    }

    pub fn append_record(&mut self, record: &DnsRecord, section: Section) -> Result<()> {
        self.append_atomic(|buf| record.append_to(buf))?;
        let index = match section {
            Section::Answer => 6,
            Section::Authority => 8,
            Section::Additional => 10,
        };
        let count = self.count_at(index) + 1;
        self.set_count_at(index, count);
        Ok(())
    }

    /// Append records until one no longer fits. Returns the count written
    /// together with the outcome; a partial write is always reported as
    /// the size-exceeded error, never silently.
    pub fn append_records(&mut self, records: &[DnsRecord], section: Section) -> (usize, Result<()>) {
        for (written, record) in records.iter().enumerate() {
            if let Err(err) = self.append_record(record, section) {
                return (written, Err(err));
            }
        }
        (records.len(), Ok(()))
    }

    /// Append the OPT pseudo-RR. Releases any reservation first; the OPT
    /// itself must still fit inside the maximum size.
    pub fn append_opt(
        &mut self,
        udp_payload_size: u16,
        do_bit: bool,
        rcode: u16,
        nsid: Option<&[u8]>,
    ) -> Result<()> {
        self.reserved = 0;
        if self.data.len() + opt_record_len(nsid.map(<[u8]>::len)) > self.max_size {
            return Err(StubError::SizeExceeded);
        }
        self.opt_offset = Some(self.data.len());
        append_opt_record(&mut self.data, udp_payload_size, do_bit, rcode, nsid);
        let count = self.arcount() + 1;
        self.set_count_at(10, count);
        Ok(())
    }

    // In-place patching, used on upstream packets in bypass mode.

    /// Rewrite the advertised UDP payload size inside the OPT RR, if any.
    pub fn patch_max_udp_size(&mut self, size: u16) -> Result<()> {
        let Some(offset) = self.opt_offset else {
            return Ok(());
        };
        let class_at = skip_name(&self.data, offset)? + 2;
        if self.data.len() < class_at + 2 {
            return Err(StubError::TruncatedRecord);
        }
        self.data[class_at..class_at + 2].copy_from_slice(&size.to_be_bytes());
        if let Some(opt) = self.opt.as_mut() {
            opt.udp_payload_size = size;
        }
        Ok(())
    }

    /// Age every record TTL by `elapsed`, clamping at zero. The OPT RR is
    /// skipped (its TTL field holds flags). Wire length is unchanged.
    pub fn patch_ttls(&mut self, elapsed: Duration) -> Result<()> {
        let decrement = elapsed.as_secs().min(u64::from(u32::MAX)) as u32;
        if decrement == 0 {
            return Ok(());
        }

        let mut pos = DNS_HEADER_SIZE;
        for _ in 0..self.qdcount() {
            let (_, next) = DnsQuestion::parse(&self.data, pos)?;
            pos = next;
        }

        let record_total =
            self.ancount() as usize + self.nscount() as usize + self.arcount() as usize;
        for _ in 0..record_total {
            let raw = walk_record(&self.data, pos)?;
            if raw.rtype != u16::from(super::enums::RecordType::OPT) {
                let ttl_bytes = &self.data[raw.ttl_at..raw.ttl_at + 4];
                let ttl = u32::from_be_bytes([ttl_bytes[0], ttl_bytes[1], ttl_bytes[2], ttl_bytes[3]]);
                let aged = ttl.saturating_sub(decrement);
                self.data[raw.ttl_at..raw.ttl_at + 4].copy_from_slice(&aged.to_be_bytes());
            }
            pos = raw.next;
        }
        Ok(())
    }

    /// Shrink the message to at most `new_size` bytes, dropping whole
    /// records from the tail and fixing up the section counts. If even
    /// the question section does not fit, only the header survives.
    pub fn truncate(&mut self, new_size: usize) -> Result<()> {
        if self.data.len() <= new_size {
            return Ok(());
        }

        let mut pos = DNS_HEADER_SIZE;
        for _ in 0..self.qdcount() {
            let next = match DnsQuestion::parse(&self.data, pos) {
                Ok((_, next)) => next,
                Err(_) => return Err(StubError::TruncatedRecord),
            };
            if next > new_size {
                // Question section unsalvageable: header only.
                self.data.truncate(DNS_HEADER_SIZE);
                self.set_count_at(4, 0);
                self.set_count_at(6, 0);
                self.set_count_at(8, 0);
                self.set_count_at(10, 0);
                self.questions.clear();
                self.opt = None;
                self.opt_offset = None;
                self.max_size = self.max_size.min(new_size);
                return Ok(());
            }
            pos = next;
        }

        let mut kept = [0u16; 3];
        let counts = [self.ancount(), self.nscount(), self.arcount()];
        let mut cut = pos;
        'sections: for (section, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                let raw = walk_record(&self.data, pos)?;
                if raw.next > new_size {
                    break 'sections;
                }
                pos = raw.next;
                cut = pos;
                kept[section] += 1;
            }
        }

        if self.opt_offset.is_some_and(|offset| offset >= cut) {
            self.opt = None;
            self.opt_offset = None;
        }
        self.data.truncate(cut);
        self.set_count_at(6, kept[0]);
        self.set_count_at(8, kept[1]);
        self.set_count_at(10, kept[2]);
        self.max_size = self.max_size.min(new_size);
        Ok(())
    }
}
