use super::enums::{RecordClass, RecordType};
use super::name::{append_name, name_is_ancestor, name_wire_len, names_equal, parse_name};
use crate::error::{Result, StubError};

/// A resource record with decompressed owner name and rdata. Rdata of
/// name-bearing types is re-encoded without compression pointers on
/// parse, so records remain valid outside their packet of origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// Dedup key: whole RRsets share one key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: String,
    pub class: RecordClass,
    pub rtype: RecordType,
}

impl DnsRecord {
    pub fn new(
        name: impl Into<String>,
        rtype: RecordType,
        class: RecordClass,
        ttl: u32,
        rdata: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            rtype,
            class,
            ttl,
            rdata,
        }
    }

    pub fn a(name: impl Into<String>, ttl: u32, addr: std::net::Ipv4Addr) -> Self {
        Self::new(name, RecordType::A, RecordClass::IN, ttl, addr.octets().to_vec())
    }

    pub fn aaaa(name: impl Into<String>, ttl: u32, addr: std::net::Ipv6Addr) -> Self {
        Self::new(
            name,
            RecordType::AAAA,
            RecordClass::IN,
            ttl,
            addr.octets().to_vec(),
        )
    }

    pub fn cname(name: impl Into<String>, ttl: u32, target: &str) -> Self {
        let mut rdata = Vec::new();
        append_name(&mut rdata, target).expect("valid target name");
        Self::new(name, RecordType::CNAME, RecordClass::IN, ttl, rdata)
    }

    pub fn dname(name: impl Into<String>, ttl: u32, target: &str) -> Self {
        let mut rdata = Vec::new();
        append_name(&mut rdata, target).expect("valid target name");
        Self::new(name, RecordType::DNAME, RecordClass::IN, ttl, rdata)
    }

    /// Parse a record at `offset`, returning it and the offset just past
    /// it.
    pub fn parse(packet: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (name, pos) = parse_name(packet, offset)?;
        let fixed = packet
            .get(pos..pos + 10)
            .ok_or(StubError::TruncatedRecord)?;
        let rtype: RecordType = u16::from_be_bytes([fixed[0], fixed[1]]).into();
        let class: RecordClass = u16::from_be_bytes([fixed[2], fixed[3]]).into();
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let rdata_start = pos + 10;
        let rdata_end = rdata_start + rdlength;
        if packet.len() < rdata_end {
            return Err(StubError::TruncatedRecord);
        }

        let rdata = decompress_rdata(packet, rdata_start, rdata_end, rtype)?;
        Ok((
            Self {
                name,
                rtype,
                class,
                ttl,
                rdata,
            },
            rdata_end,
        ))
    }

    pub fn append_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        append_name(buf, &self.name)?;
        buf.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        buf.extend_from_slice(&u16::from(self.class).to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.rdata);
        Ok(())
    }

    pub fn wire_len(&self) -> usize {
        name_wire_len(&self.name) + 10 + self.rdata.len()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: self.name.to_ascii_lowercase(),
            class: self.class,
            rtype: self.rtype,
        }
    }

    /// If this record redirects `current` to another name, return the new
    /// target. CNAME redirects its exact owner; DNAME redirects every
    /// name below its owner by suffix substitution.
    pub fn alias_target(&self, current: &str) -> Option<String> {
        match self.rtype {
            RecordType::CNAME => {
                if !names_equal(&self.name, current) {
                    return None;
                }
                let (target, _) = parse_name(&self.rdata, 0).ok()?;
                Some(target)
            }
            RecordType::DNAME => {
                if !name_is_ancestor(&self.name, current) {
                    return None;
                }
                let (target, _) = parse_name(&self.rdata, 0).ok()?;
                let prefix = if self.name.is_empty() {
                    current
                } else {
                    &current[..current.len() - self.name.len() - 1]
                };
                if target.is_empty() {
                    Some(prefix.to_string())
                } else {
                    Some(format!("{prefix}.{target}"))
                }
            }
            _ => None,
        }
    }
}

/// Rewrite compressed names inside rdata as uncompressed names. Types
/// without embedded names are copied verbatim.
fn decompress_rdata(
    packet: &[u8],
    start: usize,
    end: usize,
    rtype: RecordType,
) -> Result<Vec<u8>> {
    let raw = &packet[start..end];
    match rtype {
        RecordType::CNAME | RecordType::DNAME | RecordType::NS | RecordType::PTR => {
            let (target, next) = parse_name(packet, start)?;
            if next != end {
                return Err(StubError::TruncatedRecord);
            }
            let mut rdata = Vec::with_capacity(name_wire_len(&target));
            append_name(&mut rdata, &target)?;
            Ok(rdata)
        }
        RecordType::MX => {
            if raw.len() < 2 {
                return Err(StubError::TruncatedRecord);
            }
            let (exchange, next) = parse_name(packet, start + 2)?;
            if next != end {
                return Err(StubError::TruncatedRecord);
            }
            let mut rdata = Vec::with_capacity(2 + name_wire_len(&exchange));
            rdata.extend_from_slice(&raw[..2]);
            append_name(&mut rdata, &exchange)?;
            Ok(rdata)
        }
        RecordType::SRV => {
            if raw.len() < 6 {
                return Err(StubError::TruncatedRecord);
            }
            let (target, next) = parse_name(packet, start + 6)?;
            if next != end {
                return Err(StubError::TruncatedRecord);
            }
            let mut rdata = Vec::with_capacity(6 + name_wire_len(&target));
            rdata.extend_from_slice(&raw[..6]);
            append_name(&mut rdata, &target)?;
            Ok(rdata)
        }
        RecordType::SOA => {
            let (mname, pos) = parse_name(packet, start)?;
            let (rname, pos) = parse_name(packet, pos)?;
            if pos + 20 != end {
                return Err(StubError::TruncatedRecord);
            }
            let mut rdata =
                Vec::with_capacity(name_wire_len(&mname) + name_wire_len(&rname) + 20);
            append_name(&mut rdata, &mname)?;
            append_name(&mut rdata, &rname)?;
            rdata.extend_from_slice(&packet[pos..end]);
            Ok(rdata)
        }
        _ => Ok(raw.to_vec()),
    }
}
