use super::enums::{RecordClass, RecordType};
use super::name::{append_name, name_wire_len, names_equal, parse_name};
use crate::error::Result;
use crate::error::StubError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuestion {
    pub fn new(name: impl Into<String>, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            name: name.into(),
            qtype,
            qclass,
        }
    }

    /// Parse a question at `offset`, returning it and the offset just
    /// past it.
    pub fn parse(packet: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (name, pos) = parse_name(packet, offset)?;
        let fixed = packet
            .get(pos..pos + 4)
            .ok_or(StubError::TruncatedRecord)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]).into();
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]).into();
        Ok((
            Self {
                name,
                qtype,
                qclass,
            },
            pos + 4,
        ))
    }

    pub fn append_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        append_name(buf, &self.name)?;
        buf.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        buf.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
        Ok(())
    }

    pub fn wire_len(&self) -> usize {
        name_wire_len(&self.name) + 4
    }

    /// Class match with ANY semantics.
    pub fn class_matches(&self, class: RecordClass) -> bool {
        self.qclass == class || self.qclass == RecordClass::ANY || class == RecordClass::ANY
    }

    /// Direct match of a record key against this question.
    pub fn key_matches(&self, name: &str, rtype: RecordType, class: RecordClass) -> bool {
        names_equal(&self.name, name)
            && self.class_matches(class)
            && (self.qtype == rtype || self.qtype == RecordType::ANY)
    }
}
