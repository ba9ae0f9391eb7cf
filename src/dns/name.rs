use crate::error::{Result, StubError};

const LABEL_MAX: usize = 63;
const NAME_MAX: usize = 255;
const POINTER_JUMP_MAX: usize = 127;

/// Append a domain name in uncompressed wire form. Names are dotted
/// strings without the trailing dot; the root is the empty string.
pub fn append_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    if name.is_empty() {
        buf.push(0);
        return Ok(());
    }

    let mut written = 0usize;
    for label in name.split('.') {
        if label.is_empty() || label.len() > LABEL_MAX {
            return Err(StubError::InvalidLabel);
        }
        written += label.len() + 1;
        if written + 1 > NAME_MAX {
            return Err(StubError::NameTooLong);
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

/// Wire length of a name in uncompressed form.
pub fn name_wire_len(name: &str) -> usize {
    if name.is_empty() {
        1
    } else {
        name.len() + 2
    }
}

/// Parse a possibly compressed name starting at `offset`. Returns the
/// name and the offset of the first byte after the name in the original
/// read position (pointers do not advance it past the pointer itself).
pub fn parse_name(packet: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut next = None;
    let mut jumps = 0usize;
    let mut total = 0usize;

    loop {
        let len = *packet.get(pos).ok_or(StubError::TruncatedRecord)? as usize;

        if len == 0 {
            if next.is_none() {
                next = Some(pos + 1);
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *packet.get(pos + 1).ok_or(StubError::TruncatedRecord)? as usize;
            if next.is_none() {
                next = Some(pos + 2);
            }
            jumps += 1;
            if jumps > POINTER_JUMP_MAX {
                return Err(StubError::PointerLoop);
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }

        if len > LABEL_MAX {
            return Err(StubError::InvalidLabel);
        }

        let start = pos + 1;
        let end = start + len;
        let bytes = packet.get(start..end).ok_or(StubError::TruncatedRecord)?;
        total += len + 1;
        if total + 1 > NAME_MAX {
            return Err(StubError::NameTooLong);
        }
        let label = std::str::from_utf8(bytes)
            .map_err(|_| StubError::InvalidLabel)?
            .to_string();
        labels.push(label);
        pos = end;
    }

    let next = next.unwrap_or(pos + 1);
    Ok((labels.join("."), next))
}

/// Skip over a possibly compressed name, returning the offset of the
/// first byte after it.
pub fn skip_name(packet: &[u8], offset: usize) -> Result<usize> {
    let mut pos = offset;
    loop {
        let len = *packet.get(pos).ok_or(StubError::TruncatedRecord)? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            if pos + 2 > packet.len() {
                return Err(StubError::TruncatedRecord);
            }
            return Ok(pos + 2);
        }
        if len > LABEL_MAX {
            return Err(StubError::InvalidLabel);
        }
        pos += len + 1;
    }
}

/// DNS names compare case-insensitively.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// True when `parent` is a proper ancestor of `child`.
pub fn name_is_ancestor(parent: &str, child: &str) -> bool {
    if names_equal(parent, child) {
        return false;
    }
    if parent.is_empty() {
        return !child.is_empty();
    }
    let (clen, plen) = (child.len(), parent.len());
    if clen <= plen + 1 {
        return false;
    }
    child.as_bytes()[clen - plen - 1] == b'.'
        && child[clen - plen..].eq_ignore_ascii_case(parent)
}
