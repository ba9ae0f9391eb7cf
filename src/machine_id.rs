use std::path::Path;

use ring::hmac;

use crate::error::{Result, StubError};

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Stable, per-host, non-reversible 128-bit identifier: the machine id
/// keyed through HMAC-SHA256 with an application-specific salt. Exposing
/// the raw machine id to DNS clients would leak it; the keyed digest
/// does not.
pub fn machine_app_specific_id(salt: &[u8; 16]) -> Result<[u8; 16]> {
    machine_app_specific_id_from(Path::new(MACHINE_ID_PATH), salt)
}

pub fn machine_app_specific_id_from(path: &Path, salt: &[u8; 16]) -> Result<[u8; 16]> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| StubError::MachineId(format!("{}: {err}", path.display())))?;
    let trimmed = text.trim();
    let machine_id: Vec<u8> = hex::decode(trimmed)
        .map_err(|err| StubError::MachineId(format!("{}: {err}", path.display())))?;
    if machine_id.len() != 16 {
        return Err(StubError::MachineId(format!(
            "{}: unexpected length {}",
            path.display(),
            machine_id.len()
        )));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, &machine_id);
    let tag = hmac::sign(&key, salt);
    let mut id = [0u8; 16];
    id.copy_from_slice(&tag.as_ref()[..16]);
    Ok(id)
}

/// NSID payload: hex identifier plus a fixed suffix.
pub fn nsid_string(id: &[u8; 16]) -> String {
    format!("{}{}", hex::encode(id), crate::constants::NSID_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn machine_id_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn stable_and_salt_dependent() {
        let file = machine_id_file("0123456789abcdef0123456789abcdef\n");
        let salt_a = [1u8; 16];
        let salt_b = [2u8; 16];
        let id1 = machine_app_specific_id_from(file.path(), &salt_a).unwrap();
        let id2 = machine_app_specific_id_from(file.path(), &salt_a).unwrap();
        let id3 = machine_app_specific_id_from(file.path(), &salt_b).unwrap();
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        // Not the raw machine id.
        assert_ne!(&id1[..], &hex::decode("0123456789abcdef0123456789abcdef").unwrap()[..]);
    }

    #[test]
    fn rejects_malformed_machine_id() {
        let file = machine_id_file("not-hex\n");
        assert!(machine_app_specific_id_from(file.path(), &[0u8; 16]).is_err());
    }

    #[test]
    fn nsid_has_suffix() {
        let nsid = nsid_string(&[0xab; 16]);
        assert!(nsid.starts_with("abab"));
        assert!(nsid.ends_with(".resolved.example"));
    }
}
