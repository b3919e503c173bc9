//! SHA-256 content and chunk fingerprints.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::errors::{MirrorError, Result};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Length of a hex SHA-256 digest.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Hex SHA-256 of an in-memory buffer (chunk checksums).
pub fn bytes_checksum(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

/// Hex SHA-256 of a file's contents, streamed.
pub fn file_checksum(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| MirrorError::io(path, e))?;
    reader_checksum(file).map_err(|e| MirrorError::io(path, e))
}

/// Hex SHA-256 of everything a reader yields.
pub fn reader_checksum<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Accept only what [`bytes_checksum`] produces: lowercase hex of
/// [`CHECKSUM_HEX_LEN`] characters. Anything else must never reach a path.
pub fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.len() != CHECKSUM_HEX_LEN {
        return Err(MirrorError::InvalidChecksum {
            checksum: checksum.to_string(),
            details: format!("expected {CHECKSUM_HEX_LEN} hex characters, got {}", checksum.len()),
        });
    }
    if !checksum.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(MirrorError::InvalidChecksum {
            checksum: checksum.to_string(),
            details: "not lowercase hex".to_string(),
        });
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn known_vector() {
        assert_eq!(bytes_checksum(b"abc"), ABC_SHA256);
    }

    #[test]
    fn file_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(file_checksum(&path).unwrap(), ABC_SHA256);
    }

    #[test]
    fn only_lowercase_digests_are_valid() {
        assert!(validate_checksum(ABC_SHA256).is_ok());
        assert!(validate_checksum(&bytes_checksum(b"")).is_ok());
        let upper = ABC_SHA256.to_uppercase();
        let slashed = format!("{}/", &ABC_SHA256[..63]);
        let long = format!("{ABC_SHA256}0");
        for bad in ["", "abc", "../../victim", upper.as_str(), slashed.as_str(), long.as_str()] {
            let err = validate_checksum(bad).unwrap_err();
            assert_eq!(err.code(), "CMR-2002", "{bad:?}");
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = file_checksum(Path::new("/nonexistent/cmir/file")).unwrap_err();
        assert_eq!(err.code(), "CMR-3002");
    }
}
