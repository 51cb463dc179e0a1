use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content hash the agent reported for an installed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHash {
    pub kind: String,
    pub sha256: String,
}

/// Hashes of the most recently installed payload and env file for a
/// service. `found == false` means the server has no prior state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactHashes {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ArtifactHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<ArtifactHash>,
}

/// SHA-256 of a file's contents, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

/// Streaming SHA-256 of a reader, lowercase hex.
pub fn sha256_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).context("Failed to hash stream")?;
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_and_bytes_agree() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"payload contents").unwrap();
        f.flush().unwrap();
        assert_eq!(
            sha256_file(f.path()).unwrap(),
            sha256_bytes(b"payload contents")
        );
    }

    #[test]
    fn reader_matches_bytes() {
        let data = b"streamed".to_vec();
        assert_eq!(
            sha256_reader(&data[..]).unwrap(),
            sha256_bytes(b"streamed")
        );
    }

    #[test]
    fn hashes_deserialize_with_absent_fields() {
        let h: ArtifactHashes = serde_json::from_str(r#"{"found":false}"#).unwrap();
        assert!(!h.found);
        assert!(h.payload.is_none());
        assert!(h.env.is_none());
    }
}
