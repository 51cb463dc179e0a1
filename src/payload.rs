//! Opens a payload for upload. Binaries are recompressed with zstd into a
//! temp file so the bytes on the wire are always either the original file
//! or a zstd frame the agent knows how to unpack.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::classify::PayloadKind;
use crate::error::Error;

/// Compression level for binary payloads. zstd's default level trades a
/// little ratio for a lot of speed, which suits upload-sized artifacts.
const ZSTD_LEVEL: i32 = 3;

/// An open payload stream plus the metadata the server needs to name the
/// artifact. Dropping the value removes any temp file that was created.
pub struct EncodedPayload {
    reader: BufReader<File>,
    name: String,
    kind: PayloadKind,
    size: u64,
    // Held for its Drop: deletes the compressed temp file.
    _temp: Option<NamedTempFile>,
}

impl EncodedPayload {
    /// The original file's base name, used server-side to name the artifact.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Bytes that will be sent on the wire (post-compression for binaries).
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for EncodedPayload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Open `path` for upload according to its detected kind.
pub fn open(path: &Path, kind: PayloadKind) -> Result<EncodedPayload, Error> {
    let name = base_name(path);

    let encode_err = |source: io::Error| Error::EncodeFailed {
        path: path.display().to_string(),
        source,
    };

    match kind {
        PayloadKind::Binary => {
            let mut input = File::open(path).map_err(encode_err)?;
            let temp = NamedTempFile::new().map_err(encode_err)?;

            let mut encoder =
                zstd::stream::write::Encoder::new(temp.reopen().map_err(encode_err)?, ZSTD_LEVEL)
                    .map_err(encode_err)?;
            io::copy(&mut input, &mut encoder).map_err(encode_err)?;
            encoder.finish().map_err(encode_err)?;

            let mut compressed = temp.reopen().map_err(encode_err)?;
            let size = compressed.seek(SeekFrom::End(0)).map_err(encode_err)?;
            compressed.seek(SeekFrom::Start(0)).map_err(encode_err)?;
            debug!(payload = %path.display(), compressed = size, "binary payload zstd-framed");

            Ok(EncodedPayload {
                reader: BufReader::new(compressed),
                name,
                kind,
                size,
                _temp: Some(temp),
            })
        }
        _ => {
            let file = File::open(path).map_err(encode_err)?;
            let size = file.metadata().map_err(encode_err)?.len();
            Ok(EncodedPayload {
                reader: BufReader::new(file),
                name,
                kind,
                size,
                _temp: None,
            })
        }
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Where a payload argument points: an on-disk file or a registry image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    File(PathBuf),
    Image(String),
}

/// Resolve a payload argument. Existing files win over image-looking
/// strings so `./nginx:latest` on disk is never misread as a reference.
pub fn resolve_source(arg: &str) -> Result<PayloadSource, Error> {
    let path = PathBuf::from(arg);
    if path.exists() {
        return Ok(PayloadSource::File(path));
    }
    if crate::classify::is_image_reference(arg) {
        return Ok(PayloadSource::Image(arg.to_string()));
    }
    Err(Error::ClassifyFailed {
        path: arg.to_string(),
        reason: "no such file and not an image reference".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn binary_payload_is_zstd_framed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let body = vec![0xabu8; 4096];
        f.write_all(&body).unwrap();
        f.flush().unwrap();

        let mut encoded = open(f.path(), PayloadKind::Binary).unwrap();
        let mut wire = Vec::new();
        encoded.read_to_end(&mut wire).unwrap();

        assert_eq!(&wire[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
        assert_eq!(wire.len() as u64, encoded.size());

        // Decompressing yields byte-equal content to the source.
        let restored = zstd::stream::decode_all(&wire[..]).unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn script_payload_streams_verbatim() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        f.flush().unwrap();

        let mut encoded = open(f.path(), PayloadKind::Script).unwrap();
        let mut wire = Vec::new();
        encoded.read_to_end(&mut wire).unwrap();
        assert_eq!(wire, b"#!/bin/sh\necho hi\n");
    }

    #[test]
    fn name_is_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin").join("app");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let encoded = open(&path, PayloadKind::Script).unwrap();
        assert_eq!(encoded.name(), "app");
    }

    #[test]
    fn temp_file_removed_on_drop() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 128]).unwrap();
        f.flush().unwrap();

        let encoded = open(f.path(), PayloadKind::Binary).unwrap();
        let temp_path = encoded._temp.as_ref().unwrap().path().to_path_buf();
        assert!(temp_path.exists());
        drop(encoded);
        assert!(!temp_path.exists());
    }

    #[test]
    fn resolve_prefers_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx:latest");
        std::fs::write(&path, b"not an image").unwrap();
        let arg = path.to_string_lossy().into_owned();
        assert_eq!(
            resolve_source(&arg).unwrap(),
            PayloadSource::File(PathBuf::from(&arg))
        );
    }

    #[test]
    fn resolve_falls_back_to_image_reference() {
        assert_eq!(
            resolve_source("ghcr.io/x/y:tag").unwrap(),
            PayloadSource::Image("ghcr.io/x/y:tag".to_string())
        );
        assert!(resolve_source("definitely-missing-file").is_err());
    }
}
