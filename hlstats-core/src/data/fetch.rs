//! Object fetcher trait, payload decompression and the local-mirror fetcher.
//!
//! The `ObjectFetcher` trait abstracts over where partition objects live (an
//! S3 bucket, a directory mirror of it, an in-memory map in tests) so the
//! pipeline never knows which one it is talking to.

use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

/// Why a partition object could not be retrieved.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("object store unreachable: {0}")]
    Unreachable(String),

    #[error("access denied for {key}: {reason}")]
    Denied { key: String, reason: String },

    #[error("object {key} is unreadable: {reason}")]
    Unreadable { key: String, reason: String },

    #[error("object store refused requests (circuit breaker open)")]
    CircuitOpen,
}

impl FetchError {
    /// Errors that say nothing about the object itself; a later attempt may
    /// succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::CircuitOpen)
    }
}

/// Retrieves one partition's compressed payload by key.
pub trait ObjectFetcher: Send + Sync {
    /// Human-readable name of this fetcher.
    fn name(&self) -> &str;

    /// Fetch the raw (still compressed) bytes stored under `key`.
    fn fetch(&self, key: &str) -> Result<Vec<u8>, FetchError>;

    /// Confirm the store is reachable and accepts this fetcher's
    /// credentials. Called once before a run.
    fn verify(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Decompress an LZ4 frame. A corrupt frame means the object is unreadable.
pub fn decompress_lz4(key: &str, compressed: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::with_capacity(compressed.len() * 4);
    lz4_flex::frame::FrameDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| FetchError::Unreadable {
            key: key.to_string(),
            reason: format!("lz4: {e}"),
        })?;
    Ok(out)
}

/// BLAKE3 hex digest of a payload, recorded in run reports.
pub fn payload_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Reads objects from a directory laid out like the bucket (`{root}/{key}`).
pub struct LocalObjectFetcher {
    root: PathBuf,
}

impl LocalObjectFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectFetcher for LocalObjectFetcher {
    fn name(&self) -> &str {
        "local_mirror"
    }

    fn verify(&self) -> Result<(), FetchError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(FetchError::Unreachable(format!(
                "mirror root {} is not a directory",
                self.root.display()
            )))
        }
    }

    fn fetch(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.root.join(key);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound {
                key: key.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => FetchError::Denied {
                key: key.to_string(),
                reason: e.to_string(),
            },
            _ => FetchError::Unreadable {
                key: key.to_string(),
                reason: e.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decompresses_lz4_frames() {
        let body = b"time,coin,funding,premium\n".repeat(20);
        let out = decompress_lz4("funding/20240101.csv.lz4", &compress(&body)).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn corrupt_frame_is_unreadable() {
        let err = decompress_lz4("funding/20240101.csv.lz4", b"definitely not lz4").unwrap_err();
        assert!(matches!(err, FetchError::Unreadable { ref key, .. } if key == "funding/20240101.csv.lz4"));
    }

    #[test]
    fn local_fetcher_reads_bucket_layout() {
        let dir = tempfile::tempdir().unwrap();
        let key = "funding/20240101.csv.lz4";
        std::fs::create_dir_all(dir.path().join("funding")).unwrap();
        std::fs::write(dir.path().join(key), b"payload").unwrap();

        let fetcher = LocalObjectFetcher::new(dir.path());
        assert!(fetcher.verify().is_ok());
        assert!(LocalObjectFetcher::new(dir.path().join("missing")).verify().is_err());
        assert_eq!(fetcher.fetch(key).unwrap(), b"payload");

        let missing = fetcher.fetch("funding/20240102.csv.lz4").unwrap_err();
        assert_eq!(
            missing,
            FetchError::NotFound {
                key: "funding/20240102.csv.lz4".into()
            }
        );
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = payload_digest(b"abc");
        assert_eq!(a, payload_digest(b"abc"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, payload_digest(b"abd"));
    }
}
