use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Compression + transport encoding tag carried by every payload.
pub const ENCODING_GZIP_BASE64: &str = "gzip+base64";

// Serialized batches above this size are refused outright
const MAX_SAFE_BUFFER_SIZE: usize = 256 * 1024 * 1024; // 256MB
// Upper bound on what a payload header alone can make us preallocate
const MAX_PREALLOCATION: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during compression: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Base64 decoding failed: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("Unsupported payload encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("Payload size mismatch: header says {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Serialized payload too large: {0} bytes")]
    TooLarge(usize),
}

/// Wire form of one upload: serialized, gzip-compressed, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub compressed: bool,
    pub encoding: String,
    pub original_size: usize,
    pub compressed_size: usize,
    pub data: String,
}

impl Payload {
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed_size
    }
}

#[derive(Debug, Clone)]
pub struct PayloadCodec {
    level: Compression,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Serialize `value` to JSON and wrap it as a payload.
    ///
    /// Output is deterministic for a given value: the gzip header carries no
    /// timestamp or file name.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, CodecError> {
        let serialized = serde_json::to_vec(value)?;
        self.encode_bytes(&serialized)
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        if bytes.len() > MAX_SAFE_BUFFER_SIZE {
            return Err(CodecError::TooLarge(bytes.len()));
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4 + 64), self.level);
        encoder.write_all(bytes)?;
        let compressed = encoder.finish()?;

        Ok(Payload {
            compressed: true,
            encoding: ENCODING_GZIP_BASE64.to_string(),
            original_size: bytes.len(),
            compressed_size: compressed.len(),
            data: STANDARD.encode(&compressed),
        })
    }

    /// Reverse of [`encode_bytes`](Self::encode_bytes). The header sizes are
    /// untrusted: decompression stops one byte past `original_size`.
    pub fn decode_bytes(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        if payload.encoding != ENCODING_GZIP_BASE64 {
            return Err(CodecError::UnsupportedEncoding(payload.encoding.clone()));
        }
        if payload.original_size > MAX_SAFE_BUFFER_SIZE {
            return Err(CodecError::TooLarge(payload.original_size));
        }

        let compressed = STANDARD.decode(payload.data.as_bytes())?;
        if compressed.len() != payload.compressed_size {
            return Err(CodecError::SizeMismatch {
                expected: payload.compressed_size,
                actual: compressed.len(),
            });
        }

        let limit = payload.original_size as u64 + 1;
        let mut decompressed = Vec::with_capacity(payload.original_size.min(MAX_PREALLOCATION));
        GzDecoder::new(compressed.as_slice())
            .take(limit)
            .read_to_end(&mut decompressed)?;

        if decompressed.len() != payload.original_size {
            return Err(CodecError::SizeMismatch {
                expected: payload.original_size,
                actual: decompressed.len(),
            });
        }

        Ok(decompressed)
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError> {
        let bytes = self.decode_bytes(payload)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}
