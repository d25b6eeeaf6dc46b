//! Transport codec: snapshot <-> payload bytes <-> chunks.
//!
//! A payload is an 8-byte header followed by the snapshot body:
//!
//! | bytes | field |
//! |---|---|
//! | 0..4 | magic `0x5354_4C46`, big endian |
//! | 4..6 | format version, big endian |
//! | 6 | body encoding (0 = JSON, 1 = bitcode) |
//! | 7 | flags (bit 0 = deflate-compressed) |
//!
//! Payloads are split into bounded chunks because the control channel caps
//! the size of a single message. Chunk bytes travel as base64 text.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};

use crate::model::{PlatformSnapshot, SCHEMA_VERSION};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a platform payload ("STLF").
pub const PAYLOAD_MAGIC: u32 = 0x5354_4C46;

/// Current payload format version. Increment when breaking the layout.
pub const FORMAT_VERSION: u16 = 1;

pub const HEADER_LEN: usize = 8;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Json,
    Bitcode,
}

impl BodyEncoding {
    fn tag(self) -> u8 {
        match self {
            BodyEncoding::Json => 0,
            BodyEncoding::Bitcode => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BodyEncoding::Json),
            1 => Some(BodyEncoding::Bitcode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum payload bytes per chunk.
    pub chunk_size: usize,
    /// Ticks without a new chunk before a reassembly session expires.
    pub chunk_timeout_ticks: u64,
    pub compress: bool,
    pub encoding: BodyEncoding,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100_000,
            chunk_timeout_ticks: 3600,
            compress: true,
            encoding: BodyEncoding::Json,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("chunk set is empty")]
    NoChunks,
    #[error("chunk {index} claims total {found}, expected {expected}")]
    InconsistentTotal { index: u32, expected: u32, found: u32 },
    #[error("missing chunk {0}")]
    MissingChunk(u32),
    #[error("duplicate chunk {0}")]
    DuplicateChunk(u32),
    #[error("chunk set claims {expected} chunks but holds {found}")]
    WrongChunkCount { expected: u32, found: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too short for header")]
    TooShort,
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", PAYLOAD_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u16),
    #[error("payload from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u16),
    #[error("unknown body encoding tag {0}")]
    UnknownEncoding(u8),
    #[error("decompression failed: {0}")]
    Decompression(#[from] std::io::Error),
    #[error("body decoding failed: {0}")]
    Body(String),
    #[error("snapshot schema {found} does not match supported schema {SCHEMA_VERSION}")]
    SchemaMismatch { found: u32 },
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub magic: u32,
    pub version: u16,
    pub encoding: u8,
    pub flags: u8,
}

impl PayloadHeader {
    pub fn new(encoding: BodyEncoding, compressed: bool) -> Self {
        Self {
            magic: PAYLOAD_MAGIC,
            version: FORMAT_VERSION,
            encoding: encoding.tag(),
            flags: if compressed { FLAG_COMPRESSED } else { 0 },
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6] = self.encoding;
        out[7] = self.flags;
        out
    }

    pub fn read(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort);
        }
        Ok(Self {
            magic: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            version: u16::from_be_bytes([data[4], data[5]]),
            encoding: data[6],
            flags: data[7],
        })
    }

    pub fn validate(&self) -> Result<BodyEncoding, DecodeError> {
        if self.magic != PAYLOAD_MAGIC {
            return Err(DecodeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DecodeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        BodyEncoding::from_tag(self.encoding).ok_or(DecodeError::UnknownEncoding(self.encoding))
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

pub fn encode(
    snapshot: &PlatformSnapshot,
    config: &TransportConfig,
) -> Result<Vec<u8>, CodecError> {
    let body = match config.encoding {
        BodyEncoding::Json => {
            serde_json::to_vec(snapshot).map_err(|e| CodecError::Encode(e.to_string()))?
        }
        BodyEncoding::Bitcode => {
            bitcode::serialize(snapshot).map_err(|e| CodecError::Encode(e.to_string()))?
        }
    };
    let mut out = PayloadHeader::new(config.encoding, config.compress).to_bytes().to_vec();
    if config.compress {
        let mut encoder = DeflateEncoder::new(out, Compression::default());
        encoder.write_all(&body)?;
        out = encoder.finish()?;
    } else {
        out.extend_from_slice(&body);
    }
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<PlatformSnapshot, DecodeError> {
    let header = PayloadHeader::read(data)?;
    let encoding = header.validate()?;
    let raw = &data[HEADER_LEN..];

    let inflated;
    let body: &[u8] = if header.compressed() {
        let mut buf = Vec::new();
        DeflateDecoder::new(raw).read_to_end(&mut buf)?;
        inflated = buf;
        &inflated
    } else {
        raw
    };

    let snapshot: PlatformSnapshot = match encoding {
        BodyEncoding::Json => {
            serde_json::from_slice(body).map_err(|e| DecodeError::Body(e.to_string()))?
        }
        BodyEncoding::Bitcode => {
            bitcode::deserialize(body).map_err(|e| DecodeError::Body(e.to_string()))?
        }
    };
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(DecodeError::SchemaMismatch {
            found: snapshot.schema_version,
        });
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// One bounded slice of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub total: u32,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Split `bytes` into chunks of at most `size` bytes. An empty payload
/// still yields one (empty) chunk so the receiver sees a complete set.
pub fn chunk(bytes: &[u8], size: usize) -> Vec<Chunk> {
    let size = size.max(1);
    if bytes.is_empty() {
        return vec![Chunk {
            index: 0,
            total: 1,
            payload: Vec::new(),
        }];
    }
    let total = bytes.len().div_ceil(size) as u32;
    bytes
        .chunks(size)
        .enumerate()
        .map(|(i, part)| Chunk {
            index: i as u32,
            total,
            payload: part.to_vec(),
        })
        .collect()
}

/// Join a complete chunk set, in any arrival order.
pub fn reassemble(chunks: &[Chunk]) -> Result<Vec<u8>, CodecError> {
    let first = chunks.first().ok_or(CodecError::NoChunks)?;
    let total = first.total;
    // `total` comes from the peer; never allocate more than was received.
    if total as usize != chunks.len() {
        return Err(CodecError::WrongChunkCount {
            expected: total,
            found: chunks.len(),
        });
    }
    let mut slots: Vec<Option<&Chunk>> = vec![None; total as usize];
    for c in chunks {
        if c.total != total {
            return Err(CodecError::InconsistentTotal {
                index: c.index,
                expected: total,
                found: c.total,
            });
        }
        let slot = slots
            .get_mut(c.index as usize)
            .ok_or(CodecError::MissingChunk(c.index))?;
        if slot.is_some() {
            return Err(CodecError::DuplicateChunk(c.index));
        }
        *slot = Some(c);
    }
    let mut out = Vec::new();
    for (i, slot) in slots.into_iter().enumerate() {
        let c = slot.ok_or(CodecError::MissingChunk(i as u32))?;
        out.extend_from_slice(&c.payload);
    }
    Ok(out)
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
