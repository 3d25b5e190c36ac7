use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{utils::DigestAlgorithm, PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The body of an initdata document: guest component configuration measured into the pod VM's
/// attestation evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDataBody {
    /// The hash algorithm the digest is computed with.
    pub algorithm: String,

    /// The document format version.
    pub version: String,

    /// The configuration files, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

/// A decoded initdata document and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    /// The parsed document.
    pub body: InitDataBody,

    /// The hex digest of the raw TOML document.
    pub digest: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Compresses a raw initdata document and base64-encodes it for transport.
pub fn encode(document: &str) -> PeerpodResult<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(document.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Reverses [`encode`], returning the raw document.
pub fn decode(encoded: &str) -> PeerpodResult<Vec<u8>> {
    let compressed = STANDARD.decode(encoded.trim())?;
    let mut document = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut document)
        .map_err(|e| PeerpodError::InvalidInput(format!("initdata is not gzip compressed: {e}")))?;
    Ok(document)
}

/// Decodes an encoded initdata document, parses it and digests it with its own algorithm.
pub fn parse(encoded: &str) -> PeerpodResult<InitData> {
    let document = decode(encoded)?;
    let text = std::str::from_utf8(&document)
        .map_err(|e| PeerpodError::InvalidInput(format!("initdata is not UTF-8: {e}")))?;
    let body: InitDataBody = toml::from_str(text)?;
    let algorithm: DigestAlgorithm = body.algorithm.parse()?;

    Ok(InitData {
        digest: algorithm.hex_digest(&document),
        body,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
