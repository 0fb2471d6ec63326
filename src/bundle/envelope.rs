//! Binary bundle envelope: canonical payload encoding and checksums

use crate::error::BundleReadFailure;
use crate::types::Bundle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

pub const FORMAT_TAG: &str = "bundle/v1";
pub const ENVELOPE_VERSION: u32 = 1;

/// Hash algorithm a checksum was computed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    Blake3,
    Sha256,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Blake3 => "blake3",
            ChecksumAlgo::Sha256 => "sha256",
        }
    }

    /// Fast hash for ordinary payloads, sha256 once the payload is large
    pub fn for_payload_len(len: usize, crypto_min_bytes: usize) -> Self {
        if len >= crypto_min_bytes {
            ChecksumAlgo::Sha256
        } else {
            ChecksumAlgo::Blake3
        }
    }

    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgo::Blake3 => blake3::hash(bytes).to_hex().to_string(),
            ChecksumAlgo::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                format!("{:x}", hasher.finalize())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub value: String,
}

impl Checksum {
    pub fn compute(bytes: &[u8], algo: ChecksumAlgo) -> Self {
        Self {
            algo,
            value: algo.digest_hex(bytes),
        }
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.algo.digest_hex(bytes) == self.value
    }
}

/// Rendered as `<algo>:<hex>`, the form stored in manifest entries
impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo.as_str(), self.value)
    }
}

/// On-disk binary envelope. `payload` is the canonical JSON of the bundle and is
/// exactly the byte string the checksum covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryEnvelope {
    pub format_tag: String,
    pub version: u32,
    pub checksum: Option<Checksum>,
    pub payload: Vec<u8>,
}

/// Normalized payload bytes plus their checksum, ready to wrap in an envelope
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub bytes: Vec<u8>,
    pub checksum: Checksum,
}

impl PreparedPayload {
    pub fn into_envelope(self) -> BinaryEnvelope {
        BinaryEnvelope {
            format_tag: FORMAT_TAG.to_string(),
            version: ENVELOPE_VERSION,
            checksum: Some(self.checksum),
            payload: self.bytes,
        }
    }
}

/// Recursively sort object keys; array order is preserved
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Normalize and checksum a bundle. CPU-only; safe to run on a blocking thread.
pub fn prepare_payload(
    bundle: &Bundle,
    crypto_min_bytes: usize,
) -> Result<PreparedPayload, serde_json::Error> {
    let canonical = canonicalize(serde_json::to_value(bundle)?);
    let bytes = serde_json::to_vec(&canonical)?;
    let algo = ChecksumAlgo::for_payload_len(bytes.len(), crypto_min_bytes);
    let checksum = Checksum::compute(&bytes, algo);
    Ok(PreparedPayload { bytes, checksum })
}

/// Decode allocation ceiling, equal to the default bundle read cap
const ENVELOPE_DECODE_LIMIT: usize = 256 * 1024 * 1024;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<ENVELOPE_DECODE_LIMIT>()
}

pub fn encode_envelope(envelope: &BinaryEnvelope) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(envelope, bincode_config()).map_err(|e| e.to_string())
}

/// Decode and validate an envelope, returning the bundle it carries and the
/// checksum stored with it
pub fn decode_envelope(
    bytes: &[u8],
    checksum_verify_max_bytes: usize,
) -> Result<(Bundle, Option<Checksum>), BundleReadFailure> {
    let (envelope, _): (BinaryEnvelope, usize) =
        bincode::serde::decode_from_slice(bytes, bincode_config())
            .map_err(|e| BundleReadFailure::InvalidEnvelope(e.to_string()))?;

    if envelope.format_tag != FORMAT_TAG {
        return Err(BundleReadFailure::InvalidEnvelope(format!(
            "unexpected format tag '{}'",
            envelope.format_tag
        )));
    }
    if envelope.version != ENVELOPE_VERSION {
        return Err(BundleReadFailure::UnsupportedVersion {
            found: envelope.version,
        });
    }
    if let Some(checksum) = &envelope.checksum
        && envelope.payload.len() < checksum_verify_max_bytes
        && !checksum.matches(&envelope.payload)
    {
        return Err(BundleReadFailure::ChecksumMismatch {
            algo: checksum.algo.as_str().to_string(),
        });
    }

    let bundle = parse_bundle(&envelope.payload)?;
    Ok((bundle, envelope.checksum))
}

/// Parse bundle JSON, requiring a `chunks` array before typed decoding
pub fn parse_bundle(bytes: &[u8]) -> Result<Bundle, BundleReadFailure> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| BundleReadFailure::Parse(e.to_string()))?;
    if !value.get("chunks").is_some_and(Value::is_array) {
        return Err(BundleReadFailure::MissingChunks);
    }
    serde_json::from_value(value).map_err(|e| BundleReadFailure::Parse(e.to_string()))
}
