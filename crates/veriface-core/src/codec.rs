//! Descriptor normalization.
//!
//! Enrolled vectors have passed through several storage generations: raw
//! little-endian float buffers, JSON-encoded arrays (sometimes nested one
//! level by an upstream double-encoding bug), and comma-delimited strings.
//! Every read path funnels through [`normalize`], which flattens whatever it
//! is handed into exactly one 128-element descriptor or refuses with a
//! specific error. 512-element vectors are the previous recognition model's
//! output and get a distinct error so callers can prompt re-enrollment
//! instead of reporting a generic corruption.

use serde_json::Value;
use thiserror::Error;

/// Dimension of a current-model face descriptor.
pub const DESCRIPTOR_DIM: usize = 128;

/// Dimension produced by the retired recognition model.
const LEGACY_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("legacy 512-dimension descriptor; re-enrollment under the 128-dimension model is required")]
    LegacyFormat,
    #[error("unexpected descriptor dimension: {0} (expected {DESCRIPTOR_DIM})")]
    UnexpectedDimension(usize),
    #[error("undecodable descriptor encoding: {0}")]
    BadEncoding(String),
}

/// A fixed-length face embedding. Immutable after construction; the only
/// ways to obtain one are [`Descriptor::new`] and [`normalize`], both of
/// which enforce the dimension invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, CodecError> {
        match values.len() {
            DESCRIPTOR_DIM => Ok(Self(values)),
            LEGACY_DIM => Err(CodecError::LegacyFormat),
            n => Err(CodecError::UnexpectedDimension(n)),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Packed little-endian representation, the on-disk blob format.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for &v in &self.0 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn l2_norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl std::ops::Deref for Descriptor {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

/// The closed set of historical descriptor encodings accepted on read.
#[derive(Debug, Clone)]
pub enum RawDescriptor {
    /// Already-typed numeric sequence.
    Values(Vec<f32>),
    /// JSON-encoded array, possibly nested (`[[...]]`) or double-encoded
    /// (`["[...]"]`).
    Json(String),
    /// Comma-delimited decimal string.
    Delimited(String),
    /// Packed little-endian 32-bit float buffer.
    Bytes(Vec<u8>),
}

impl RawDescriptor {
    /// Tag an untyped string by shape: JSON if it looks bracketed, otherwise
    /// comma-delimited.
    pub fn from_text(s: &str) -> RawDescriptor {
        let trimmed = s.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            RawDescriptor::Json(trimmed.to_string())
        } else {
            RawDescriptor::Delimited(trimmed.to_string())
        }
    }
}

/// Flatten `raw` to one dimension and validate its length.
///
/// A flattened result of exactly one element whose single element is itself
/// an encoded sequence is unwrapped one level only; deeper nesting fails.
pub fn normalize(raw: RawDescriptor) -> Result<Descriptor, CodecError> {
    let flat = decode(&raw, true)?;
    Descriptor::new(flat)
}

/// [`normalize`] for untagged text coming back from storage.
pub fn normalize_text(text: &str) -> Result<Descriptor, CodecError> {
    normalize(RawDescriptor::from_text(text))
}

fn decode(raw: &RawDescriptor, allow_unwrap: bool) -> Result<Vec<f32>, CodecError> {
    match raw {
        RawDescriptor::Values(values) => Ok(values.clone()),
        RawDescriptor::Bytes(bytes) => decode_bytes(bytes),
        RawDescriptor::Delimited(text) => decode_delimited(text),
        RawDescriptor::Json(text) => decode_json(text, allow_unwrap),
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 4 != 0 {
        return Err(CodecError::BadEncoding(format!(
            "byte buffer length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let mut values = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| CodecError::BadEncoding("truncated float chunk".to_string()))?;
        values.push(f32::from_le_bytes(arr));
    }
    Ok(values)
}

fn decode_delimited(text: &str) -> Result<Vec<f32>, CodecError> {
    let mut values = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let v = token
            .parse::<f32>()
            .map_err(|_| CodecError::BadEncoding(format!("non-numeric token {token:?}")))?;
        values.push(v);
    }
    Ok(values)
}

fn decode_json(text: &str, allow_unwrap: bool) -> Result<Vec<f32>, CodecError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| CodecError::BadEncoding(format!("invalid JSON: {e}")))?;

    // Double-encoding from an upstream bug: a one-element array whose sole
    // element is a string holding the real sequence. Unwrap one level only.
    if allow_unwrap {
        if let Value::Array(items) = &value {
            if items.len() == 1 {
                if let Value::String(inner) = &items[0] {
                    return decode(&RawDescriptor::from_text(inner), false);
                }
            }
        }
    }

    let mut values = Vec::new();
    flatten_json(&value, &mut values)?;
    Ok(values)
}

fn flatten_json(value: &Value, out: &mut Vec<f32>) -> Result<(), CodecError> {
    match value {
        Value::Number(n) => {
            let v = n
                .as_f64()
                .ok_or_else(|| CodecError::BadEncoding(format!("non-finite number {n}")))?;
            out.push(v as f32);
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                flatten_json(item, out)?;
            }
            Ok(())
        }
        other => Err(CodecError::BadEncoding(format!(
            "unexpected JSON element: {other}"
        ))),
    }
}
