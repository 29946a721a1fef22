//! Turns raw message payloads into [`DecodedRecord`]s.
//!
//! Producers frame the JSON record as a structured-data string: a `0x1F` type marker, a
//! big-endian length field, the document, and a trailing null terminator. Surrounding whitespace
//! and null bytes are noise; the marker is mandatory.
use serde::{Deserialize, Serialize};

const MARKER: u8 = 0x1F;
/// Width of the length field following the marker.
const MAX_FRAMING_BYTES: usize = 4;

/// A shipment tracking event, as extracted from a message payload.
///
/// Every field is required and string-typed: no defaults are made up for missing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRecord {
    #[serde(rename = "Shipno")]
    pub shipno: String,
    #[serde(rename = "Text")]
    pub text: String,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Status")]
    pub status: String,
    // The producers spell it this way.
    #[serde(rename = "Lattitude")]
    pub latitude: String,
    #[serde(rename = "Longitude")]
    pub longitude: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("the payload is empty once whitespace and null bytes are removed")]
    Empty,
    #[error("the payload does not start with the 0x1f framing marker")]
    MissingMarker,
    #[error("the payload is not a valid tracking record: {0}")]
    InvalidStructure(#[from] serde_json::Error),
}

/// Decode a raw payload into a [`DecodedRecord`].
///
/// Never panics: any malformed input is reported as a [`DecodeError`].
pub fn decode(raw: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let without_nulls: Vec<u8> = raw.iter().copied().filter(|byte| *byte != 0).collect();
    // Nulls may sit between whitespace and the marker.
    let cleaned = without_nulls.trim_ascii();
    if cleaned.is_empty() {
        return Err(DecodeError::Empty);
    }
    let framed = cleaned
        .strip_prefix(&[MARKER])
        .ok_or(DecodeError::MissingMarker)?;
    let document = strip_framing(framed);
    Ok(serde_json::from_slice(document)?)
}

/// Skip what is left of the length field once its zero bytes are gone.
///
/// A length byte can happen to be `{`: a document starting with `{{` still has one framing byte
/// in front of it.
fn strip_framing(mut framed: &[u8]) -> &[u8] {
    for _ in 0..MAX_FRAMING_BYTES {
        match framed {
            [b'{', b'{', ..] => return &framed[1..],
            [b'{', ..] | [] => return framed,
            [_, rest @ ..] => framed = rest,
        }
    }
    framed
}
