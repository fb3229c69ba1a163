//! Remote payload codec: base64 transport encoding around UTF-8 GeoJSON text.
//!
//! The same functions are used on load and on commit so that whatever was
//! read can be written back byte-for-byte equivalent.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use geojson::{FeatureCollection, GeoJson};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only payload encoding the contents API is expected to return for files.
pub const BASE64_ENCODING: &str = "base64";

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(String),

    #[error("invalid GeoJSON: {0}")]
    Json(String),

    #[error("expected a FeatureCollection, found {found}")]
    NotAFeatureCollection { found: String },

    #[error("unsupported payload encoding '{0}'")]
    UnsupportedEncoding(String),
}

#[must_use]
pub fn encode_content(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decodes a base64 payload into text. Embedded line breaks are ignored.
pub fn decode_content(encoded: &str) -> Result<String, DecodeError> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    String::from_utf8(bytes).map_err(|e| DecodeError::Utf8(e.utf8_error().to_string()))
}

/// Decodes a payload as returned by the contents API, checking its declared encoding.
pub fn decode_payload(encoding: &str, content: &str) -> Result<String, DecodeError> {
    if encoding != BASE64_ENCODING {
        return Err(DecodeError::UnsupportedEncoding(encoding.to_string()));
    }
    decode_content(content)
}

pub fn parse_collection(text: &str) -> Result<FeatureCollection, DecodeError> {
    let parsed = text
        .parse::<GeoJson>()
        .map_err(|e| DecodeError::Json(e.to_string()))?;

    match parsed {
        GeoJson::FeatureCollection(collection) => Ok(collection),
        GeoJson::Feature(_) => Err(DecodeError::NotAFeatureCollection {
            found: "Feature".into(),
        }),
        GeoJson::Geometry(_) => Err(DecodeError::NotAFeatureCollection {
            found: "Geometry".into(),
        }),
    }
}

/// Pretty-printed with two-space indentation, keys in their stored order.
pub fn render_collection(collection: &FeatureCollection) -> Result<String, DecodeError> {
    serde_json::to_string_pretty(collection).map_err(|e| DecodeError::Json(e.to_string()))
}

/// Full pipeline for a commit body.
pub fn encode_collection(collection: &FeatureCollection) -> Result<String, DecodeError> {
    render_collection(collection).map(|text| encode_content(&text))
}
