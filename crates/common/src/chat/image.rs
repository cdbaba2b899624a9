//! Inbound image payloads

use crate::errors::{AppError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};

const DATA_URL_MARKER: &str = "base64,";

/// Decode a base64 image from a chat request.
///
/// Accepts bare base64 or a data URL (`data:image/png;base64,<data>`).
/// A blank payload means "no image".
pub fn decode_image_payload(payload: &str, max_bytes: usize) -> Result<Option<Vec<u8>>> {
    let data = match payload.find(DATA_URL_MARKER) {
        Some(pos) => &payload[pos + DATA_URL_MARKER.len()..],
        None => payload,
    };
    let data = data.trim();

    if data.is_empty() {
        return Ok(None);
    }

    // Decoded size is roughly 3/4 of the encoded length
    let estimated = data.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(3) {
        return Err(AppError::PayloadTooLarge {
            size: estimated,
            limit: max_bytes,
        });
    }

    let bytes = STANDARD.decode(data).map_err(|e| AppError::InvalidFormat {
        message: format!("image is not valid base64: {}", e),
    })?;

    if bytes.len() > max_bytes {
        return Err(AppError::PayloadTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    Ok(if bytes.is_empty() { None } else { Some(bytes) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    #[test]
    fn test_bare_base64() {
        let decoded = decode_image_payload("aGVsbG8=", LIMIT).unwrap();
        assert_eq!(decoded.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_data_url_prefix_is_stripped() {
        let decoded = decode_image_payload("data:image/jpeg;base64,aGVsbG8=", LIMIT).unwrap();
        assert_eq!(decoded.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_blank_payload_is_no_image() {
        assert_eq!(decode_image_payload("", LIMIT).unwrap(), None);
        assert_eq!(decode_image_payload("   ", LIMIT).unwrap(), None);
        assert_eq!(decode_image_payload("data:image/png;base64,", LIMIT).unwrap(), None);
    }

    #[test]
    fn test_invalid_base64() {
        let err = decode_image_payload("not base64!!", LIMIT).unwrap_err();
        assert!(matches!(err, AppError::InvalidFormat { .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_oversized_image() {
        let payload = STANDARD.encode(vec![0u8; 64]);
        let err = decode_image_payload(&payload, 16).unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { limit: 16, .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);

        // Exactly at the limit is fine
        let payload = STANDARD.encode(vec![0u8; 16]);
        assert_eq!(decode_image_payload(&payload, 16).unwrap().map(|b| b.len()), Some(16));
    }
}
