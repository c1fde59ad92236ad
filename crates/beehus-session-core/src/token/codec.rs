use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Extract the absolute expiry instant from a JWT-shaped token.
///
/// Returns `None` for a token without an `exp` claim as well as for one that
/// cannot be decoded at all. Both cases mean "do not schedule a renewal":
/// a malformed token is not an error here, the server will reject it on the
/// next request instead.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let segment = token.split('.').nth(1)?;
    let bytes = match decode_segment(segment) {
        Some(bytes) => bytes,
        None => {
            debug!("Token payload is not valid base64");
            return None;
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "Token payload is not valid JSON");
            return None;
        }
    };

    let exp = payload.get("exp")?.as_f64()?;
    // A zero claim is falsy on the issuing side; treat it as absent.
    if !exp.is_finite() || exp <= 0.0 {
        return None;
    }

    DateTime::<Utc>::from_timestamp_millis((exp * 1000.0) as i64)
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .ok()
}
