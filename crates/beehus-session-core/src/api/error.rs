use serde_json::Value;
use thiserror::Error;

/// Failure talking to the Beehus API.
///
/// Error bodies are FastAPI-shaped (`{"detail": ...}`); the detail text is
/// kept for logs, the raw body only when it is not JSON.
#[derive(Error, Debug)]
pub enum ApiError {
    /// 401/403: the credential was refused (bad token, inactive account)
    #[error("Rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// 400/422: the request body did not validate
    #[error("Request not accepted: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error ({status}): {detail}")]
    Server { status: u16, detail: String },

    #[error("Unexpected status {status}: {detail}")]
    Unexpected { status: u16, detail: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Access token cannot be sent as a header value")]
    InvalidToken,
}

/// Longest detail kept in an error message
const MAX_DETAIL_LENGTH: usize = 500;

impl ApiError {
    /// A 401 with the given detail
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        ApiError::Rejected {
            status: 401,
            detail: detail.into(),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = error_detail(body);
        let status = status.as_u16();
        match status {
            401 | 403 => ApiError::Rejected { status, detail },
            400 | 422 => ApiError::Validation(detail),
            404 => ApiError::NotFound(detail),
            500..=599 => ApiError::Server { status, detail },
            _ => ApiError::Unexpected { status, detail },
        }
    }

    /// Whether the server explicitly refused the credential, as opposed to
    /// being unreachable or misbehaving. Used for logging only: both outcomes
    /// end the session.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Rejected { .. })
    }
}

/// `detail` as a string, or the `msg` of each validation entry, falling
/// back to the body itself
fn error_detail(body: &str) -> String {
    let detail = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => Some(detail.clone()),
            Some(Value::Array(entries)) => {
                let messages: Vec<&str> = entries
                    .iter()
                    .filter_map(|e| e.get("msg").and_then(Value::as_str))
                    .collect();
                (!messages.is_empty()).then(|| messages.join("; "))
            }
            _ => None,
        },
        _ => None,
    };
    truncate(detail.as_deref().unwrap_or(body))
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_DETAIL_LENGTH {
        return text.to_string();
    }
    let mut end = MAX_DETAIL_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &text[..end], text.len())
}
