use std::path::PathBuf;

use thiserror::Error;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// Failure talking to the mail provider's HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("gmail api request failed: status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("gmail api transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode gmail api response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("gmail oauth: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: redact_response_body(body),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Status { status: 403, .. })
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid history cursor '{0}': expected a non-negative integer")]
    InvalidCursor(String),

    #[error("insufficient permissions to access gmail history; check the granted OAuth scopes")]
    InsufficientPermissions(#[source] ApiError),

    #[error(transparent)]
    Provider(#[from] ApiError),
}

impl HistoryError {
    /// Route a provider error, singling out permission problems.
    pub fn from_api(error: ApiError) -> Self {
        if error.is_permission_denied() {
            Self::InsufficientPermissions(error)
        } else {
            Self::Provider(error)
        }
    }
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("fetch message {message_id}: {source}")]
    Fetch {
        message_id: String,
        #[source]
        source: ApiError,
    },

    #[error("decode raw message {message_id}: {reason}")]
    Decode { message_id: String, reason: String },

    #[error("write archive file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
#[error("malformed push payload: {0}")]
pub struct MalformedPayload(pub String);

/// Storage failure of the notification ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}…[truncated {} bytes]",
        &trimmed[..cut],
        trimmed.len()
    )
}
