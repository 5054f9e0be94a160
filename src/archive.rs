use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

use crate::error::MaterializeError;
use crate::gmail::types::MessageFormat;
use crate::gmail::MailApi;

pub const ARCHIVE_EXTENSION: &str = "eml";

/// A message written to the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedMessage {
    pub message_id: String,
    pub archive_path: PathBuf,
    pub raw_bytes: Vec<u8>,
}

/// `<ISO-8601 timestamp, ':' replaced by '-'>-<message id>.eml`
pub fn archive_file_name(at: DateTime<Utc>, message_id: &str) -> String {
    let timestamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{timestamp}-{message_id}.{ARCHIVE_EXTENSION}")
}

pub fn archive_path(dir: &Path, at: DateTime<Utc>, message_id: &str) -> PathBuf {
    dir.join(archive_file_name(at, message_id))
}

/// Decode Gmail's base64url `raw` field. Padding is tolerated.
pub fn decode_raw(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('='))
}

/// Fetch one message and write its raw RFC 822 bytes verbatim into `destination_dir`.
///
/// The file name is taken at write time, so two writes of the same id within one
/// millisecond land on the same path and the last one wins.
pub async fn materialize(
    api: &dyn MailApi,
    message_id: &str,
    mailbox_owner: &str,
    destination_dir: &Path,
) -> Result<MaterializedMessage, MaterializeError> {
    let fetch_error = |source| MaterializeError::Fetch {
        message_id: message_id.to_string(),
        source,
    };

    let details = api
        .get_message(mailbox_owner, message_id, MessageFormat::Full)
        .await
        .map_err(fetch_error)?;
    debug!(
        message_id,
        thread_id = details.thread_id.as_deref().unwrap_or_default(),
        subject = details.header("Subject").unwrap_or_default(),
        labels = ?details.label_ids,
        size = details.size_estimate,
        "fetched message details"
    );

    let raw_message = api
        .get_message(mailbox_owner, message_id, MessageFormat::Raw)
        .await
        .map_err(fetch_error)?;
    let Some(raw) = raw_message.raw.as_deref().filter(|raw| !raw.trim().is_empty()) else {
        return Err(MaterializeError::Decode {
            message_id: message_id.to_string(),
            reason: "no raw data in message response".to_string(),
        });
    };
    let raw_bytes = decode_raw(raw).map_err(|error| MaterializeError::Decode {
        message_id: message_id.to_string(),
        reason: error.to_string(),
    })?;

    let path = archive_path(destination_dir, Utc::now(), message_id);
    tokio::fs::write(&path, &raw_bytes)
        .await
        .map_err(|source| MaterializeError::Write {
            path: path.clone(),
            source,
        })?;
    info!(message_id, path = %path.display(), bytes = raw_bytes.len(), "email saved");

    Ok(MaterializedMessage {
        message_id: message_id.to_string(),
        archive_path: path,
        raw_bytes,
    })
}
