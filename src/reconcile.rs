use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive;
use crate::error::{HistoryError, MalformedPayload};
use crate::gmail::MailApi;
use crate::history::{self, ChangeEvent};
use crate::ledger::{Ledger, Notification};

/// The fields of a Pub/Sub push `message` the pipeline reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushMessage {
    /// base64 of the provider's JSON notification.
    pub data: Option<String>,
    pub message_id: Option<String>,
}

impl PushMessage {
    /// Read a push `message` object. Pub/Sub sends the id as both `messageId` and
    /// `message_id`; the camel-case spelling wins. Unknown keys are ignored.
    pub fn from_value(message: &Value) -> Result<Self, MalformedPayload> {
        let Value::Object(fields) = message else {
            return Err(MalformedPayload(format!(
                "push message is not an object: {message}"
            )));
        };

        let data = match fields.get("data") {
            None | Some(Value::Null) => None,
            Some(Value::String(data)) => Some(data.clone()),
            Some(other) => {
                return Err(MalformedPayload(format!(
                    "push message data is not a string: {other}"
                )))
            }
        };

        Ok(Self {
            data,
            message_id: envelope_message_id(message),
        })
    }
}

/// The delivery id of a push message, accepting either spelling and numeric ids.
fn envelope_message_id(message: &Value) -> Option<String> {
    ["messageId", "message_id"]
        .iter()
        .filter_map(|key| match message.get(key)? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
        .next()
}

/// A decoded notification that names a mailbox and a history cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxChange {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub message_ids: Vec<String>,
    pub archived: Vec<PathBuf>,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AbortReason {
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    #[error("history fetch failed: {0}")]
    History(#[from] HistoryError),
}

/// Terminal state of one notification. Every variant counts as handled for
/// acknowledgement purposes.
#[derive(Debug)]
pub enum ProcessingOutcome {
    Processed(ReconcileReport),
    Ignored,
    Aborted(AbortReason),
}

/// Decode the base64 `data` of a push message into JSON. Absent data decodes to `{}`.
pub fn decode_push_data(data: Option<&str>) -> Result<Value, MalformedPayload> {
    let Some(data) = data.map(str::trim).filter(|data| !data.is_empty()) else {
        return Ok(json!({}));
    };

    let bytes = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .map_err(|error| MalformedPayload(format!("base64 decode: {error}")))?;
    serde_json::from_slice(&bytes).map_err(|error| MalformedPayload(format!("json decode: {error}")))
}

/// `{emailAddress, historyId}` payloads denote a mailbox change; anything else does not.
pub fn mailbox_change(payload: &Value) -> Option<MailboxChange> {
    let email_address = payload
        .get("emailAddress")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;

    let history_id = match payload.get("historyId")? {
        Value::String(value) if !value.trim().is_empty() => value.trim().to_string(),
        Value::Number(value) => value.to_string(),
        _ => return None,
    };

    Some(MailboxChange {
        email_address: email_address.to_string(),
        history_id,
    })
}

/// Distinct ids of messages that arrived in the inbox, in first-seen order.
pub fn inbox_message_ids(events: &[ChangeEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter(|event| event.is_inbox_arrival())
        .map(ChangeEvent::message_id)
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Turns push notifications into archived messages.
///
/// History and message calls use the `emailAddress` named in each notification as the
/// Gmail user id. The configured mailbox owner is not consulted here.
pub struct Reconciler {
    api: Arc<dyn MailApi>,
    ledger: Ledger,
    archive_dir: PathBuf,
}

impl Reconciler {
    pub fn new(api: Arc<dyn MailApi>, ledger: Ledger, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            ledger,
            archive_dir: archive_dir.into(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Handle a raw push request body. Never fails; the outcome says what happened.
    ///
    /// A body that cannot be read as a push message is still ledgered, under
    /// `undecodedBody` or `undecodedMessage`, before the notification is aborted.
    pub async fn receive_body(&self, body: &[u8]) -> ProcessingOutcome {
        let envelope: Value = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, bytes = body.len(), "push body is not JSON");
                let payload = json!({ "undecodedBody": String::from_utf8_lossy(body) });
                self.record(&Notification::new(None, payload)).await;
                return ProcessingOutcome::Aborted(
                    MalformedPayload(format!("push envelope: {error}")).into(),
                );
            }
        };

        let message = match envelope.get("message") {
            None | Some(Value::Null) => {
                warn!("push body has no message field");
                return ProcessingOutcome::Ignored;
            }
            Some(message) => message,
        };

        match PushMessage::from_value(message) {
            Ok(message) => self.receive(&message).await,
            Err(malformed) => {
                let notification = Notification::new(
                    envelope_message_id(message),
                    json!({ "undecodedMessage": message }),
                );
                self.record(&notification).await;
                error!(id = %notification.id, error = %malformed, "dropping unreadable push message");
                ProcessingOutcome::Aborted(malformed.into())
            }
        }
    }

    /// Ledger the notification, then reconcile it. A ledger failure is logged and does not
    /// stop processing.
    pub async fn receive(&self, message: &PushMessage) -> ProcessingOutcome {
        let decoded = decode_push_data(message.data.as_deref());
        let recorded_payload = match &decoded {
            Ok(payload) => payload.clone(),
            Err(_) => json!({ "undecodedData": message.data }),
        };

        let notification = Notification::new(message.message_id.clone(), recorded_payload);
        self.record(&notification).await;

        match decoded {
            Ok(payload) => self.reconcile(&payload).await,
            Err(malformed) => {
                error!(id = %notification.id, error = %malformed, "dropping undecodable notification");
                ProcessingOutcome::Aborted(malformed.into())
            }
        }
    }

    async fn record(&self, notification: &Notification) {
        if let Err(error) = self.ledger.append(notification).await {
            error!(id = %notification.id, %error, "failed to append notification to ledger");
        }
    }

    /// Fetch the changes a decoded notification points at and archive each new inbox message.
    ///
    /// Messages are processed one at a time; a failing message is logged and skipped.
    pub async fn reconcile(&self, payload: &Value) -> ProcessingOutcome {
        let Some(change) = mailbox_change(payload) else {
            info!("not a mailbox change notification, ignoring");
            return ProcessingOutcome::Ignored;
        };
        info!(
            mailbox = %change.email_address,
            history_id = %change.history_id,
            "processing mailbox change"
        );

        let events = match history::fetch_changes(
            self.api.as_ref(),
            &change.history_id,
            &change.email_address,
        )
        .await
        {
            Ok(events) => events,
            Err(error) => {
                error!(history_id = %change.history_id, %error, "failed to get email history");
                return ProcessingOutcome::Aborted(error.into());
            }
        };

        let message_ids = inbox_message_ids(&events);
        if message_ids.is_empty() {
            info!(events = events.len(), "no new inbox messages");
        }

        let mut report = ReconcileReport {
            message_ids: message_ids.clone(),
            ..ReconcileReport::default()
        };
        for message_id in &message_ids {
            match archive::materialize(
                self.api.as_ref(),
                message_id,
                &change.email_address,
                &self.archive_dir,
            )
            .await
            {
                Ok(saved) => report.archived.push(saved.archive_path),
                Err(error) => {
                    error!(message_id = %message_id, %error, "failed to archive message");
                    report.errors.push(format!("{message_id}: {error}"));
                }
            }
        }

        info!(
            archived = report.archived.len(),
            failed = report.errors.len(),
            "mailbox change processed"
        );
        ProcessingOutcome::Processed(report)
    }
}
