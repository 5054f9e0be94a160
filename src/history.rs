use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::error::HistoryError;
use crate::gmail::types::{HistoryRecord, HistoryType, MessageFormat};
use crate::gmail::{MailApi, INBOX_LABEL};

const HISTORY_TYPES: &[HistoryType] = &[HistoryType::MessageAdded, HistoryType::LabelAdded];

/// Position in a mailbox's change stream (Gmail `historyId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeCursor(u64);

impl ChangeCursor {
    pub const MIN: ChangeCursor = ChangeCursor(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// One step back, never below [`ChangeCursor::MIN`].
    pub fn preceding(self) -> Self {
        Self(self.0.saturating_sub(1)).max(Self::MIN)
    }
}

impl FromStr for ChangeCursor {
    type Err = HistoryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| HistoryError::InvalidCursor(raw.to_string()))
    }
}

impl Display for ChangeCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mailbox change, normalized from the provider's several history shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    MessageAdded {
        message_id: String,
    },
    LabelAdded {
        message_id: String,
        label_ids: BTreeSet<String>,
    },
}

impl ChangeEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::MessageAdded { message_id } | Self::LabelAdded { message_id, .. } => message_id,
        }
    }

    /// Whether this event denotes a message arriving in the inbox.
    pub fn is_inbox_arrival(&self) -> bool {
        match self {
            Self::MessageAdded { .. } => true,
            Self::LabelAdded { label_ids, .. } => label_ids.contains(INBOX_LABEL),
        }
    }
}

/// Flatten raw history records into [`ChangeEvent`]s. Entries without a message id are dropped.
pub fn normalize_records(records: &[HistoryRecord]) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for record in records {
        for message in record.messages.as_deref().unwrap_or_default() {
            if let Some(id) = message.id.as_deref() {
                events.push(ChangeEvent::MessageAdded {
                    message_id: id.to_string(),
                });
            }
        }

        for added in record.messages_added.as_deref().unwrap_or_default() {
            if let Some(id) = added.message.as_ref().and_then(|m| m.id.as_deref()) {
                events.push(ChangeEvent::MessageAdded {
                    message_id: id.to_string(),
                });
            }
        }

        for labelled in record.labels_added.as_deref().unwrap_or_default() {
            if let Some(id) = labelled.message.as_ref().and_then(|m| m.id.as_deref()) {
                events.push(ChangeEvent::LabelAdded {
                    message_id: id.to_string(),
                    label_ids: labelled
                        .label_ids
                        .iter()
                        .flatten()
                        .cloned()
                        .collect(),
                });
            }
        }
    }

    events
}

/// Retrieve the change events recorded since `cursor`.
///
/// History is queried from one step before the cursor so an event sitting exactly on the
/// boundary is not missed. When the provider reports no history at all (typically because the
/// cursor fell out of the retention window), the cursor value is tried as a message id and a
/// hit is reported as a single `MessageAdded` event. Provider errors are not retried.
pub async fn fetch_changes(
    api: &dyn MailApi,
    cursor: &str,
    mailbox_owner: &str,
) -> Result<Vec<ChangeEvent>, HistoryError> {
    let cursor: ChangeCursor = cursor.parse()?;

    let profile = api
        .get_profile(mailbox_owner)
        .await
        .map_err(HistoryError::from_api)?;
    info!(
        mailbox = mailbox_owner,
        cursor = cursor.value(),
        current_history_id = %profile.history_id,
        "fetching gmail history"
    );

    let start = cursor.preceding();
    let mut events = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = api
            .list_history(
                mailbox_owner,
                start.value(),
                HISTORY_TYPES,
                page_token.as_deref(),
            )
            .await
            .map_err(HistoryError::from_api)?;

        events.extend(normalize_records(page.history.as_deref().unwrap_or_default()));

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }
    debug!(
        start_history_id = start.value(),
        events = events.len(),
        "gmail history listed"
    );

    if events.is_empty() {
        events.extend(fetch_cursor_as_message(api, cursor, mailbox_owner).await);
    }

    Ok(events)
}

async fn fetch_cursor_as_message(
    api: &dyn MailApi,
    cursor: ChangeCursor,
    mailbox_owner: &str,
) -> Option<ChangeEvent> {
    info!(
        cursor = cursor.value(),
        "no history items found, trying cursor as message id"
    );
    match api
        .get_message(mailbox_owner, &cursor.to_string(), MessageFormat::Full)
        .await
    {
        Ok(message) => Some(ChangeEvent::MessageAdded {
            message_id: message.id,
        }),
        Err(error) => {
            warn!(cursor = cursor.value(), %error, "direct message fetch by cursor failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{fetch_changes, normalize_records, ChangeCursor, ChangeEvent};
    use crate::error::HistoryError;
    use crate::gmail::fake::FakeMailApi;
    use crate::gmail::types::HistoryList;

    #[test]
    fn cursor_parses_non_negative_integers_only() {
        assert_eq!("42".parse::<ChangeCursor>().unwrap().value(), 42);
        assert_eq!(" 7 ".parse::<ChangeCursor>().unwrap().value(), 7);
        assert!(matches!(
            "-3".parse::<ChangeCursor>(),
            Err(HistoryError::InvalidCursor(_))
        ));
        assert!(matches!(
            "abc".parse::<ChangeCursor>(),
            Err(HistoryError::InvalidCursor(_))
        ));
    }

    #[test]
    fn preceding_cursor_is_clamped() {
        assert_eq!(ChangeCursor::new(100).preceding().value(), 99);
        assert_eq!(ChangeCursor::new(1).preceding(), ChangeCursor::MIN);
        assert_eq!(ChangeCursor::new(0).preceding(), ChangeCursor::MIN);
    }

    #[test]
    fn all_history_shapes_normalize() {
        let list: HistoryList = serde_json::from_value(json!({
            "history": [{
                "id": "5",
                "messages": [{ "id": "direct" }, { "threadId": "no-id" }],
                "messagesAdded": [{ "message": { "id": "added" } }],
                "labelsAdded": [
                    { "message": { "id": "starred" }, "labelIds": ["STARRED"] },
                    { "message": { "id": "inboxed" }, "labelIds": ["INBOX", "UNREAD"] }
                ]
            }]
        }))
        .unwrap();

        let events = normalize_records(list.history.as_deref().unwrap());
        let ids: Vec<&str> = events.iter().map(ChangeEvent::message_id).collect();
        assert_eq!(ids, vec!["direct", "added", "starred", "inboxed"]);
        assert!(events[0].is_inbox_arrival());
        assert!(events[1].is_inbox_arrival());
        assert!(!events[2].is_inbox_arrival());
        assert!(events[3].is_inbox_arrival());
    }

    #[tokio::test]
    async fn history_is_queried_one_before_cursor() {
        let api = FakeMailApi::default()
            .with_history(json!({ "history": [{ "messagesAdded": [{ "message": { "id": "m1" } }] }] }));

        let events = fetch_changes(&api, "500", "me").await.expect("fetch changes");
        assert_eq!(events.len(), 1);
        assert!(api.calls().contains(&"history:499".to_string()));
    }

    #[tokio::test]
    async fn history_pages_are_concatenated() {
        let api = FakeMailApi::default()
            .with_history(json!({ "history": [{ "messagesAdded": [{ "message": { "id": "m1" } }] }] }))
            .with_history(json!({ "history": [{ "messagesAdded": [{ "message": { "id": "m2" } }] }] }));

        let events = fetch_changes(&api, "10", "me").await.expect("fetch changes");
        let ids: Vec<&str> = events.iter().map(ChangeEvent::message_id).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn empty_history_falls_back_to_cursor_as_message_id() {
        let api = FakeMailApi::default().with_message("777", "Subject: hi\r\n\r\nbody");

        let events = fetch_changes(&api, "777", "me").await.expect("fetch changes");
        assert_eq!(
            events,
            vec![ChangeEvent::MessageAdded {
                message_id: "777".to_string()
            }]
        );
        assert!(api.calls().contains(&"get:full:777".to_string()));
    }

    #[tokio::test]
    async fn failed_fallback_yields_no_events() {
        let api = FakeMailApi::default();
        let events = fetch_changes(&api, "777", "me").await.expect("fetch changes");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn invalid_cursor_is_rejected_before_any_call() {
        let api = FakeMailApi::default();
        let error = fetch_changes(&api, "not-a-number", "me")
            .await
            .expect_err("invalid cursor");
        assert!(matches!(error, HistoryError::InvalidCursor(_)));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn forbidden_history_is_insufficient_permissions() {
        let api = FakeMailApi {
            history_status: Some(403),
            ..FakeMailApi::default()
        };
        let error = fetch_changes(&api, "10", "me").await.expect_err("forbidden");
        assert!(matches!(error, HistoryError::InsufficientPermissions(_)));
    }

    #[tokio::test]
    async fn other_provider_errors_propagate_without_retry() {
        let api = FakeMailApi {
            history_status: Some(500),
            ..FakeMailApi::default()
        };
        let error = fetch_changes(&api, "10", "me").await.expect_err("server error");
        assert!(matches!(error, HistoryError::Provider(_)));
        let history_calls = api
            .calls()
            .iter()
            .filter(|call| call.starts_with("history:"))
            .count();
        assert_eq!(history_calls, 1);
    }
}
