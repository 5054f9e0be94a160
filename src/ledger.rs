use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;

/// One received push notification, recorded before any processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

impl Notification {
    pub fn new(id: Option<String>, payload: Value) -> Self {
        let received_at = Utc::now();
        let id = id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("msg-{}", received_at.timestamp_millis()));
        Self {
            id,
            received_at,
            payload,
        }
    }
}

/// Append-only JSON array of notifications, rewritten in full on each append.
///
/// Appends are serialized within the process. Writers in other processes are not
/// coordinated with.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the parent directory and an empty ledger when none exists.
    pub async fn ensure_exists(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io_error(source))?
        {
            self.write_records(&[]).await?;
        }
        Ok(())
    }

    pub async fn append(&self, notification: &Notification) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;

        let mut records = match self.read_raw().await? {
            None => Vec::new(),
            Some(raw) => parse_records(&raw).unwrap_or_else(|| {
                warn!(
                    path = %self.path.display(),
                    "notification ledger is corrupted, starting a fresh ledger"
                );
                Vec::new()
            }),
        };

        records.push(serde_json::to_value(notification)?);
        self.write_records(&records).await?;
        info!(id = %notification.id, path = %self.path.display(), "notification appended");
        Ok(())
    }

    /// Every record in the ledger; an absent file reads as empty.
    pub async fn load(&self) -> Result<Vec<Value>, LedgerError> {
        match self.read_raw().await? {
            None => Ok(Vec::new()),
            Some(raw) => Ok(serde_json::from_str(&raw)?),
        }
    }

    async fn read_raw(&self) -> Result<Option<String>, LedgerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io_error(source)),
        }
    }

    async fn write_records(&self, records: &[Value]) -> Result<(), LedgerError> {
        let body = serde_json::to_string_pretty(records)?;
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().as_simple()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| self.io_error(source))?;
        if let Err(source) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_error(source));
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn parse_records(raw: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::Array(records) => Some(records),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use uuid::Uuid;

    use super::{Ledger, Notification};

    fn temp_ledger_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mailhook-ledger-test-{}", Uuid::new_v4()))
            .join("notifications.json")
    }

    #[test]
    fn notification_id_falls_back_to_timestamp() {
        let generated = Notification::new(None, json!({}));
        assert!(generated.id.starts_with("msg-"));
        assert_eq!(
            generated.id,
            format!("msg-{}", generated.received_at.timestamp_millis())
        );

        let provided = Notification::new(Some("pubsub-1".to_string()), json!({}));
        assert_eq!(provided.id, "pubsub-1");

        let blank = Notification::new(Some("  ".to_string()), json!({}));
        assert!(blank.id.starts_with("msg-"));
    }

    #[tokio::test]
    async fn append_creates_missing_file_and_accumulates() {
        let path = temp_ledger_path();
        let ledger = Ledger::new(&path);
        ledger.ensure_exists().await.expect("ensure ledger");
        assert!(ledger.load().await.expect("load").is_empty());

        ledger
            .append(&Notification::new(Some("a".to_string()), json!({"historyId": "1"})))
            .await
            .expect("append a");
        ledger
            .append(&Notification::new(Some("b".to_string()), json!({"historyId": "2"})))
            .await
            .expect("append b");

        let records = ledger.load().await.expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], "a");
        assert_eq!(records[1]["payload"]["historyId"], "2");
        assert!(records[1]["receivedAt"].is_string());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupted_ledger_is_reset_on_append() {
        let path = temp_ledger_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ this is not json").unwrap();

        let ledger = Ledger::new(&path);
        ledger
            .append(&Notification::new(Some("fresh".to_string()), json!({})))
            .await
            .expect("append after corruption");

        let records = ledger.load().await.expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], "fresh");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn non_array_ledger_is_reset_on_append() {
        let path = temp_ledger_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"id":"not-a-list"}"#).unwrap();

        let ledger = Ledger::new(&path);
        ledger
            .append(&Notification::new(Some("fresh".to_string()), json!({})))
            .await
            .expect("append");
        assert_eq!(ledger.load().await.expect("load").len(), 1);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let path = temp_ledger_path();
        let ledger = Ledger::new(&path);
        ledger.ensure_exists().await.expect("ensure ledger");

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(&Notification::new(Some(format!("n{i}")), json!({})))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }

        assert_eq!(ledger.load().await.expect("load").len(), 8);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn unreadable_location_is_storage_error() {
        let dir = std::env::temp_dir().join(format!("mailhook-ledger-dir-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        // A directory where the file should be cannot be read as a ledger.
        let ledger = Ledger::new(&dir);
        assert!(ledger
            .append(&Notification::new(None, json!({})))
            .await
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_tmp_file() {
        let root = std::env::temp_dir().join(format!("mailhook-ledger-rename-{}", Uuid::new_v4()));
        let path = root.join("notifications.json");
        // A non-empty directory at the ledger path cannot be replaced by a file.
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let ledger = Ledger::new(&path);
        assert!(ledger.write_records(&[json!({"id": "x"})]).await.is_err());

        let leftovers: Vec<String> = std::fs::read_dir(&root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "left behind {leftovers:?}");
        let _ = std::fs::remove_dir_all(root);
    }
}
