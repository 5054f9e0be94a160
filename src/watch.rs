use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::error::ApiError;
use crate::gmail::types::{WatchRequest, WatchResponse};
use crate::gmail::{MailApi, INBOX_LABEL};

/// Gmail expires a watch after about a week.
pub const WATCH_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRegistration {
    pub response: WatchResponse,
    pub expires_on: DateTime<Utc>,
}

pub fn default_label_ids() -> Vec<String> {
    vec![INBOX_LABEL.to_string()]
}

pub async fn register_watch(
    api: &dyn MailApi,
    mailbox_owner: &str,
    topic_name: &str,
    label_ids: Vec<String>,
) -> Result<WatchRegistration, ApiError> {
    let request = WatchRequest {
        topic_name: topic_name.to_string(),
        label_ids: if label_ids.is_empty() {
            default_label_ids()
        } else {
            label_ids
        },
    };
    let response = api.watch(mailbox_owner, &request).await?;
    info!(
        topic = topic_name,
        history_id = %response.history_id,
        expiration = %response.expiration,
        "gmail watch registered"
    );

    Ok(WatchRegistration {
        response,
        expires_on: Utc::now() + Duration::days(WATCH_LIFETIME_DAYS),
    })
}

pub async fn stop_watch(api: &dyn MailApi, mailbox_owner: &str) -> Result<(), ApiError> {
    api.stop(mailbox_owner).await?;
    info!("gmail watch stopped");
    Ok(())
}

/// The first UTC midnight strictly after `now`.
pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Re-register the watch every day at UTC midnight. Failures are logged and retried the next day.
pub async fn run_renewal_loop(api: Arc<dyn MailApi>, mailbox_owner: String, topic_name: String) {
    loop {
        let now = Utc::now();
        let wait = (next_midnight(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        tokio::time::sleep(wait).await;

        info!("running scheduled gmail watch setup");
        if let Err(error) =
            register_watch(api.as_ref(), &mailbox_owner, &topic_name, default_label_ids()).await
        {
            error!(%error, "scheduled gmail watch setup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{next_midnight, register_watch};
    use crate::gmail::fake::FakeMailApi;

    #[test]
    fn next_midnight_is_strictly_in_the_future() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 15, 30, 0).unwrap();
        assert_eq!(
            next_midnight(now),
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );

        let midnight = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_midnight(midnight),
            Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn registration_reports_expiry_a_week_out() {
        let api = FakeMailApi::default();
        let registration = register_watch(&api, "me", "projects/p/topics/t", Vec::new())
            .await
            .expect("register");

        assert_eq!(api.calls(), vec!["watch:projects/p/topics/t"]);
        assert_eq!(registration.response.history_id, "1000");
        let days = (registration.expires_on - Utc::now()).num_days();
        assert!((6..=7).contains(&days));
    }
}
