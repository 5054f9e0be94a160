use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::ApiError;
use crate::gmail::auth::Session;
use crate::gmail::types::{
    HistoryList, HistoryType, Message, MessageFormat, Profile, SentMessage, WatchRequest,
    WatchResponse,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// The provider operations the pipeline needs. `user_id` is the mailbox owner
/// (an address or `me`).
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Profile, ApiError>;

    async fn list_history(
        &self,
        user_id: &str,
        start_history_id: u64,
        history_types: &[HistoryType],
        page_token: Option<&str>,
    ) -> Result<HistoryList, ApiError>;

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
        format: MessageFormat,
    ) -> Result<Message, ApiError>;

    async fn send_message(&self, user_id: &str, raw: &str) -> Result<SentMessage, ApiError>;

    async fn watch(&self, user_id: &str, request: &WatchRequest)
        -> Result<WatchResponse, ApiError>;

    async fn stop(&self, user_id: &str) -> Result<(), ApiError>;
}

/// Authenticated Gmail REST client; one per process, shared by every caller.
#[derive(Debug, Clone)]
pub struct GmailClient {
    http: Client,
    session: Arc<Session>,
    api_base: String,
}

impl GmailClient {
    pub fn new(http: Client, session: Arc<Session>) -> Self {
        Self {
            http,
            session,
            api_base: GMAIL_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn user_url(&self, user_id: &str, path: &str) -> String {
        format!("{}/users/{user_id}/{path}", self.api_base)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let body = self.send_raw(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<String, ApiError> {
        let token = self.session.access_token().await?;
        let response = request
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::status(status.as_u16(), &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn get_profile(&self, user_id: &str) -> Result<Profile, ApiError> {
        self.send(self.http.get(self.user_url(user_id, "profile")))
            .await
    }

    async fn list_history(
        &self,
        user_id: &str,
        start_history_id: u64,
        history_types: &[HistoryType],
        page_token: Option<&str>,
    ) -> Result<HistoryList, ApiError> {
        let mut query = vec![("startHistoryId", start_history_id.to_string())];
        for history_type in history_types {
            query.push(("historyTypes", history_type.as_str().to_string()));
        }
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token.to_string()));
        }

        self.send(self.http.get(self.user_url(user_id, "history")).query(&query))
            .await
    }

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
        format: MessageFormat,
    ) -> Result<Message, ApiError> {
        let url = self.user_url(user_id, &format!("messages/{message_id}"));
        self.send(self.http.get(url).query(&[("format", format.as_str())]))
            .await
    }

    async fn send_message(&self, user_id: &str, raw: &str) -> Result<SentMessage, ApiError> {
        let url = self.user_url(user_id, "messages/send");
        self.send(self.http.post(url).json(&json!({ "raw": raw })))
            .await
    }

    async fn watch(
        &self,
        user_id: &str,
        request: &WatchRequest,
    ) -> Result<WatchResponse, ApiError> {
        self.send(self.http.post(self.user_url(user_id, "watch")).json(request))
            .await
    }

    async fn stop(&self, user_id: &str) -> Result<(), ApiError> {
        self.send_raw(self.http.post(self.user_url(user_id, "stop")))
            .await
            .map(|_| ())
    }
}
