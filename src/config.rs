use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use thiserror::Error;

use crate::gmail::auth::GOOGLE_TOKEN_URL;
use crate::gmail::{GmailClient, OAuthClient, OAuthCredentials, Session, GMAIL_API_BASE};

pub const DEFAULT_BIND: &str = "0.0.0.0:3000";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const NOTIFICATIONS_FILE: &str = "notifications.json";
pub const EMAILS_DIR: &str = "emails";
/// Gmail's alias for the authenticated user.
pub const AUTHENTICATED_USER: &str = "me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub mailbox_owner: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub refresh_token: Option<String>,
    pub watch_topic: Option<String>,
    pub gmail_api_base: String,
    pub token_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000))),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mailbox_owner: AUTHENTICATED_USER.to_string(),
            client_id: None,
            client_secret: None,
            redirect_uri: crate::gmail::auth::DEFAULT_REDIRECT_URI.to_string(),
            refresh_token: None,
            watch_topic: None,
            gmail_api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(NOTIFICATIONS_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join(EMAILS_DIR)
    }

    /// Create the data and archive directories.
    pub async fn prepare_dirs(&self) -> Result<(), ConfigError> {
        tokio::fs::create_dir_all(self.archive_dir()).await?;
        Ok(())
    }

    pub fn oauth_client(&self, http: Client) -> Result<OAuthClient, ConfigError> {
        let credentials = OAuthCredentials {
            client_id: non_empty(&self.client_id).ok_or(ConfigError::Missing("GOOGLE_CLIENT_ID"))?,
            client_secret: non_empty(&self.client_secret)
                .ok_or(ConfigError::Missing("GOOGLE_CLIENT_SECRET"))?,
            redirect_uri: self.redirect_uri.clone(),
        };
        Ok(OAuthClient::new(http, credentials).with_token_url(self.token_url.clone()))
    }

    /// The authenticated API handle; requires a refresh token.
    pub fn gmail_client(&self, http: Client) -> Result<GmailClient, ConfigError> {
        let refresh_token =
            non_empty(&self.refresh_token).ok_or(ConfigError::Missing("GOOGLE_REFRESH_TOKEN"))?;
        let session = Arc::new(Session::new(self.oauth_client(http.clone())?, refresh_token));
        Ok(GmailClient::new(http, session).with_api_base(self.gmail_api_base.clone()))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use reqwest::Client;

    use super::{AppConfig, ConfigError};

    #[test]
    fn paths_derive_from_data_dir() {
        let config = AppConfig {
            data_dir: PathBuf::from("/var/lib/mailhook"),
            ..AppConfig::default()
        };
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/var/lib/mailhook/notifications.json")
        );
        assert_eq!(config.archive_dir(), PathBuf::from("/var/lib/mailhook/emails"));
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.mailbox_owner, "me");
    }

    #[test]
    fn gmail_client_requires_credentials() {
        let config = AppConfig {
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            refresh_token: Some("   ".to_string()),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.gmail_client(Client::new()),
            Err(ConfigError::Missing("GOOGLE_REFRESH_TOKEN"))
        ));

        let config = AppConfig {
            refresh_token: Some("refresh".to_string()),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.gmail_client(Client::new()),
            Err(ConfigError::Missing("GOOGLE_CLIENT_ID"))
        ));
    }
}
