use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ApiError;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/auth/google/callback";
const CACHE_SKEW_SECONDS: i64 = 60;

pub const GMAIL_SCOPES: &[&str] = &[
    "https://mail.google.com/",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.modify",
];

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Stateless OAuth2 calls against Google's authorization server.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    credentials: OAuthCredentials,
    auth_url: String,
    token_url: String,
}

impl OAuthClient {
    pub fn new(http: Client, credentials: OAuthCredentials) -> Self {
        Self {
            http,
            credentials,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Consent URL requesting offline access; `prompt=consent` forces a refresh token.
    pub fn authorization_url(&self) -> Result<Url, ApiError> {
        Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.credentials.client_id.as_str()),
                ("redirect_uri", self.credentials.redirect_uri.as_str()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("scope", GMAIL_SCOPES.join(" ").as_str()),
            ],
        )
        .map_err(|error| ApiError::Auth(format!("build authorization url: {error}")))
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ApiError> {
        self.request_token(&[
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        self.request_token(&[
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ApiError> {
        let response = self.http.post(&self.token_url).form(form).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::status(status.as_u16(), &body));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn from_response(response: TokenResponse) -> Self {
        let lifetime = response.expires_in.unwrap_or(3600) as i64;
        Self {
            access_token: response.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime.saturating_sub(CACHE_SKEW_SECONDS)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Refresh-token backed credentials. Access tokens are cached in memory until shortly
/// before they expire.
#[derive(Debug)]
pub struct Session {
    oauth: OAuthClient,
    refresh_token: String,
    cached: Mutex<Option<CachedAccessToken>>,
}

impl Session {
    pub fn new(oauth: OAuthClient, refresh_token: impl Into<String>) -> Self {
        Self {
            oauth,
            refresh_token: refresh_token.into(),
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.access_token.clone());
        }

        debug!("refreshing gmail access token");
        let fresh = CachedAccessToken::from_response(self.oauth.refresh(&self.refresh_token).await?);
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }
}
