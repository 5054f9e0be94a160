pub mod auth;
pub mod client;
pub mod types;

pub use auth::{OAuthClient, OAuthCredentials, Session, TokenResponse};
pub use client::{GmailClient, MailApi, GMAIL_API_BASE};

pub const INBOX_LABEL: &str = "INBOX";
