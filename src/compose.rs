use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::ApiError;
use crate::gmail::types::SentMessage;
use crate::gmail::MailApi;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("header {0} must not contain line breaks")]
    HeaderInjection(&'static str),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl OutgoingEmail {
    pub fn validate(&self) -> Result<(), ComposeError> {
        for (name, value) in self.headers() {
            if value.trim().is_empty() {
                return Err(ComposeError::MissingField(name));
            }
            if value.contains(['\r', '\n']) {
                return Err(ComposeError::HeaderInjection(name));
            }
        }
        if self.body.trim().is_empty() {
            return Err(ComposeError::MissingField("body"));
        }
        Ok(())
    }

    /// RFC 5322 plain-text message with CRLF line endings.
    pub fn to_rfc5322(&self) -> String {
        [
            format!("From: {}", self.from),
            format!("To: {}", self.to),
            format!("Subject: {}", self.subject),
            "MIME-Version: 1.0".to_string(),
            "Content-Type: text/plain; charset=utf-8".to_string(),
            String::new(),
            self.body.clone(),
        ]
        .join("\r\n")
    }

    /// The message encoded for the `raw` field of `messages.send`.
    pub fn encode_raw(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_rfc5322())
    }

    fn headers(&self) -> [(&'static str, &str); 3] {
        [
            ("from", self.from.as_str()),
            ("to", self.to.as_str()),
            ("subject", self.subject.as_str()),
        ]
    }
}

pub async fn send_email(
    api: &dyn MailApi,
    mailbox_owner: &str,
    email: &OutgoingEmail,
) -> Result<SentMessage, ComposeError> {
    email.validate()?;
    let sent = api.send_message(mailbox_owner, &email.encode_raw()).await?;
    info!(id = %sent.id, to = %email.to, "email sent");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::{send_email, ComposeError, OutgoingEmail};
    use crate::gmail::fake::FakeMailApi;

    fn email() -> OutgoingEmail {
        OutgoingEmail {
            from: "me@example.com".to_string(),
            to: "you@example.com".to_string(),
            subject: "Status ✓".to_string(),
            body: "line one\r\nline two".to_string(),
        }
    }

    #[test]
    fn message_has_headers_blank_line_and_body() {
        let rendered = email().to_rfc5322();
        assert_eq!(
            rendered,
            "From: me@example.com\r\nTo: you@example.com\r\nSubject: Status ✓\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nline one\r\nline two"
        );
    }

    #[test]
    fn raw_encoding_is_unpadded_base64url() {
        let encoded = email().encode_raw();
        assert!(!encoded.contains(['+', '/', '=']));
        let decoded = URL_SAFE_NO_PAD.decode(&encoded).expect("decode");
        assert_eq!(String::from_utf8(decoded).unwrap(), email().to_rfc5322());
    }

    #[test]
    fn validation_rejects_missing_fields_and_header_injection() {
        let mut missing = email();
        missing.to = " ".to_string();
        assert!(matches!(
            missing.validate(),
            Err(ComposeError::MissingField("to"))
        ));

        let mut injected = email();
        injected.subject = "hi\r\nBcc: victim@example.com".to_string();
        assert!(matches!(
            injected.validate(),
            Err(ComposeError::HeaderInjection("subject"))
        ));
    }

    #[tokio::test]
    async fn send_posts_encoded_message() {
        let api = FakeMailApi::default();
        let sent = send_email(&api, "me", &email()).await.expect("send");
        assert_eq!(sent.id, "sent-1");
        assert_eq!(api.calls(), vec![format!("send:{}", email().encode_raw())]);
    }
}
