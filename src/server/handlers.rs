use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::AppState;
use crate::compose::{self, ComposeError, OutgoingEmail};
use crate::error::MalformedPayload;
use crate::reconcile::ProcessingOutcome;
use crate::watch;

/// Map any outcome to the push acknowledgement. Always 200 so Pub/Sub never redelivers.
pub fn acknowledge(outcome: &ProcessingOutcome) -> (StatusCode, Json<Value>) {
    let body = match outcome {
        ProcessingOutcome::Ignored => json!({ "status": "OK" }),
        ProcessingOutcome::Processed(report) => json!({
            "success": true,
            "message": "Notification received and processed",
            "archived": report.archived.len(),
            "failed": report.errors.len(),
        }),
        ProcessingOutcome::Aborted(reason) => json!({
            "success": false,
            "message": "Error processing notification",
            "error": reason.to_string(),
        }),
    };
    (StatusCode::OK, Json(body))
}

fn failure(status: StatusCode, message: &str, error: Option<String>) -> Response {
    let mut body = json!({ "success": false, "message": message });
    if let Some(error) = error {
        body["error"] = Value::String(error);
    }
    (status, Json(body)).into_response()
}

pub(super) async fn root() -> &'static str {
    "mailhook mail automation API is running"
}

pub(super) async fn pubsub_push(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let outcome = match body {
        Ok(body) => state.reconciler.receive_body(&body).await,
        Err(rejection) => {
            warn!(status = %rejection.status(), error = %rejection.body_text(), "unreadable push body");
            ProcessingOutcome::Aborted(
                MalformedPayload(format!("push body: {}", rejection.body_text())).into(),
            )
        }
    };
    acknowledge(&outcome).into_response()
}

pub(super) async fn list_notifications(State(state): State<AppState>) -> Response {
    match state.reconciler.ledger().load().await {
        Ok(records) => (StatusCode::OK, Json(Value::Array(records))).into_response(),
        Err(error) => {
            error!(%error, "error retrieving notifications");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error retrieving notifications",
                Some(error.to_string()),
            )
        }
    }
}

pub(super) async fn send_email(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(email) = serde_json::from_slice::<OutgoingEmail>(&body) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing required fields. Please provide from, to, subject, and body.",
            None,
        );
    };

    match compose::send_email(state.api.as_ref(), &state.mailbox_owner, &email).await {
        Ok(sent) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Email sent successfully",
                "data": sent,
            })),
        )
            .into_response(),
        Err(error @ (ComposeError::MissingField(_) | ComposeError::HeaderInjection(_))) => {
            failure(StatusCode::BAD_REQUEST, &error.to_string(), None)
        }
        Err(error) => {
            error!(%error, "error sending email");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to send email",
                Some(error.to_string()),
            )
        }
    }
}

pub(super) async fn email_test() -> Json<Value> {
    Json(json!({ "success": true, "message": "Email service is running" }))
}

#[derive(Debug, Deserialize)]
struct WatchMailboxRequest {
    #[serde(rename = "topicName")]
    topic_name: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
}

pub(super) async fn watch_mailbox(State(state): State<AppState>, body: Bytes) -> Response {
    let topic_name = serde_json::from_slice::<WatchMailboxRequest>(&body)
        .ok()
        .and_then(|request| {
            request
                .topic_name
                .filter(|topic| !topic.trim().is_empty())
                .map(|topic| (topic, request.label_ids))
        });
    let Some((topic_name, label_ids)) = topic_name else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing required field: topicName. Please provide the Pub/Sub topic name.",
            None,
        );
    };

    match watch::register_watch(state.api.as_ref(), &state.mailbox_owner, &topic_name, label_ids)
        .await
    {
        Ok(registration) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Successfully set up watch on mailbox",
                "data": registration.response,
                "expirationInfo": {
                    "message": "This watch will expire in approximately 7 days and needs to be renewed",
                    "expiresOn": registration.expires_on,
                },
            })),
        )
            .into_response(),
        Err(error) => {
            error!(%error, "error setting up watch on mailbox");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to set up watch on mailbox",
                Some(error.to_string()),
            )
        }
    }
}

pub(super) async fn stop_watch(State(state): State<AppState>) -> Response {
    match watch::stop_watch(state.api.as_ref(), &state.mailbox_owner).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "Successfully stopped watching mailbox" })),
        )
            .into_response(),
        Err(error) => {
            error!(%error, "error stopping watch on mailbox");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to stop watching mailbox",
                Some(error.to_string()),
            )
        }
    }
}

pub(super) async fn auth_redirect(State(state): State<AppState>) -> Response {
    let Some(oauth) = state.oauth.as_ref() else {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "OAuth client is not configured",
            None,
        );
    };
    match oauth.authorization_url() {
        Ok(url) => Redirect::temporary(url.as_str()).into_response(),
        Err(error) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build authorization URL",
            Some(error.to_string()),
        ),
    }
}

pub(super) async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code").filter(|code| !code.is_empty()) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Authorization code not provided",
            None,
        );
    };
    let Some(oauth) = state.oauth.as_ref() else {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "OAuth client is not configured",
            None,
        );
    };

    match oauth.exchange_code(code).await {
        Ok(tokens) => Html(format!(
            "<h1>Authentication Successful</h1>\n\
             <p>Add this value to your environment:</p>\n\
             <pre>GOOGLE_REFRESH_TOKEN={}</pre>\n\
             <p>Token type: {}</p>\n\
             <p>Expires in: {}</p>\n",
            tokens
                .refresh_token
                .as_deref()
                .unwrap_or("Not provided - you may need to force consent"),
            tokens.token_type.as_deref().unwrap_or("Not available"),
            tokens
                .expires_in
                .map(|seconds| format!("{seconds} seconds"))
                .unwrap_or_else(|| "Not available".to_string()),
        ))
        .into_response(),
        Err(error) => {
            error!(%error, "error exchanging code for tokens");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to exchange code for tokens",
                Some(error.to_string()),
            )
        }
    }
}
