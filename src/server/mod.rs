use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gmail::{MailApi, OAuthClient};
use crate::reconcile::Reconciler;

mod handlers;

pub use handlers::acknowledge;

/// Largest push body read; Pub/Sub caps a message at 10 MB before base64 and envelope overhead.
pub const PUSH_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub api: Arc<dyn MailApi>,
    pub oauth: Option<Arc<OAuthClient>>,
    pub mailbox_owner: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/notifications", get(handlers::list_notifications))
        .route(
            "/api/notifications/pubsub",
            post(handlers::pubsub_push).layer(DefaultBodyLimit::max(PUSH_BODY_LIMIT)),
        )
        .route("/api/email/send", post(handlers::send_email))
        .route("/api/email/test", get(handlers::email_test))
        .route("/api/setup/watch-mailbox", post(handlers::watch_mailbox))
        .route("/api/setup/stop-watch", post(handlers::stop_watch))
        .route("/auth/google", get(handlers::auth_redirect))
        .route("/auth/google/callback", get(handlers::auth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "mailhook listening");
    info!("receive notifications at http://{bind}/api/notifications/pubsub (POST)");
    axum::serve(listener, router(state)).await
}
