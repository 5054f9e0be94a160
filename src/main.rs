use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use mailhook::config::{AppConfig, DEFAULT_DATA_DIR};
use mailhook::gmail::auth::{DEFAULT_REDIRECT_URI, GOOGLE_TOKEN_URL};
use mailhook::gmail::GMAIL_API_BASE;

#[derive(Debug, Parser)]
#[command(
    name = "mailhook",
    version,
    about = "Gmail push receiver that archives new inbox messages"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Directory holding notifications.json and the emails/ archive
    #[arg(long, global = true, env = "MAILHOOK_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Mailbox the API calls act on
    #[arg(long, global = true, env = "MAILHOOK_MAILBOX", default_value = "me")]
    mailbox: String,

    #[arg(long, global = true, env = "GOOGLE_CLIENT_ID", hide_env_values = true)]
    client_id: Option<String>,

    #[arg(long, global = true, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    #[arg(long, global = true, env = "GOOGLE_REDIRECT_URI", default_value = DEFAULT_REDIRECT_URI)]
    redirect_uri: String,

    #[arg(long, global = true, env = "GOOGLE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    #[arg(long, global = true, env = "MAILHOOK_GMAIL_API_BASE", default_value = GMAIL_API_BASE)]
    gmail_api_base: String,

    #[arg(long, global = true, env = "MAILHOOK_TOKEN_URL", default_value = GOOGLE_TOKEN_URL)]
    token_url: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server that receives Pub/Sub push notifications
    Serve(ServeArgs),
    /// Register a Gmail watch on the mailbox
    Watch(WatchArgs),
    /// Stop the Gmail watch on the mailbox
    StopWatch,
    /// Send a plain-text email
    Send(SendArgs),
    /// Print the OAuth consent URL
    AuthUrl,
    /// Exchange an authorization code for tokens
    ExchangeCode { code: String },
    /// Print the notification ledger
    Notifications,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Listen address
    #[arg(long, env = "MAILHOOK_BIND")]
    bind: Option<SocketAddr>,

    /// Listen port on all interfaces; ignored when --bind is set
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Pub/Sub topic re-registered every day at midnight UTC
    #[arg(long, env = "MAILHOOK_WATCH_TOPIC")]
    watch_topic: Option<String>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Full Pub/Sub topic name, e.g. projects/<project>/topics/<topic>
    #[arg(long, env = "MAILHOOK_WATCH_TOPIC")]
    topic: String,

    /// Label filter (repeatable); defaults to INBOX
    #[arg(long = "label")]
    labels: Vec<String>,
}

#[derive(Debug, Args)]
struct SendArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    body: String,
}

impl ConfigArgs {
    fn into_config(self) -> AppConfig {
        AppConfig {
            data_dir: self.data_dir,
            mailbox_owner: self.mailbox,
            client_id: self.client_id,
            client_secret: self.client_secret,
            redirect_uri: self.redirect_uri,
            refresh_token: self.refresh_token,
            gmail_api_base: self.gmail_api_base,
            token_url: self.token_url,
            ..AppConfig::default()
        }
    }
}

impl ServeArgs {
    fn resolve_bind(&self, fallback: SocketAddr) -> SocketAddr {
        match (self.bind, self.port) {
            (Some(bind), _) => bind,
            (None, Some(port)) => SocketAddr::from(([0, 0, 0, 0], port)),
            (None, None) => fallback,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use reqwest::Client;
    use tracing::{info, warn};

    use mailhook::compose::{self, OutgoingEmail};
    use mailhook::config::{AppConfig, ConfigError};
    use mailhook::gmail::{GmailClient, MailApi, Session};
    use mailhook::ledger::Ledger;
    use mailhook::reconcile::Reconciler;
    use mailhook::server::{self, AppState};
    use mailhook::watch;

    use super::{Cli, Commands, SendArgs, ServeArgs, WatchArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = cli.config.into_config();
        match cli.command {
            Commands::Serve(args) => handle_serve(config, args).await,
            Commands::Watch(args) => handle_watch(&config, args).await,
            Commands::StopWatch => handle_stop_watch(&config).await,
            Commands::Send(args) => handle_send(&config, args).await,
            Commands::AuthUrl => handle_auth_url(&config),
            Commands::ExchangeCode { code } => handle_exchange_code(&config, &code).await,
            Commands::Notifications => handle_notifications(&config).await,
        }
    }

    async fn handle_serve(mut config: AppConfig, args: ServeArgs) -> Result<()> {
        config.bind = args.resolve_bind(config.bind);
        config.watch_topic = args.watch_topic;

        config
            .prepare_dirs()
            .await
            .with_context(|| format!("create data directory {}", config.data_dir.display()))?;
        let ledger = Ledger::new(config.ledger_path());
        ledger
            .ensure_exists()
            .await
            .with_context(|| format!("initialize ledger at {}", ledger.path().display()))?;

        let http = Client::new();
        let oauth = match config.oauth_client(http.clone()) {
            Ok(oauth) => Some(Arc::new(oauth)),
            Err(error) => {
                warn!(%error, "OAuth client not configured; /auth/google routes are disabled");
                None
            }
        };
        let api: Arc<dyn MailApi> = match config.gmail_client(http.clone()) {
            Ok(client) => Arc::new(client),
            Err(ConfigError::Missing("GOOGLE_REFRESH_TOKEN")) if oauth.is_some() => {
                warn!("GOOGLE_REFRESH_TOKEN is not set; Gmail calls fail until it is configured");
                let oauth = config.oauth_client(http.clone())?;
                Arc::new(
                    GmailClient::new(http, Arc::new(Session::new(oauth, String::new())))
                        .with_api_base(config.gmail_api_base.clone()),
                )
            }
            Err(error) => return Err(error).context("configure Gmail client"),
        };

        if let Some(topic) = config.watch_topic.clone() {
            info!(topic = %topic, "scheduling daily watch renewal at midnight UTC");
            tokio::spawn(watch::run_renewal_loop(
                api.clone(),
                config.mailbox_owner.clone(),
                topic,
            ));
        }

        let reconciler = Reconciler::new(api.clone(), ledger, config.archive_dir());
        let state = AppState {
            reconciler: Arc::new(reconciler),
            api,
            oauth,
            mailbox_owner: config.mailbox_owner.clone(),
        };
        server::serve(state, config.bind)
            .await
            .with_context(|| format!("serve on {}", config.bind))
    }

    async fn handle_watch(config: &AppConfig, args: WatchArgs) -> Result<()> {
        let api = gmail(config)?;
        let registration =
            watch::register_watch(&api, &config.mailbox_owner, &args.topic, args.labels)
                .await
                .with_context(|| format!("register watch for topic {}", args.topic))?;
        println!("{}", serde_json::to_string_pretty(&registration)?);
        Ok(())
    }

    async fn handle_stop_watch(config: &AppConfig) -> Result<()> {
        let api = gmail(config)?;
        watch::stop_watch(&api, &config.mailbox_owner)
            .await
            .context("stop watch")?;
        println!("Stopped watching mailbox");
        Ok(())
    }

    async fn handle_send(config: &AppConfig, args: SendArgs) -> Result<()> {
        let api = gmail(config)?;
        let email = OutgoingEmail {
            from: args.from,
            to: args.to,
            subject: args.subject,
            body: args.body,
        };
        let sent = compose::send_email(&api, &config.mailbox_owner, &email)
            .await
            .with_context(|| format!("send email to {}", email.to))?;
        println!("Sent message {}", sent.id);
        Ok(())
    }

    fn handle_auth_url(config: &AppConfig) -> Result<()> {
        let oauth = config
            .oauth_client(Client::new())
            .context("configure OAuth client")?;
        let url = oauth
            .authorization_url()
            .context("build authorization URL")?;
        println!("{url}");
        Ok(())
    }

    async fn handle_exchange_code(config: &AppConfig, code: &str) -> Result<()> {
        let oauth = config
            .oauth_client(Client::new())
            .context("configure OAuth client")?;
        let tokens = oauth
            .exchange_code(code)
            .await
            .context("exchange authorization code")?;
        match tokens.refresh_token {
            Some(refresh_token) => println!("GOOGLE_REFRESH_TOKEN={refresh_token}"),
            None => println!("No refresh token returned; revoke access and consent again"),
        }
        Ok(())
    }

    async fn handle_notifications(config: &AppConfig) -> Result<()> {
        let ledger = Ledger::new(config.ledger_path());
        let records = ledger
            .load()
            .await
            .with_context(|| format!("read ledger at {}", ledger.path().display()))?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        Ok(())
    }

    fn gmail(config: &AppConfig) -> Result<GmailClient> {
        config
            .gmail_client(Client::new())
            .context("configure Gmail client")
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use clap::Parser;

    use super::{Cli, Commands, ServeArgs};

    #[test]
    fn bind_prefers_explicit_address_then_port() {
        let fallback: SocketAddr = "0.0.0.0:3000".parse().unwrap();
        let args = ServeArgs {
            bind: Some("127.0.0.1:8080".parse().unwrap()),
            port: Some(9000),
            watch_topic: None,
        };
        assert_eq!(args.resolve_bind(fallback).port(), 8080);

        let args = ServeArgs {
            bind: None,
            port: Some(9000),
            watch_topic: None,
        };
        assert_eq!(args.resolve_bind(fallback), "0.0.0.0:9000".parse().unwrap());

        let args = ServeArgs {
            bind: None,
            port: None,
            watch_topic: None,
        };
        assert_eq!(args.resolve_bind(fallback), fallback);
    }

    #[test]
    fn watch_collects_repeated_labels() {
        let cli = Cli::parse_from([
            "mailhook",
            "watch",
            "--topic",
            "projects/p/topics/t",
            "--label",
            "INBOX",
            "--label",
            "IMPORTANT",
        ]);
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.topic, "projects/p/topics/t");
                assert_eq!(args.labels, vec!["INBOX", "IMPORTANT"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
