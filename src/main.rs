//! Policypilot service entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use policypilot::appeal::{CaseController, ControllerParts, MailIdentity, PlanService, audit};
use policypilot::channels::email::build_transport;
use policypilot::channels::web::{GatewayState, start_server};
use policypilot::config::{Config, StorageBackend};
use policypilot::db;
use policypilot::services::FileStorage;
use policypilot::services::modal::ModalClient;
use policypilot::services::storage::{LocalStorage, ObjectStorage};
use policypilot::settings::Settings;

/// Health-insurance denial appeal service.
#[derive(Parser, Debug)]
#[command(name = "policypilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Process unread mail once through the configured transport and exit
    SyncInbox,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("policypilot=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

struct App {
    controller: Arc<CaseController>,
    plans: Arc<PlanService>,
}

async fn build_app(config: &Config) -> anyhow::Result<App> {
    let db = db::connect_from_config(&config.database)
        .await
        .context("opening case store")?;

    let storage: Arc<dyn FileStorage> = match config.storage.backend {
        StorageBackend::Local => Arc::new(LocalStorage::new(config.storage.local_root.clone())),
        StorageBackend::Object => {
            let url = config
                .storage
                .object_url
                .as_deref()
                .context("STORAGE_URL is required for object storage")?;
            Arc::new(ObjectStorage::new(url, config.storage.service_key.clone()))
        }
    };

    let ai = Arc::new(ModalClient::new(&config.services).context("building AI service client")?);
    let transport = build_transport(&config.mail).context("building mail transport")?;
    tracing::info!(
        database = config.database.backend.as_str(),
        transport = transport.name(),
        "Collaborators ready"
    );

    let controller = Arc::new(CaseController::new(ControllerParts {
        db: Arc::clone(&db),
        extractor: ai.clone(),
        analyzer: ai.clone(),
        storage: Arc::clone(&storage),
        transport,
        appeal: config.appeal.clone(),
        mail: MailIdentity {
            agent_address: config.mail.agent_address.clone(),
            inbound_domain: config.mail.inbound_domain.clone(),
        },
        denial_bucket: config.storage.denial_bucket.clone(),
        signed_url_ttl: config.storage.signed_url_ttl,
    }));
    let plans = Arc::new(PlanService::new(db, ai, storage));
    Ok(App { controller, plans })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load().context("loading settings")?;
    let config = Config::resolve(&settings).context("resolving configuration")?;
    audit::init(&config.appeal.audit);
    let app = build_app(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let addr = config.gateway.socket_addr()?;
            let state = Arc::new(GatewayState::new(
                app.controller,
                app.plans,
                config.gateway.max_body_bytes,
            ));
            let bound = start_server(addr, Arc::clone(&state)).await?;
            tracing::info!("Policypilot v{} serving on http://{}", env!("CARGO_PKG_VERSION"), bound);
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            state.shutdown().await;
        }
        Command::SyncInbox => {
            let report = app.controller.sync_inbox().await?;
            tracing::info!(
                processed = report.processed,
                linked = report.linked,
                parked = report.parked,
                duplicates = report.duplicates,
                failed = report.failed,
                "Inbox sync complete"
            );
        }
    }
    Ok(())
}
