//! Postline mail-provider integration service.
//!
//! Main entry point. Initializes all subsystems and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use postline_api::{
    alert::{LogAlerter, OperatorAlerter, WebhookAlerter},
    ingest::StaticSecret,
    metrics::MetricsFlusher,
    server::shutdown_signal,
    AppState, Config, MailService, WebhookIngestor,
};
use postline_core::{storage::migrate, Clock, PostgresStatusStore, RealClock, StatusStore};
use postline_resilience::{CircuitBreaker, ProviderClient, RateLimitGate, RetryExecutor};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting postline");

    let config = Config::load()?;
    let addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %addr,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    migrate(&db_pool).await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let breaker = Arc::new(CircuitBreaker::new(config.to_circuit_config(), clock.clone()));
    let gate = Arc::new(RateLimitGate::new(clock.clone()));
    let executor = Arc::new(
        RetryExecutor::new(breaker.clone(), gate.clone(), clock.clone())
            .with_attempt_timeout(Duration::from_secs(config.provider_timeout_seconds)),
    );

    let store: Arc<dyn StatusStore> = Arc::new(
        PostgresStatusStore::new(db_pool.clone())
            .with_dedupe_window(Duration::from_secs(config.webhook_dedupe_window_seconds)),
    );

    let mail = if config.provider_api_key.is_empty() {
        warn!("PROVIDER_API_KEY not set, outbound provider calls disabled");
        None
    } else {
        let client = ProviderClient::new(config.to_client_config(), executor)
            .context("Failed to build provider client")?;
        info!(base_url = %config.provider_base_url, "Provider client ready");
        Some(Arc::new(MailService::new(client, store.clone(), clock.clone())))
    };

    if config.webhook_secret.is_empty() {
        warn!("WEBHOOK_SECRET not set, every webhook will be refused");
    }

    let ingestor = Arc::new(WebhookIngestor::new(
        store.clone(),
        Arc::new(StaticSecret::new(config.webhook_secret.clone())),
        create_alerter(&config)?,
        clock.clone(),
        config.to_ingest_config(),
    ));
    let metrics = ingestor.metrics().clone();
    let mut state = AppState::new(ingestor, breaker, gate, clock);
    if let Some(mail) = mail {
        state = state.with_mail(mail);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let flusher = config.metrics_flush_interval().map(|interval| {
        info!(interval_secs = interval.as_secs(), "Periodic metrics flush enabled");
        MetricsFlusher::spawn(metrics.clone(), store.clone(), interval, shutdown.clone())
    });

    info!(addr = %addr, "postline is ready to receive webhooks");

    if let Err(e) =
        postline_api::start_server(state, config.to_server_options(), addr, shutdown.clone())
            .await
    {
        error!(error = %e, "Server failed");
    }

    shutdown.cancel();
    match flusher {
        Some(handle) => {
            if let Err(e) = handle.await {
                error!(error = %e, "Metrics flusher panicked");
            }
        },
        None => metrics.flush_to(store.as_ref()).await,
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("postline shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,postline=debug,tower_http=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Picks the operator alert channel.
fn create_alerter(config: &Config) -> Result<Arc<dyn OperatorAlerter>> {
    match &config.alert_webhook_url {
        Some(url) => {
            let alerter = WebhookAlerter::new(url.clone(), Duration::from_secs(10))
                .context("Failed to build alert webhook client")?;
            Ok(Arc::new(alerter))
        },
        None => Ok(Arc::new(LogAlerter)),
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
