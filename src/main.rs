use anyhow::Context;
use refledger::domain::{RateSchedule, TimeMs};
use refledger::notify::{NoopSink, NotificationSink, WebhookSink};
use refledger::{api, config::Config, db::init_db, Ledger, Repository};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .with_context(|| format!("failed to initialize database at {}", config.database_path))?;
    let repo = Arc::new(Repository::new(pool));

    // First start on an empty store: seed the configured schedule at epoch.
    if repo.count_rate_schedules().await? == 0 {
        let schedule = RateSchedule::from_percentages(config.rate_schedule_pct, TimeMs::new(0))
            .context("invalid RATE_SCHEDULE")?;
        repo.insert_rate_schedule(&schedule).await?;
        tracing::info!(rates = ?schedule.rates, "Seeded rate schedule");
    }

    let sink: Arc<dyn NotificationSink> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())),
        None => Arc::new(NoopSink),
    };

    let ledger = Arc::new(Ledger::new(
        repo.clone(),
        repo.clone(),
        repo,
        sink,
        &config,
    ));
    let reconciler = ledger.spawn_reconciler();

    let app = api::create_router(api::AppState::new(ledger.clone()));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    ledger.shutdown();
    let _ = reconciler.await;
    Ok(())
}
