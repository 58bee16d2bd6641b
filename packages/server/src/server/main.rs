// Main entry point for the link audit API server.

use anyhow::{Context, Result};
use server_core::{config::Config, server::build_app};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting link audit execution plane");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let (app, handles) = build_app(pool, config.worker_concurrency, config.render_proxy_token);

    // Bootstrap the scheduler with every sheet already armed for recurring runs (spec §4.6) —
    // a fresh `Scheduler` starts with no timers, so sheets created before this process last
    // restarted would otherwise never fire again.
    let active_sheets = handles
        .repository
        .active_sheets()
        .await
        .context("failed to load active sheets")?;
    for sheet in &active_sheets {
        handles.scheduler.arm(sheet).await;
    }
    tracing::info!(count = active_sheets.len(), "armed active sheets");

    let worker_pool = handles.worker_pool;
    tokio::spawn(async move {
        worker_pool
            .run(std::time::Duration::from_secs(2))
            .await;
    });
    handles.scheduler.spawn();

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("server error")?;

    Ok(())
}
