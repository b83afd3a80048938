use envconfig::Envconfig;
use moto_club_hub::{
    achievements, auth::AuthKeys, config::Config, connect_to_db, cors_layer, email::Mailer,
    storage::StorageSettings,
};
use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = Config::init_from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter())),
        )
        .init();

    let storage = StorageSettings::from_config(&config)?;
    tracing::info!(backend = storage.backend_name(), "image storage configured");
    let keys = Arc::new(AuthKeys::from_config(&config)?);
    let mailer = Mailer::from_config(&config)?;
    mailer.sanity_check().await;

    let pool = connect_to_db(&config.db_url)?;
    {
        let conn = &mut pool.get().await?;
        achievements::seed_catalogue(conn)
            .await
            .map_err(|e| anyhow::anyhow!("failed to seed the achievement catalogue: {e:?}"))?;
    }

    let app = moto_club_hub::app(pool, keys, mailer, &storage).layer(cors_layer(&config.allowed_hosts)?);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
