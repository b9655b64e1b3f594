use std::net::SocketAddr;
use std::sync::Arc;

use statuscast_channels::{ChannelRegistry, EmailChannel, HttpEmailClient, WebhookChannel};
use statuscast_core::config::Settings;
use statuscast_core::SubscriptionService;
use statuscast_db::PgStore;
use tokio::net::TcpListener;
use tracing::info;

mod error;
mod middleware;
mod routes;
mod state;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;

    let pool = statuscast_db::connect(&settings.database_url, 10).await?;
    if settings.run_migrations {
        statuscast_db::migrate(&pool).await?;
        info!("migrations applied");
    }
    let store = Arc::new(PgStore::new(pool));

    let service = SubscriptionService::new(store.clone(), store)
        .with_verification_ttl(settings.verification_ttl())
        .with_production(settings.is_production());

    let email_client = HttpEmailClient::from_settings(&settings)?;
    let channels = ChannelRegistry::new(
        Arc::new(EmailChannel::new(Arc::new(email_client))),
        Arc::new(WebhookChannel::from_settings(&settings)),
    );

    let redis = settings
        .redis_url
        .as_deref()
        .map(redis::Client::open)
        .transpose()?;

    let addr: SocketAddr = settings.api_bind.parse()?;
    let state = AppState {
        service: Arc::new(service),
        channels,
        settings: Arc::new(settings),
        redis,
    };

    let app = routes::app(state);

    info!(%addr, "starting api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
