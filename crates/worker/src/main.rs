use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgListener;
use statuscast_channels::{ChannelRegistry, EmailChannel, HttpEmailClient, WebhookChannel};
use statuscast_core::config::Settings;
use statuscast_db::PgStore;
use statuscast_worker::{handle_job, DispatchJob, Dispatcher};
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;

    let pool = statuscast_db::connect(&settings.database_url, 5).await?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let email_client = HttpEmailClient::from_settings(&settings)?;
    let channels = ChannelRegistry::new(
        Arc::new(EmailChannel::new(Arc::new(email_client))),
        Arc::new(WebhookChannel::from_settings(&settings)),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        store.clone(),
        store.clone(),
        channels,
    ));

    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(&settings.dispatch_channel).await?;

    let permits = Arc::new(Semaphore::new(settings.worker_concurrency.max(1)));
    info!(
        channel = %settings.dispatch_channel,
        concurrency = settings.worker_concurrency,
        "worker listening"
    );

    loop {
        let notification = tokio::select! {
            notification = listener.recv() => notification?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };

        let job = match DispatchJob::parse(notification.payload()) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "dropping malformed dispatch payload");
                continue;
            }
        };

        let permit = permits.clone().acquire_owned().await?;
        let dispatcher = dispatcher.clone();
        let claims = store.clone();
        tokio::spawn(async move {
            handle_job(&dispatcher, claims.as_ref(), job).await;
            drop(permit);
        });
    }

    // wait for in-flight jobs
    let _ = permits
        .acquire_many(settings.worker_concurrency.max(1) as u32)
        .await?;
    info!("worker stopped");
    Ok(())
}
