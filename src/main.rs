use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_engine::config::Config;
use cadence_engine::database;
use cadence_engine::jobs::{EngineScheduler, EnrollmentRunner};
use cadence_engine::services::channel::HttpMessageChannel;
use cadence_engine::services::directory::PgContactDirectory;
use cadence_engine::workflows::definition::DefinitionStore;
use cadence_engine::workflows::enrollment::EnrollmentStore;
use cadence_engine::workflows::executor::{ExecutorConfig, StepExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    if !config.channel.is_configured() {
        tracing::warn!("Message channel is not fully configured; sends will fail");
    }

    let pool = database::create_pool(&config.database_url).await?;
    database::migrate(&pool).await?;

    let definitions = Arc::new(DefinitionStore::new(pool.clone()));
    let store = EnrollmentStore::new(pool.clone());
    let directory = Arc::new(PgContactDirectory::new(pool.clone()));
    let channel = Arc::new(HttpMessageChannel::new(
        &config.channel.base_url,
        &config.channel.api_key,
    ));

    let executor = Arc::new(StepExecutor::new(
        channel,
        directory.clone(),
        ExecutorConfig::from_config(&config),
    ));

    let runner = EnrollmentRunner::new(
        definitions,
        store,
        executor,
        directory,
        config.engine.clone(),
    );

    let mut scheduler = EngineScheduler::new(runner, config.engine.tick_interval_secs).await?;
    scheduler.start().await?;

    tracing::info!("Worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    scheduler.shutdown().await?;

    Ok(())
}
