use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use leadflow_core::StagePolicy;
use leadflow_infra::adapters::{DryRunProvider, JsonFileLeadSource, LogNotifier};
use leadflow_infra::{CounterStore, EngineConfig, InMemoryCounterStore, QueueMetrics, Scheduler};
use leadflow_observability::{LogConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("reading .env");
        }
    }

    let format = match std::env::var("LEADFLOW_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>()?,
        Err(_) => LogFormat::default(),
    };
    leadflow_observability::tracing::init_with(&LogConfig::default().with_format(format));

    let mut config = EngineConfig::from_env().context("loading LEADFLOW_* configuration")?;
    if let Ok(path) = std::env::var("LEADFLOW_STAGE_POLICY_FILE") {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        config.stage_policy =
            StagePolicy::from_json(&raw).with_context(|| format!("parsing {path}"))?;
        config.validate()?;
    }

    let leads_file =
        std::env::var("LEADFLOW_LEADS_FILE").unwrap_or_else(|_| "leads.json".to_string());
    let store = counter_store().await?;

    info!(
        leads_file = %leads_file,
        cadence = ?config.scheduler.cadence,
        batch_size = config.batch.max_batch_size,
        "starting follow-up worker"
    );

    let scheduler = Scheduler::new(
        &config,
        Arc::new(JsonFileLeadSource::new(leads_file)),
        Arc::new(DryRunProvider::new()),
        store.clone(),
    )
    .with_notifier(Arc::new(LogNotifier));
    let handle = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested; finishing the current cycle");
    handle.shutdown().await;

    match QueueMetrics::new(store).snapshot().await {
        Ok(snapshot) => info!(metrics = %snapshot.to_json(), "final queue metrics"),
        Err(e) => warn!(error = %e, "could not read queue metrics"),
    }
    Ok(())
}

async fn counter_store() -> anyhow::Result<Arc<dyn CounterStore>> {
    #[cfg(feature = "redis")]
    {
        if let Ok(url) = std::env::var("REDIS_URL") {
            let store = leadflow_infra::store::RedisCounterStore::connect(&url)
                .await
                .with_context(|| format!("connecting to {url}"))?;
            info!(owner = store.owner(), "using redis counter store");
            let store: Arc<dyn CounterStore> = Arc::new(store);
            return Ok(store);
        }
    }

    info!("REDIS_URL not set; counters and the cycle lock stay in this process");
    let store: Arc<dyn CounterStore> = InMemoryCounterStore::arc();
    Ok(store)
}
