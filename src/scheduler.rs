// Periodic triggers for the two cycles
//
// Each cycle gets its own interval loop. A tick that finds the previous run of the same
// cycle still holding the run lock is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::EngineError;
use crate::market::{Cycle, Orchestrator, RunReport};
use crate::store::MarketplaceStore;

/// Run one cycle and log its outcome
///
/// Returns the report of a committed run, `None` if the run was rejected or failed.
pub async fn run_once<S>(orchestrator: &Orchestrator<S>, cycle: Cycle) -> Option<RunReport>
where
    S: MarketplaceStore,
{
    let result = match cycle {
        Cycle::Restock => orchestrator.run_restock_cycle().await,
        Cycle::Fulfillment => orchestrator.run_fulfillment_cycle().await,
    };

    match result {
        Ok(report) => Some(report),
        Err(EngineError::RunInProgress(cycle)) => {
            tracing::warn!("Skipping {} tick: previous run still in progress", cycle);
            None
        }
        Err(e) => {
            tracing::error!("{} run failed: {}", cycle, e);
            None
        }
    }
}

/// Spawn the interval loop for one cycle
pub fn spawn_cycle<S>(
    orchestrator: Arc<Orchestrator<S>>,
    cycle: Cycle,
    every: Duration,
) -> JoinHandle<()>
where
    S: MarketplaceStore + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            run_once(&orchestrator, cycle).await;
        }
    })
}

/// Run both cycles until Ctrl-C
pub async fn run<S>(
    orchestrator: Arc<Orchestrator<S>>,
    restock_every: Duration,
    fulfillment_every: Duration,
) where
    S: MarketplaceStore + 'static,
{
    tracing::info!(
        "Scheduling restock every {}s and fulfillment every {}s",
        restock_every.as_secs(),
        fulfillment_every.as_secs()
    );

    let restock = spawn_cycle(Arc::clone(&orchestrator), Cycle::Restock, restock_every);
    let fulfillment = spawn_cycle(Arc::clone(&orchestrator), Cycle::Fulfillment, fulfillment_every);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down scheduler");
    restock.abort();
    fulfillment.abort();
    orchestrator.metrics().log_summary();
}
