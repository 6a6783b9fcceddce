use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{coordinator::Coordinator, traits::artifact_store::ArtifactStore};

/// Periodically expires artifacts and forgets runs past the retention window.
#[tracing::instrument(skip(store, coordinator, stop))]
pub fn handle_reaping(
    store: Arc<dyn ArtifactStore>,
    coordinator: Arc<Coordinator>,
    interval: Duration,
    retention: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match store.reap().await {
                Ok(stats) if stats.expired + stats.evicted > 0 => {
                    tracing::info!("Reaped artifacts: {:?}", stats);
                }
                Ok(_) => {}
                Err(err) => tracing::error!("Artifact reaping failed: {}", err),
            }

            let forgotten = coordinator.forget_finished(retention);
            if forgotten > 0 {
                tracing::debug!("Forgot {} finished runs", forgotten);
            }
        }
        tracing::debug!("Reaper stopped");
    })
}
