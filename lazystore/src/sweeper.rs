use crate::entity_model::Entity;
use crate::manager::{EntityManager, SaveOperation, SaveReport};
use crate::{error, info};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

/// Periodic write-back: saves every cached entry and evicts the inactive ones.
pub struct Sweeper<T: Entity> {
    manager: EntityManager<T>,
}

impl<T: Entity> Sweeper<T> {
    pub fn new(manager: EntityManager<T>) -> Self {
        Sweeper { manager }
    }

    pub async fn sweep(&self) -> SaveReport {
        self.manager.flush_all(SaveOperation::SaveAllAndEvictInactive).await
    }

    /// Sweeps every `every` until `shutdown` changes. The first sweep happens
    /// one interval after start.
    pub async fn run(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval_at(time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stopping sweeper of {}", self.manager.table());
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if !report.is_clean() {
                        error!("Sweep of {} left {} unsaved entries", self.manager.table(), report.failed.len());
                    }
                }
            }
        }
    }

    pub fn spawn(self, every: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(every, shutdown).await })
    }
}
