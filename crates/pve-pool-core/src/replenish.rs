use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pool_manager::PoolManager;

/// Periodic top-up of each known template's pool toward `target_size`,
/// bounded per tick by `replenish_batch_size`. Ticks never overlap: the
/// next tick only starts once the previous one's enqueues have all been
/// issued.
pub struct ReplenishLoop {
    manager: PoolManager,
}

impl ReplenishLoop {
    pub fn new(manager: PoolManager) -> Self {
        Self { manager }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("replenish loop started");
        let mut interval = tokio::time::interval(self.manager.config().replenish_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("replenish loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let templates = self.manager.known_templates().await;
        for template_vmid in templates {
            self.manager.replenish_template(template_vmid).await;
        }
    }
}
