use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pool_manager::PoolManager;
use crate::queue::{CloneQueue, CloneRequest};

/// The single consumer of the clone queue. Processing requests one at a
/// time, sequentially, is what guarantees at most one `linked_clone` call
/// is ever in flight against PVE.
pub struct CloneWorker {
    manager: PoolManager,
    queue: CloneQueue,
    rx: mpsc::UnboundedReceiver<CloneRequest>,
}

impl CloneWorker {
    pub fn new(
        manager: PoolManager,
        queue: CloneQueue,
        rx: mpsc::UnboundedReceiver<CloneRequest>,
    ) -> Self {
        Self { manager, queue, rx }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("clone worker started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("clone worker cancelled, remaining queued requests left unresolved");
                    return;
                }
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        Some(req) => {
                            self.queue.mark_dequeued();
                            let result = self.manager.run_clone(req.template_vmid).await;
                            let _ = req.respond_to.send(result);
                        }
                        None => {
                            info!("clone worker channel closed, shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }
}
