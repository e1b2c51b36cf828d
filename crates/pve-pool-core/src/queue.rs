use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pve_pool_common::Result;
use tokio::sync::{mpsc, oneshot};

use crate::pool::PooledContainer;

pub struct CloneRequest {
    pub template_vmid: u32,
    pub respond_to: oneshot::Sender<Result<PooledContainer>>,
}

/// Single unbounded FIFO of clone requests. The only consumer is
/// [`crate::worker::CloneWorker`]; that single-consumer property is what
/// guarantees PVE never sees two concurrent `linked_clone` calls.
#[derive(Clone)]
pub struct CloneQueue {
    tx: mpsc::UnboundedSender<CloneRequest>,
    length: Arc<AtomicUsize>,
}

impl CloneQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CloneRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                length: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Enqueue a clone request and return a receiver that resolves once
    /// the worker has finished processing it.
    pub fn enqueue(&self, template_vmid: u32) -> oneshot::Receiver<Result<PooledContainer>> {
        let (respond_to, rx) = oneshot::channel();
        // The worker outlives every sender handle for the lifetime of the
        // service; a send error here only happens during shutdown drain,
        // in which case the caller's receiver simply never resolves.
        let _ = self.tx.send(CloneRequest {
            template_vmid,
            respond_to,
        });
        self.length.fetch_add(1, Ordering::SeqCst);
        rx
    }

    /// Fire-and-forget enqueue used by the replenish loop: the result is
    /// discarded, matching the upstream service's "replenishment never
    /// awaits its clones" behavior.
    pub fn enqueue_fire_and_forget(&self, template_vmid: u32) {
        let _ = self.enqueue(template_vmid);
    }

    pub fn len(&self) -> usize {
        self.length.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_dequeued(&self) {
        self.length.fetch_sub(1, Ordering::SeqCst);
    }
}
