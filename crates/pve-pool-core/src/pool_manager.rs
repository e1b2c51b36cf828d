use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pve_pool_common::{AllocateResponse, PoolConfig, PoolError, PoolStatus, Result, TemplatePoolStatus};
use rand::RngCore;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::pool::{ContainerState, Pool, PooledContainer};
use crate::pve_client::PveClient;
use crate::queue::CloneQueue;

const CLONE_TASK_TIMEOUT: Duration = Duration::from_secs(300);
const START_STOP_TASK_TIMEOUT: Duration = Duration::from_secs(120);
const DELETE_TASK_TIMEOUT: Duration = Duration::from_secs(60);
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct PoolManagerState {
    pool: Pool,
    used_vmids: HashSet<u32>,
}

struct Inner {
    state: Mutex<PoolManagerState>,
    pve: Arc<dyn PveClient>,
    config: PoolConfig,
    clone_queue: CloneQueue,
}

/// Per-template container pools, state transitions, vmid allocation,
/// hostname generation, startup discovery, and the allocate/release/remove
/// API. Cheaply cloneable (all state lives behind `Arc`), so the same
/// handle can be shared with the clone worker, the replenish loop, and the
/// HTTP layer, following the teacher's `ContainerPoolManager::clone()`
/// pattern for distributing a manager across background tasks.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    pub fn new(pve: Arc<dyn PveClient>, config: PoolConfig, clone_queue: CloneQueue) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolManagerState {
                    pool: Pool::new(),
                    used_vmids: HashSet::new(),
                }),
                pve,
                config,
                clone_queue,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn clone_queue(&self) -> &CloneQueue {
        &self.inner.clone_queue
    }

    /// Reconstruct pool state from PVE's own container listing. Never
    /// fatal: failures are logged and the service proceeds with whatever
    /// it could enumerate.
    #[instrument(skip(self))]
    pub async fn discover(&self) {
        let containers = match self.inner.pve.list_containers().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "startup discovery: failed to list PVE containers");
                return;
            }
        };

        let prefix = &self.inner.config.hostname_prefix;
        let pattern = format!("^{}(\\d+)-", regex::escape(prefix));
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(error = %e, "startup discovery: invalid hostname prefix pattern");
                return;
            }
        };

        let mut state = self.inner.state.lock().await;
        for entry in containers {
            let Some(name) = entry.name.as_deref() else {
                continue;
            };
            let Some(caps) = re.captures(name) else {
                continue;
            };
            let Some(template_vmid) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };

            let container_state = match entry.status.as_str() {
                "stopped" => ContainerState::Ready,
                "running" => ContainerState::Allocated,
                _ => ContainerState::Failed,
            };

            let mut container =
                PooledContainer::new_creating(entry.vmid, name.to_string(), template_vmid);
            container.state = container_state;
            if container_state == ContainerState::Allocated {
                // Still has its pool-assigned hostname despite running, so
                // the rename-on-allocate step never completed (or failed)
                // before the service restarted. The real instance_id is
                // unrecoverable; record that explicitly rather than
                // leaving allocated_to null, which would violate the
                // invariant that ALLOCATED implies both fields are set.
                container.allocated_at = Some(container.created_at);
                container.allocated_to = Some(format!("recovered:{name}"));
            }

            state.pool.ensure_template(template_vmid);
            state
                .pool
                .templates
                .get_mut(&template_vmid)
                .unwrap()
                .push_back(container);
            state.used_vmids.insert(entry.vmid);

            info!(vmid = entry.vmid, template_vmid, ?container_state, "discovered pooled container");
        }
    }

    /// Idempotently create the pool entry for `template_vmid` and trigger
    /// one replenishment pass toward `target_size`.
    pub async fn ensure_pool_for_template(&self, template_vmid: u32) {
        self.ensure_template_entry(template_vmid).await;
        self.replenish_template(template_vmid).await;
    }

    /// Idempotently create the pool entry for `template_vmid` without
    /// triggering any replenishment. Used by callers that immediately
    /// follow up with their own `replenish_template_to` call against a
    /// caller-supplied target, so the pool never gets topped up toward
    /// `target_size` first.
    pub async fn ensure_template_entry(&self, template_vmid: u32) {
        let mut state = self.inner.state.lock().await;
        state.pool.ensure_template(template_vmid);
    }

    /// Enqueue clones up to `target_size` (or `count` if given) for one
    /// template, bounded by how many are already ready/creating.
    pub async fn replenish_template(&self, template_vmid: u32) {
        self.replenish_template_to(template_vmid, self.inner.config.target_size)
            .await;
    }

    pub async fn replenish_template_to(&self, template_vmid: u32, target: usize) {
        let current = {
            let state = self.inner.state.lock().await;
            let (ready, _allocated, creating) = state.pool.counts(template_vmid);
            ready + creating
        };
        if current >= target {
            return;
        }
        let deficit = target - current;
        let batch = deficit.min(self.inner.config.replenish_batch_size.max(1));
        for _ in 0..batch {
            self.inner.clone_queue.enqueue_fire_and_forget(template_vmid);
        }
    }

    /// Combine PVE's own listing with in-flight reservations and return
    /// the first unused vmid at or above `container_vmid_start`.
    #[instrument(skip(self))]
    pub async fn next_vmid(&self) -> Result<u32> {
        let start = self.inner.config.container_vmid_start;

        match self.inner.pve.list_containers().await {
            Ok(containers) => {
                let mut taken: HashSet<u32> = containers.iter().map(|c| c.vmid).collect();
                let mut state = self.inner.state.lock().await;
                taken.extend(state.used_vmids.iter().copied());

                let mut candidate = start;
                while taken.contains(&candidate) {
                    candidate += 1;
                }
                state.used_vmids.insert(candidate);
                Ok(candidate)
            }
            Err(e) => {
                warn!(error = %e, "next_vmid: PVE list failed, using fallback allocation");
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let mut candidate = start + (now % 10_000) as u32;
                let mut state = self.inner.state.lock().await;
                while state.used_vmids.contains(&candidate) {
                    candidate += 1;
                }
                state.used_vmids.insert(candidate);
                Ok(candidate)
            }
        }
    }

    /// Allocate a container for `template_vmid` on behalf of `instance_id`.
    /// Fast path pops the oldest READY container; slow path enqueues a
    /// clone and awaits it. Returns `(container, from_pool)`.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        template_vmid: u32,
        instance_id: &str,
    ) -> Result<(PooledContainer, bool)> {
        {
            let mut state = self.inner.state.lock().await;
            state.pool.ensure_template(template_vmid);
            let seq = state.pool.templates.get_mut(&template_vmid).unwrap();
            if let Some(container) = seq.iter_mut().find(|c| c.state == ContainerState::Ready) {
                container.state = ContainerState::Allocated;
                container.allocated_at = Some(std::time::Instant::now());
                container.allocated_to = Some(instance_id.to_string());
                let container = container.clone();
                drop(state);

                let me = self.clone();
                tokio::spawn(async move {
                    me.replenish_template(template_vmid).await;
                });

                return Ok((container, true));
            }
        }

        let rx = self.inner.clone_queue.enqueue(template_vmid);
        let cloned = rx
            .await
            .map_err(|_| PoolError::Internal("clone worker dropped the response channel".into()))??;

        let vmid = cloned.vmid;
        let mut state = self.inner.state.lock().await;
        let Some(container) = state.pool.find_mut(vmid) else {
            return Err(PoolError::Internal(format!(
                "cloned container {vmid} missing from pool"
            )));
        };
        container.state = ContainerState::Allocated;
        container.allocated_at = Some(std::time::Instant::now());
        container.allocated_to = Some(instance_id.to_string());
        Ok((container.clone(), false))
    }

    /// Full `/allocate` flow: acquire a container, rename it to
    /// `instance_id` in PVE (warn-on-fail, never aborts the allocation),
    /// optionally start it, and build the response the HTTP layer returns
    /// verbatim.
    #[instrument(skip(self))]
    pub async fn allocate_and_finalize(
        &self,
        template_vmid: u32,
        instance_id: &str,
        start: bool,
    ) -> Result<AllocateResponse> {
        let (container, from_pool) = self.allocate(template_vmid, instance_id).await?;
        let vmid = container.vmid;

        if let Err(e) = self
            .inner
            .pve
            .set_container_hostname(vmid, instance_id)
            .await
        {
            warn!(vmid, error = %e, "allocate: hostname rename failed, continuing");
        } else {
            let mut state = self.inner.state.lock().await;
            if let Some(c) = state.pool.find_mut(vmid) {
                c.hostname = instance_id.to_string();
            }
        }

        if start {
            match self.inner.pve.start_container(vmid).await {
                Ok(task_id) => {
                    if let Err(e) = self
                        .inner
                        .pve
                        .wait_for_task(task_id.as_deref(), START_STOP_TASK_TIMEOUT, TASK_POLL_INTERVAL)
                        .await
                    {
                        warn!(vmid, error = %e, "allocate: start task did not complete cleanly");
                    }
                }
                Err(e) => warn!(vmid, error = %e, "allocate: start_container failed"),
            }
        }

        Ok(AllocateResponse {
            vmid,
            hostname: instance_id.to_string(),
            instance_id: instance_id.to_string(),
            template_vmid,
            allocated_from_pool: from_pool,
        })
    }

    /// Stop and return a container to READY. Unknown vmid logs and is a
    /// no-op from the caller's perspective.
    #[instrument(skip(self))]
    pub async fn release(&self, vmid: u32) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if !state.pool.contains(vmid) {
                warn!(vmid, "release: unknown vmid");
                return Ok(());
            }
        }

        let task_id = match self.inner.pve.stop_container(vmid).await {
            Ok(task_id) => task_id,
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                if let Some(c) = state.pool.find_mut(vmid) {
                    c.state = ContainerState::Failed;
                    c.error = Some(e.to_string());
                } else {
                    warn!(vmid, "release: unknown vmid");
                }
                return Ok(());
            }
        };

        match self
            .inner
            .pve
            .wait_for_task(task_id.as_deref(), START_STOP_TASK_TIMEOUT, TASK_POLL_INTERVAL)
            .await
        {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                match state.pool.find_mut(vmid) {
                    Some(c) => {
                        c.state = ContainerState::Ready;
                        c.allocated_at = None;
                        c.allocated_to = None;
                        c.error = None;
                    }
                    None => warn!(vmid, "release: unknown vmid"),
                }
            }
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                if let Some(c) = state.pool.find_mut(vmid) {
                    c.state = ContainerState::Failed;
                    c.error = Some(e.to_string());
                } else {
                    warn!(vmid, "release: unknown vmid");
                }
            }
        }
        Ok(())
    }

    /// Best-effort delete in PVE and drop the container from the pool.
    #[instrument(skip(self))]
    pub async fn remove(&self, vmid: u32) {
        match self.inner.pve.delete_container(vmid).await {
            Ok(task_id) => {
                if let Err(e) = self
                    .inner
                    .pve
                    .wait_for_task(task_id.as_deref(), DELETE_TASK_TIMEOUT, TASK_POLL_INTERVAL)
                    .await
                {
                    warn!(vmid, error = %e, "remove: delete task did not complete cleanly");
                }
            }
            Err(e) => {
                warn!(vmid, error = %e, "remove: PVE delete failed, removing from pool anyway");
            }
        }
        let mut state = self.inner.state.lock().await;
        state.pool.remove(vmid);
        state.used_vmids.remove(&vmid);
    }

    pub async fn get_status(&self) -> PoolStatus {
        let state = self.inner.state.lock().await;
        let mut templates = std::collections::HashMap::new();
        let mut total_ready = 0;
        let mut total_allocated = 0;
        let mut total_creating = 0;

        for (&template_vmid, seq) in &state.pool.templates {
            let mut ready_count = 0;
            let mut allocated_count = 0;
            let mut creating_count = 0;
            let mut containers = Vec::with_capacity(seq.len());
            for c in seq {
                match c.state {
                    ContainerState::Ready => ready_count += 1,
                    ContainerState::Allocated => allocated_count += 1,
                    ContainerState::Creating => creating_count += 1,
                    ContainerState::Failed => {}
                }
                containers.push(c.to_summary());
            }
            total_ready += ready_count;
            total_allocated += allocated_count;
            total_creating += creating_count;

            templates.insert(
                template_vmid,
                TemplatePoolStatus {
                    template_vmid,
                    ready_count,
                    allocated_count,
                    creating_count,
                    target_size: self.inner.config.target_size,
                    containers,
                },
            );
        }

        PoolStatus {
            templates,
            total_ready,
            total_allocated,
            total_creating,
            clone_queue_length: self.inner.clone_queue.len(),
        }
    }

    /// Known template ids, used by the replenish loop to snapshot work
    /// without holding the lock across any network I/O.
    pub async fn known_templates(&self) -> Vec<u32> {
        let state = self.inner.state.lock().await;
        state.pool.templates.keys().copied().collect()
    }

    /// Run one clone attempt sequence end to end: generate identity,
    /// reserve the entry, call PVE with jittered retry on lock/busy
    /// errors, and finalize state. Only ever invoked by
    /// [`crate::worker::CloneWorker`]'s single consumer loop — that's what
    /// keeps this globally serialized.
    #[instrument(skip(self))]
    pub(crate) async fn run_clone(&self, template_vmid: u32) -> Result<PooledContainer> {
        let hostname = generate_hostname(&self.inner.config.hostname_prefix, template_vmid);
        let vmid = self.next_vmid().await?;

        {
            let mut state = self.inner.state.lock().await;
            state.pool.ensure_template(template_vmid);
            state
                .pool
                .templates
                .get_mut(&template_vmid)
                .unwrap()
                .push_back(PooledContainer::new_creating(
                    vmid,
                    hostname.clone(),
                    template_vmid,
                ));
        }

        let max_attempts = self.inner.config.clone_max_retries.max(1);
        let mut last_err: Option<PoolError> = None;

        for attempt in 1..=max_attempts {
            match self.try_clone_once(template_vmid, vmid, &hostname).await {
                Ok(()) => {
                    let mut state = self.inner.state.lock().await;
                    if let Some(c) = state.pool.find_mut(vmid) {
                        c.state = ContainerState::Ready;
                        return Ok(c.clone());
                    }
                    return Err(PoolError::Internal(format!(
                        "container {vmid} vanished from pool mid-clone"
                    )));
                }
                Err(e) => {
                    let retryable = is_lock_or_busy(&e);
                    warn!(vmid, attempt, retryable, error = %e, "clone attempt failed");
                    last_err = Some(e);
                    if retryable && attempt < max_attempts {
                        let jitter_ms = if self.inner.config.clone_retry_jitter.as_millis() > 0 {
                            rand::thread_rng()
                                .next_u64()
                                .checked_rem(self.inner.config.clone_retry_jitter.as_millis() as u64)
                                .unwrap_or(0)
                        } else {
                            0
                        };
                        let delay =
                            self.inner.config.clone_retry_delay + Duration::from_millis(jitter_ms);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break;
                }
            }
        }

        let err = last_err.unwrap_or_else(|| PoolError::Internal("clone failed".into()));

        {
            let mut state = self.inner.state.lock().await;
            if let Some(c) = state.pool.find_mut(vmid) {
                c.state = ContainerState::Failed;
                c.error = Some(err.to_string());
            }
        }

        if let Err(del_err) = self.inner.pve.delete_container(vmid).await {
            warn!(vmid, error = %del_err, "best-effort delete of failed clone also failed");
        }

        {
            let mut state = self.inner.state.lock().await;
            state.used_vmids.remove(&vmid);
        }

        Err(PoolError::CloneExhausted(err.to_string()))
    }

    async fn try_clone_once(&self, template_vmid: u32, vmid: u32, hostname: &str) -> Result<()> {
        let task_id = self
            .inner
            .pve
            .linked_clone(template_vmid, vmid, hostname)
            .await?;
        self.inner
            .pve
            .wait_for_task(task_id.as_deref(), CLONE_TASK_TIMEOUT, TASK_POLL_INTERVAL)
            .await
    }
}

fn is_lock_or_busy(err: &PoolError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("locked") || msg.contains("busy")
}

fn generate_hostname(prefix: &str, template_vmid: u32) -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{prefix}{template_vmid}-{hex}")
}
