use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pve_pool_common::{PoolError, Result};
use pve_pool_core::pve_client::{ContainerConfig, ContainerListEntry, ContainerRunState, PveClient, TaskStatus};
use tokio::sync::Mutex;

/// Scripted fake PVE API. `linked_clone` replies are taken in order from a
/// per-call queue (default: always succeed synchronously); every call
/// increments/decrements a shared concurrency counter so tests can assert
/// at most one clone is ever in flight.
pub struct MockPveClient {
    pub containers: Mutex<Vec<ContainerListEntry>>,
    pub clone_script: Mutex<VecDeque<std::result::Result<(), String>>>,
    pub in_flight_clones: Arc<AtomicUsize>,
    pub max_observed_concurrency: Arc<AtomicUsize>,
    pub clone_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MockPveClient {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            clone_script: Mutex::new(VecDeque::new()),
            in_flight_clones: Arc::new(AtomicUsize::new(0)),
            max_observed_concurrency: Arc::new(AtomicUsize::new(0)),
            clone_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub async fn push_clone_outcome(&self, outcome: std::result::Result<(), &str>) {
        self.clone_script
            .lock()
            .await
            .push_back(outcome.map_err(|s| s.to_string()));
    }

    pub async fn seed_container(&self, vmid: u32, name: &str, status: &str) {
        self.containers.lock().await.push(ContainerListEntry {
            vmid,
            name: Some(name.to_string()),
            status: status.to_string(),
        });
    }
}

#[async_trait]
impl PveClient for MockPveClient {
    async fn list_containers(&self) -> Result<Vec<ContainerListEntry>> {
        Ok(self.containers.lock().await.clone())
    }

    async fn get_container_config(&self, _vmid: u32) -> Result<ContainerConfig> {
        Ok(ContainerConfig { hostname: None })
    }

    async fn get_container_status(&self, _vmid: u32) -> Result<ContainerRunState> {
        Ok(ContainerRunState::Stopped)
    }

    async fn linked_clone(
        &self,
        _template_vmid: u32,
        new_vmid: u32,
        hostname: &str,
    ) -> Result<Option<String>> {
        self.clone_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight_clones.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_concurrency.fetch_max(current, Ordering::SeqCst);

        // Simulate network latency so concurrently-spawned callers actually
        // overlap the way a real PVE round trip would, and so fast-path
        // pool checks in tests resolve well before any clone this call
        // triggers could complete.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let outcome = self.clone_script.lock().await.pop_front();
        self.in_flight_clones.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            None | Some(Ok(())) => {
                self.containers.lock().await.push(ContainerListEntry {
                    vmid: new_vmid,
                    name: Some(hostname.to_string()),
                    status: "stopped".to_string(),
                });
                Ok(None)
            }
            Some(Err(msg)) => Err(PoolError::PveApi {
                status: 595,
                body: msg,
            }),
        }
    }

    async fn start_container(&self, _vmid: u32) -> Result<Option<String>> {
        Ok(None)
    }

    async fn stop_container(&self, _vmid: u32) -> Result<Option<String>> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn delete_container(&self, _vmid: u32) -> Result<Option<String>> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn set_container_hostname(&self, _vmid: u32, _hostname: &str) -> Result<()> {
        Ok(())
    }

    async fn get_task_status(&self, _task_id: &str) -> Result<TaskStatus> {
        Ok(TaskStatus {
            status: "stopped".to_string(),
            exitstatus: Some("OK".to_string()),
        })
    }
}
