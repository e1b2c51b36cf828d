//! Typed, trait-object-friendly client for the subset of the Proxmox VE
//! REST API the pool manager needs. Wire format lives entirely in this
//! module; callers only see the operations.

use std::time::Duration;

use async_trait::async_trait;
use pve_pool_common::{PoolError, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerListEntry {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRunState {
    Running,
    Stopped,
    Other,
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub status: String,
    pub exitstatus: Option<String>,
}

/// The PVE operations the pool manager depends on. A trait so tests can
/// substitute an in-memory fake without standing up a real PVE node.
#[async_trait]
pub trait PveClient: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerListEntry>>;
    async fn get_container_config(&self, vmid: u32) -> Result<ContainerConfig>;
    async fn get_container_status(&self, vmid: u32) -> Result<ContainerRunState>;
    async fn linked_clone(
        &self,
        template_vmid: u32,
        new_vmid: u32,
        hostname: &str,
    ) -> Result<Option<String>>;
    async fn start_container(&self, vmid: u32) -> Result<Option<String>>;
    async fn stop_container(&self, vmid: u32) -> Result<Option<String>>;
    async fn delete_container(&self, vmid: u32) -> Result<Option<String>>;
    async fn set_container_hostname(&self, vmid: u32, hostname: &str) -> Result<()>;
    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus>;

    /// Poll `task_id` until it reaches a terminal state. `None` means the
    /// preceding call was synchronous; returns immediately in that case.
    async fn wait_for_task(
        &self,
        task_id: Option<&str>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let Some(task_id) = task_id else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_task_status(task_id).await {
                Ok(status) => {
                    if status.status == "stopped" {
                        return match status.exitstatus.as_deref() {
                            Some("OK") => Ok(()),
                            other => Err(PoolError::PveApi {
                                status: 200,
                                body: format!("task {task_id} finished with exitstatus {other:?}"),
                            }),
                        };
                    }
                }
                // PVE discards finished task records; a 500 here is treated
                // as the task having already completed successfully.
                Err(PoolError::PveApi { status: 500, .. }) => {
                    debug!(task_id, "task status 500, treating as completed");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::TaskTimeout(task_id.to_string()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

pub struct ReqwestPveClient {
    http: reqwest::Client,
    base_url: String,
    token_header: String,
    node: tokio::sync::OnceCell<String>,
    configured_node: Option<String>,
}

impl ReqwestPveClient {
    pub fn new(
        base_url: String,
        api_token: String,
        node: Option<String>,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| PoolError::Config(format!("failed to build PVE http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_header: format!("PVEAPIToken={api_token}"),
            node: tokio::sync::OnceCell::new(),
            configured_node: node,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.base_url, path)
    }

    #[instrument(skip(self))]
    async fn node(&self) -> Result<String> {
        if let Some(n) = &self.configured_node {
            return Ok(n.clone());
        }
        self.node
            .get_or_try_init(|| async {
                #[derive(Deserialize)]
                struct NodeEntry {
                    node: String,
                }
                let nodes: Vec<NodeEntry> = self.get_json(&self.api_url("/nodes")).await?;
                nodes
                    .into_iter()
                    .next()
                    .map(|n| n.node)
                    .ok_or_else(|| PoolError::Internal("PVE reported no nodes".to_string()))
            })
            .await
            .cloned()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        #[derive(Deserialize)]
        struct Envelope<T> {
            data: T,
        }
        let resp = self
            .http
            .get(url)
            .header("Authorization", &self.token_header)
            .send()
            .await
            .map_err(|e| PoolError::PveTransport(e.to_string()))?;
        Self::unwrap_envelope::<Envelope<T>>(resp).await.map(|e| e.data)
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Envelope {
            data: Option<String>,
        }
        let resp = self
            .http
            .post(url)
            .header("Authorization", &self.token_header)
            .form(form)
            .send()
            .await
            .map_err(|e| PoolError::PveTransport(e.to_string()))?;
        Self::unwrap_envelope::<Envelope>(resp).await.map(|e| e.data)
    }

    async fn delete(&self, url: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Envelope {
            data: Option<String>,
        }
        let resp = self
            .http
            .delete(url)
            .header("Authorization", &self.token_header)
            .send()
            .await
            .map_err(|e| PoolError::PveTransport(e.to_string()))?;
        Self::unwrap_envelope::<Envelope>(resp).await.map(|e| e.data)
    }

    async fn unwrap_envelope<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PoolError::PveTransport(e.to_string()))?;

        if !status.is_success() {
            return Err(PoolError::PveApi {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            PoolError::Internal(format!("failed to decode PVE response: {e} (body: {body})"))
        })
    }
}

#[async_trait]
impl PveClient for ReqwestPveClient {
    async fn list_containers(&self) -> Result<Vec<ContainerListEntry>> {
        let node = self.node().await?;
        self.get_json(&self.api_url(&format!("/nodes/{node}/lxc")))
            .await
    }

    async fn get_container_config(&self, vmid: u32) -> Result<ContainerConfig> {
        let node = self.node().await?;
        self.get_json(&self.api_url(&format!("/nodes/{node}/lxc/{vmid}/config")))
            .await
    }

    async fn get_container_status(&self, vmid: u32) -> Result<ContainerRunState> {
        #[derive(Deserialize)]
        struct Status {
            status: String,
        }
        let node = self.node().await?;
        let status: Status = self
            .get_json(&self.api_url(&format!("/nodes/{node}/lxc/{vmid}/status/current")))
            .await?;
        Ok(match status.status.as_str() {
            "running" => ContainerRunState::Running,
            "stopped" => ContainerRunState::Stopped,
            _ => ContainerRunState::Other,
        })
    }

    #[instrument(skip(self))]
    async fn linked_clone(
        &self,
        template_vmid: u32,
        new_vmid: u32,
        hostname: &str,
    ) -> Result<Option<String>> {
        let node = self.node().await?;
        let new_vmid_str = new_vmid.to_string();
        self.post_form(
            &self.api_url(&format!("/nodes/{node}/lxc/{template_vmid}/clone")),
            &[
                ("newid", new_vmid_str.as_str()),
                ("hostname", hostname),
                ("full", "0"),
            ],
        )
        .await
    }

    async fn start_container(&self, vmid: u32) -> Result<Option<String>> {
        let node = self.node().await?;
        self.post_form(
            &self.api_url(&format!("/nodes/{node}/lxc/{vmid}/status/start")),
            &[],
        )
        .await
    }

    async fn stop_container(&self, vmid: u32) -> Result<Option<String>> {
        let node = self.node().await?;
        self.post_form(
            &self.api_url(&format!("/nodes/{node}/lxc/{vmid}/status/stop")),
            &[],
        )
        .await
    }

    async fn delete_container(&self, vmid: u32) -> Result<Option<String>> {
        let node = self.node().await?;
        self.delete(&self.api_url(&format!("/nodes/{node}/lxc/{vmid}")))
            .await
    }

    async fn set_container_hostname(&self, vmid: u32, hostname: &str) -> Result<()> {
        let node = self.node().await?;
        self.post_form(
            &self.api_url(&format!("/nodes/{node}/lxc/{vmid}/config")),
            &[("hostname", hostname)],
        )
        .await?;
        Ok(())
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus> {
        #[derive(Deserialize)]
        struct Raw {
            status: String,
            exitstatus: Option<String>,
        }
        let node = self.node().await?;
        let encoded = urlencoding::encode(task_id);
        let raw: Raw = self
            .get_json(&self.api_url(&format!("/nodes/{node}/tasks/{encoded}/status")))
            .await
            .map_err(|err| {
                if let PoolError::PveApi { status: 500, .. } = &err {
                    warn!(task_id, "task status endpoint returned 500");
                }
                err
            })?;
        Ok(TaskStatus {
            status: raw.status,
            exitstatus: raw.exitstatus,
        })
    }
}
