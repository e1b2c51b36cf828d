// Shared types for the PVE sandbox pool service: config, errors, and the
// wire-level DTOs exchanged between the HTTP layer and the pool core.

use std::collections::HashMap;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
pub use config::PoolConfig;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("PVE API error (status {status}): {body}")]
    PveApi { status: u16, body: String },

    #[error("PVE transport error: {0}")]
    PveTransport(String),

    #[error("clone failed after retries: {0}")]
    CloneExhausted(String),

    #[error("task {0} timed out")]
    TaskTimeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Deserialize)]
pub struct AllocateRequest {
    pub template_vmid: u32,
    pub instance_id: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocateResponse {
    pub vmid: u32,
    pub hostname: String,
    pub instance_id: String,
    pub template_vmid: u32,
    pub allocated_from_pool: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub vmid: u32,
    pub hostname: String,
    pub state: String,
    pub created_at: String,
    pub allocated_to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplatePoolStatus {
    pub template_vmid: u32,
    pub ready_count: usize,
    pub allocated_count: usize,
    pub creating_count: usize,
    pub target_size: usize,
    pub containers: Vec<ContainerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub templates: HashMap<u32, TemplatePoolStatus>,
    pub total_ready: usize,
    pub total_allocated: usize,
    pub total_creating: usize,
    pub clone_queue_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_request_deserializes_without_optional_fields() {
        let json = r#"{"template_vmid": 9001}"#;
        let req: AllocateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.template_vmid, 9001);
        assert!(req.instance_id.is_none());
        assert!(req.metadata.is_none());
    }

    #[test]
    fn allocate_response_serializes_expected_shape() {
        let resp = AllocateResponse {
            vmid: 201,
            hostname: "pvelxc-aaaa".to_string(),
            instance_id: "pvelxc-aaaa".to_string(),
            template_vmid: 9001,
            allocated_from_pool: true,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"allocated_from_pool\":true"));
    }
}
