use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use pve_pool_common::ContainerSummary;

/// Lifecycle state of a single pooled container. A sum type rather than a
/// raw string so the allowed transitions are statically checkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Creating,
    Ready,
    Allocated,
    Failed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "CREATING",
            ContainerState::Ready => "READY",
            ContainerState::Allocated => "ALLOCATED",
            ContainerState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub vmid: u32,
    pub hostname: String,
    pub template_vmid: u32,
    pub state: ContainerState,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub allocated_at: Option<Instant>,
    pub allocated_to: Option<String>,
    pub error: Option<String>,
}

impl PooledContainer {
    pub fn new_creating(vmid: u32, hostname: String, template_vmid: u32) -> Self {
        Self {
            vmid,
            hostname,
            template_vmid,
            state: ContainerState::Creating,
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            allocated_at: None,
            allocated_to: None,
            error: None,
        }
    }

    pub fn to_summary(&self) -> ContainerSummary {
        ContainerSummary {
            vmid: self.vmid,
            hostname: self.hostname.clone(),
            state: self.state.as_str().to_string(),
            created_at: self.created_at_utc.to_rfc3339(),
            allocated_to: self.allocated_to.clone(),
        }
    }
}

/// `template_vmid -> ordered sequence of containers`, oldest first, so
/// allocation can pop the front for FIFO reuse.
#[derive(Debug, Default)]
pub struct Pool {
    pub templates: HashMap<u32, VecDeque<PooledContainer>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_template(&mut self, template_vmid: u32) {
        self.templates.entry(template_vmid).or_default();
    }

    pub fn sequence(&self, template_vmid: u32) -> Option<&VecDeque<PooledContainer>> {
        self.templates.get(&template_vmid)
    }

    pub fn counts(&self, template_vmid: u32) -> (usize, usize, usize) {
        let Some(seq) = self.templates.get(&template_vmid) else {
            return (0, 0, 0);
        };
        let mut ready = 0;
        let mut allocated = 0;
        let mut creating = 0;
        for c in seq {
            match c.state {
                ContainerState::Ready => ready += 1,
                ContainerState::Allocated => allocated += 1,
                ContainerState::Creating => creating += 1,
                ContainerState::Failed => {}
            }
        }
        (ready, allocated, creating)
    }

    pub fn contains(&self, vmid: u32) -> bool {
        self.templates
            .values()
            .any(|seq| seq.iter().any(|c| c.vmid == vmid))
    }

    pub fn find_mut(&mut self, vmid: u32) -> Option<&mut PooledContainer> {
        self.templates
            .values_mut()
            .flat_map(|seq| seq.iter_mut())
            .find(|c| c.vmid == vmid)
    }

    pub fn remove(&mut self, vmid: u32) -> Option<PooledContainer> {
        for seq in self.templates.values_mut() {
            if let Some(pos) = seq.iter().position(|c| c.vmid == vmid) {
                return seq.remove(pos);
            }
        }
        None
    }
}
