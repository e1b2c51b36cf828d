pub mod pool;
pub mod pool_manager;
pub mod pve_client;
pub mod queue;
pub mod replenish;
pub mod worker;

pub use pool::{ContainerState, Pool, PooledContainer};
pub use pool_manager::PoolManager;
pub use pve_client::{ContainerListEntry, ContainerRunState, PveClient, ReqwestPveClient};
pub use queue::{CloneQueue, CloneRequest};
pub use replenish::ReplenishLoop;
pub use worker::CloneWorker;
