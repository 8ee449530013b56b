//! The uniform contract implemented by every resource driver on the node.
//!
//! Drivers share no implementation, only this interface; the registry maps
//! driver names to constructors.

pub mod native;
pub mod task;
pub mod test;

use async_trait::async_trait;
use fish_models::{
    label::{ApplicationResource, LabelDefinition},
    resources::Resources,
};
use std::collections::HashMap;

pub use task::{DriverTask, error_body};

/// Lifecycle state reported for an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ResourceStatus {
    #[strum(serialize = "ALLOCATED")]
    Allocated,

    #[strum(serialize = "NONE")]
    None,
}

/// One error kind per contract operation. The message always names the
/// driver instance that produced it.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("config: {0}")]
    Config(String),

    #[error("definition: {0}")]
    Definition(String),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("allocate: {0}")]
    Allocate(String),

    #[error("status: {0}")]
    Status(String),

    #[error("deallocate: {0}")]
    Deallocate(String),

    #[error("task: {0}")]
    Task(String),

    #[error("driver unavailable: {0}")]
    Unavailable(String),
}

/// A resource driver allocates compute environments on (or from) this node.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Instance name; one driver may serve several named instances.
    fn name(&self) -> &str;

    fn set_name(&mut self, name: String);

    /// Remote drivers do not count against the local node's capacity.
    fn is_remote(&self) -> bool;

    /// Parses and validates the instance config, creates working
    /// directories and interrogates the host.
    async fn prepare(&mut self, config: &[u8]) -> Result<(), DriverError>;

    /// Checks a label definition for internal consistency.
    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError>;

    /// How many additional instances of `def` this node can host next to
    /// `node_usage`. `i64::MAX` means unlimited, negative means unknown.
    fn available_capacity(&self, node_usage: &Resources, def: &LabelDefinition) -> i64;

    /// Allocates one environment. Atomic in effect: on failure every
    /// intermediate artifact is torn down before the error is returned.
    async fn allocate(
        &self,
        def: &LabelDefinition,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<ApplicationResource, DriverError>;

    async fn status(&self, res: &ApplicationResource) -> Result<ResourceStatus, DriverError>;

    /// Idempotent in effect; may report an error for unknown identifiers.
    async fn deallocate(&self, res: &ApplicationResource) -> Result<(), DriverError>;

    /// Returns the named task bound to `options`, or None when this driver
    /// has no such task.
    fn task(&self, name: &str, options: &serde_json::value::RawValue) -> Option<Box<dyn DriverTask>>;
}

/// The §4-style capacity arithmetic shared by local drivers: apply the
/// configured alters, adopt the request's tenancy policy when the node is
/// idle, widen by the overbook allowances when both sides opt in, and
/// return the bottleneck across axes.
pub(crate) fn instance_capacity(
    total_cpu: u32,
    total_ram: u32,
    cpu_alter: i32,
    ram_alter: i32,
    cpu_overbook: u32,
    ram_overbook: u32,
    node_usage: &Resources,
    req: &Resources,
) -> i64 {
    if req.cpu == 0 || req.ram == 0 {
        return -1;
    }
    let mut avail_cpu = i64::from(total_cpu) + i64::from(cpu_alter);
    let mut avail_ram = i64::from(total_ram) + i64::from(ram_alter);
    if i64::from(req.cpu) > avail_cpu || i64::from(req.ram) > avail_ram {
        return 0;
    }

    let mut policy = node_usage.clone();
    if policy.is_empty() {
        policy.multitenancy = req.multitenancy;
        policy.cpu_overbook = req.cpu_overbook;
        policy.ram_overbook = req.ram_overbook;
    }
    if policy.multitenancy && req.multitenancy {
        if policy.cpu_overbook && req.cpu_overbook {
            avail_cpu += i64::from(cpu_overbook);
        }
        if policy.ram_overbook && req.ram_overbook {
            avail_ram += i64::from(ram_overbook);
        }
    }

    let by_cpu = (avail_cpu - i64::from(policy.cpu)) / i64::from(req.cpu);
    let by_ram = (avail_ram - i64::from(policy.ram)) / i64::from(req.ram);
    by_cpu.min(by_ram).max(0)
}
