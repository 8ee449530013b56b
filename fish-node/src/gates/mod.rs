//! Gate drivers convert outside events into allocation requests.

pub mod github;

use crate::drivers::DriverError;
use async_trait::async_trait;

#[async_trait]
pub trait GateDriver: Send + Sync {
    /// Instance name; one driver may serve several named instances.
    fn name(&self) -> &str;

    fn set_name(&mut self, name: String);

    /// Parses and validates the config, then spawns the gate's wake loops.
    async fn prepare(&mut self, config: &[u8]) -> Result<(), DriverError>;

    /// Stops the wake loops; in-flight work finishes at its next waypoint.
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// One workflow job transition extracted from a delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct JobEvent {
    pub owner: String,
    pub repo: String,

    /// The transition: queued, in_progress or completed.
    pub action: String,

    pub job_id: i64,
    pub run_id: i64,
    pub job_name: String,

    /// Runner labels requested by the job; these select the Application
    /// label to allocate.
    pub labels: Vec<String>,
}

/// The seam to whoever turns a job transition into an Application request
/// (and back out of one).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute_job(&self, job: &JobEvent) -> anyhow::Result<()>;
}
