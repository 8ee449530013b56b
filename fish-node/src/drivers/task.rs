//! Post-allocation task plugins.
//!
//! A driver exposes named task prototypes; the prototype is cloned before
//! parameter binding so the original is never mutated.

use crate::drivers::DriverError;
use async_trait::async_trait;
use fish_models::label::{ApplicationResource, ApplicationTask, LabelDefinition};

/// A clonable, parametrized post-allocation task (for example a snapshot of
/// the allocation's disks).
#[async_trait]
pub trait DriverTask: Send + Sync {
    fn name(&self) -> &str;

    /// Clones the prototype so it can be bound without touching the original.
    fn clone_task(&self) -> Box<dyn DriverTask>;

    /// Binds the execution context before `execute` is called.
    fn set_info(&mut self, task: ApplicationTask, def: LabelDefinition, res: ApplicationResource);

    /// Produces the task's result payload. On failure the caller derives
    /// the reply body via [`error_body`].
    async fn execute(&self) -> Result<Vec<u8>, DriverError>;
}

/// Minimal JSON body describing a failed task execution.
pub fn error_body(err: &DriverError) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "error": err.to_string() }))
        .unwrap_or_else(|_| format!("{{\"error\": \"{err}\"}}").into_bytes())
}
