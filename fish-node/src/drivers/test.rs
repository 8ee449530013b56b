//! The mock resource driver used by unit and property tests: allocations
//! are marker files, and every failure point is parameterized by an 8-bit
//! probability.

use crate::{
    drivers::{DriverError, DriverTask, ResourceDriver, ResourceStatus, instance_capacity},
    registry::ResourceDriverFactory,
    util::random_name,
};
use async_trait::async_trait;
use fish_models::{
    label::{ApplicationResource, ApplicationTask, LabelDefinition},
    resources::Resources,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::{path::PathBuf, time::Duration};
use tokio::{fs, time};
use tracing::debug;

pub struct Factory;

impl ResourceDriverFactory for Factory {
    fn name(&self) -> &'static str {
        "test"
    }

    fn build(&self) -> Box<dyn ResourceDriver> {
        Box::new(TestDriver::new())
    }
}

/// Failure probability semantics: 0 never fails, 255 always fails,
/// anything else wins a uniform draw over [0, 254).
fn roll(probability: u8) -> bool {
    match probability {
        0 => false,
        255 => true,
        p => rand::thread_rng().gen_range(0..254u8) < p,
    }
}

async fn delay(seconds: f64) {
    if seconds > 0.0 {
        time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub is_remote: bool,

    #[serde(default)]
    pub workspace_path: PathBuf,

    /// Advertised CPU pool; 0 together with `ram_limit` 0 means unlimited.
    #[serde(default)]
    pub cpu_limit: u32,

    #[serde(default)]
    pub ram_limit: u32,

    #[serde(default)]
    pub cpu_overbook: u32,

    #[serde(default)]
    pub ram_overbook: u32,

    #[serde(default)]
    pub fail_validate: u8,

    #[serde(default)]
    pub fail_capacity: u8,

    #[serde(default)]
    pub fail_allocate: u8,

    #[serde(default)]
    pub fail_status: u8,

    #[serde(default)]
    pub fail_deallocate: u8,

    #[serde(default)]
    pub fail_snapshot: u8,

    #[serde(default)]
    pub delay_allocate: f64,

    #[serde(default)]
    pub delay_status: f64,

    #[serde(default)]
    pub delay_deallocate: f64,
}

/// Per-label overrides of the instance-wide failure knobs.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TestOptions {
    #[serde(default)]
    pub fail_validate: Option<u8>,

    #[serde(default)]
    pub fail_capacity: Option<u8>,

    #[serde(default)]
    pub fail_allocate: Option<u8>,

    #[serde(default)]
    pub fail_status: Option<u8>,

    #[serde(default)]
    pub fail_deallocate: Option<u8>,

    #[serde(default)]
    pub fail_snapshot: Option<u8>,

    #[serde(default)]
    pub delay_allocate: Option<f64>,

    #[serde(default)]
    pub delay_status: Option<f64>,

    #[serde(default)]
    pub delay_deallocate: Option<f64>,
}

impl TestOptions {
    fn parse(options: &RawValue) -> Result<Self, String> {
        serde_json::from_str(options.get()).map_err(|e| format!("bad test options: {e}"))
    }
}

pub struct TestDriver {
    name: String,
    cfg: TestConfig,
    prepared: bool,
}

impl TestDriver {
    pub fn new() -> Self {
        Self { name: "test".to_string(), cfg: TestConfig::default(), prepared: false }
    }

    fn marker_path(&self, identifier: &str) -> Result<PathBuf, DriverError> {
        if identifier.contains('/') || identifier.contains('\\') || !identifier.starts_with("test-") {
            return Err(DriverError::Status(format!("{}: malformed identifier '{identifier}'", self.name)));
        }
        Ok(self.cfg.workspace_path.join(identifier))
    }

    fn knobs(&self, def: &LabelDefinition) -> Result<TestConfig, String> {
        let overrides = TestOptions::parse(&def.options)?;
        let mut cfg = self.cfg.clone();
        cfg.fail_validate = overrides.fail_validate.unwrap_or(cfg.fail_validate);
        cfg.fail_capacity = overrides.fail_capacity.unwrap_or(cfg.fail_capacity);
        cfg.fail_allocate = overrides.fail_allocate.unwrap_or(cfg.fail_allocate);
        cfg.fail_status = overrides.fail_status.unwrap_or(cfg.fail_status);
        cfg.fail_deallocate = overrides.fail_deallocate.unwrap_or(cfg.fail_deallocate);
        cfg.fail_snapshot = overrides.fail_snapshot.unwrap_or(cfg.fail_snapshot);
        cfg.delay_allocate = overrides.delay_allocate.unwrap_or(cfg.delay_allocate);
        cfg.delay_status = overrides.delay_status.unwrap_or(cfg.delay_status);
        cfg.delay_deallocate = overrides.delay_deallocate.unwrap_or(cfg.delay_deallocate);
        Ok(cfg)
    }
}

impl Default for TestDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceDriver for TestDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn is_remote(&self) -> bool {
        self.cfg.is_remote
    }

    async fn prepare(&mut self, config: &[u8]) -> Result<(), DriverError> {
        if !config.is_empty() {
            self.cfg = serde_json::from_slice(config)
                .map_err(|e| DriverError::Config(format!("{}: bad config: {e}", self.name)))?;
        }
        if self.cfg.workspace_path.as_os_str().is_empty() {
            self.cfg.workspace_path = std::env::temp_dir().join(format!("fish-test-{}", self.name));
        }
        fs::create_dir_all(&self.cfg.workspace_path)
            .await
            .map_err(|e| DriverError::Config(format!("{}: cannot create workspace: {e}", self.name)))?;
        self.prepared = true;
        Ok(())
    }

    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError> {
        let knobs =
            self.knobs(def).map_err(|e| DriverError::Definition(format!("{}: {e}", self.name)))?;
        if roll(knobs.fail_validate) {
            return Err(DriverError::Definition(format!("{}: injected validate failure", self.name)));
        }
        def.resources
            .validate(&[], true)
            .map_err(|e| DriverError::Definition(format!("{}: {e}", self.name)))
    }

    fn available_capacity(&self, node_usage: &Resources, def: &LabelDefinition) -> i64 {
        if !self.prepared {
            return -1;
        }
        let Ok(knobs) = self.knobs(def) else {
            return -1;
        };
        if roll(knobs.fail_capacity) {
            debug!("{}: injected capacity failure", self.name);
            return -1;
        }
        if self.cfg.cpu_limit == 0 && self.cfg.ram_limit == 0 {
            return i64::MAX;
        }
        instance_capacity(
            self.cfg.cpu_limit,
            self.cfg.ram_limit,
            0,
            0,
            self.cfg.cpu_overbook,
            self.cfg.ram_overbook,
            node_usage,
            &def.resources,
        )
    }

    async fn allocate(
        &self,
        def: &LabelDefinition,
        _metadata: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<ApplicationResource, DriverError> {
        let knobs = self.knobs(def).map_err(|e| DriverError::Allocate(format!("{}: {e}", self.name)))?;
        delay(knobs.delay_allocate).await;
        if roll(knobs.fail_allocate) {
            return Err(DriverError::Allocate(format!("{}: injected allocate failure", self.name)));
        }
        let identifier = random_name("test-", 6);
        let marker = self.cfg.workspace_path.join(&identifier);
        fs::write(&marker, b"")
            .await
            .map_err(|e| DriverError::Allocate(format!("{}: cannot write marker: {e}", self.name)))?;
        debug!("{}: allocated {identifier}", self.name);
        Ok(ApplicationResource::new(identifier))
    }

    async fn status(&self, res: &ApplicationResource) -> Result<ResourceStatus, DriverError> {
        delay(self.cfg.delay_status).await;
        if roll(self.cfg.fail_status) {
            return Err(DriverError::Status(format!("{}: injected status failure", self.name)));
        }
        let marker = self.marker_path(&res.identifier)?;
        let exists = fs::try_exists(&marker)
            .await
            .map_err(|e| DriverError::Status(format!("{}: cannot check marker: {e}", self.name)))?;
        Ok(if exists { ResourceStatus::Allocated } else { ResourceStatus::None })
    }

    async fn deallocate(&self, res: &ApplicationResource) -> Result<(), DriverError> {
        delay(self.cfg.delay_deallocate).await;
        if roll(self.cfg.fail_deallocate) {
            return Err(DriverError::Deallocate(format!("{}: injected deallocate failure", self.name)));
        }
        let marker = self
            .marker_path(&res.identifier)
            .map_err(|e| DriverError::Deallocate(e.to_string()))?;
        fs::remove_file(&marker)
            .await
            .map_err(|e| DriverError::Deallocate(format!("{}: unknown allocation '{}': {e}", self.name, res.identifier)))
    }

    fn task(&self, name: &str, options: &RawValue) -> Option<Box<dyn DriverTask>> {
        match name {
            "snapshot" => {
                let overrides: TestOptions = serde_json::from_str(options.get()).unwrap_or_default();
                Some(Box::new(SnapshotTask {
                    fail: overrides.fail_snapshot.unwrap_or(self.cfg.fail_snapshot),
                    info: None,
                }))
            }
            _ => None,
        }
    }
}

/// A fake snapshot that only reports what it would have snapshotted.
struct SnapshotTask {
    fail: u8,
    info: Option<(ApplicationTask, LabelDefinition, ApplicationResource)>,
}

#[async_trait]
impl DriverTask for SnapshotTask {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn clone_task(&self) -> Box<dyn DriverTask> {
        Box::new(Self { fail: self.fail, info: self.info.clone() })
    }

    fn set_info(&mut self, task: ApplicationTask, def: LabelDefinition, res: ApplicationResource) {
        self.info = Some((task, def, res));
    }

    async fn execute(&self) -> Result<Vec<u8>, DriverError> {
        let Some((task, _, res)) = &self.info else {
            return Err(DriverError::Task("snapshot: no binding, set_info was not called".into()));
        };
        if roll(self.fail) {
            return Err(DriverError::Task(format!("snapshot of {} failed", res.identifier)));
        }
        let body = serde_json::json!({
            "task": task.id,
            "snapshots": [format!("{}-snapshot", res.identifier)],
        });
        serde_json::to_vec(&body).map_err(|e| DriverError::Task(format!("snapshot: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::error_body;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn prepared(config: serde_json::Value) -> (TestDriver, TempDir) {
        let workdir = TempDir::new().expect("no tempdir");
        let mut config = config;
        config["workspace_path"] = serde_json::json!(workdir.path());
        let mut driver = TestDriver::new();
        driver.prepare(&serde_json::to_vec(&config).expect("bad config")).await.expect("prepare failed");
        (driver, workdir)
    }

    fn definition() -> LabelDefinition {
        LabelDefinition::new(Resources { cpu: 1, ram: 1, ..Default::default() })
    }

    #[test]
    fn roll_extremes_are_deterministic() {
        assert!((0..100).all(|_| !roll(0)));
        assert!((0..100).all(|_| roll(255)));
    }

    #[tokio::test]
    async fn unlimited_capacity_when_both_limits_are_zero() {
        let (driver, _workdir) = prepared(serde_json::json!({})).await;
        assert_eq!(driver.available_capacity(&Resources::default(), &definition()), i64::MAX);
    }

    #[tokio::test]
    async fn limited_capacity_counts_instances() {
        let (driver, _workdir) = prepared(serde_json::json!({"cpu_limit": 4, "ram_limit": 8})).await;
        assert_eq!(driver.available_capacity(&Resources::default(), &definition()), 4);
        let used = Resources { cpu: 3, ram: 3, ..Default::default() };
        assert_eq!(driver.available_capacity(&used, &definition()), 1);
    }

    #[tokio::test]
    async fn allocate_lifecycle_roundtrip() {
        let (driver, workdir) = prepared(serde_json::json!({})).await;
        let res = driver.allocate(&definition(), &HashMap::new()).await.expect("allocate failed");
        assert!(res.identifier.starts_with("test-"));
        assert!(workdir.path().join(&res.identifier).exists());
        assert_eq!(driver.status(&res).await.expect("status failed"), ResourceStatus::Allocated);

        driver.deallocate(&res).await.expect("deallocate failed");
        assert!(!workdir.path().join(&res.identifier).exists());
        assert_eq!(driver.status(&res).await.expect("status failed"), ResourceStatus::None);
    }

    #[tokio::test]
    async fn fail_allocate_255_never_creates_a_marker() {
        let (driver, workdir) = prepared(serde_json::json!({"fail_allocate": 255})).await;
        driver.allocate(&definition(), &HashMap::new()).await.expect_err("allocate succeeded");
        let leftovers = std::fs::read_dir(workdir.path()).expect("read_dir failed").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn label_options_override_config_knobs() {
        let (driver, _workdir) = prepared(serde_json::json!({"fail_allocate": 255})).await;
        let options = RawValue::from_string(r#"{"fail_allocate": 0}"#.to_string()).expect("bad literal");
        let def = definition().with_options(options);
        driver.allocate(&def, &HashMap::new()).await.expect("override did not apply");
    }

    #[tokio::test]
    async fn deallocate_of_unknown_identifier_errors() {
        let (driver, _workdir) = prepared(serde_json::json!({})).await;
        let ghost = ApplicationResource::new("test-ghosty");
        driver.deallocate(&ghost).await.expect_err("unknown identifier accepted");
    }

    #[tokio::test]
    async fn snapshot_task_binds_and_reports() {
        let (driver, _workdir) = prepared(serde_json::json!({})).await;
        let options = RawValue::from_string("{}".to_string()).expect("bad literal");
        let prototype = driver.task("snapshot", &options).expect("no snapshot task");
        assert!(driver.task("timewarp", &options).is_none());

        let mut bound = prototype.clone_task();
        bound.set_info(ApplicationTask::new("snapshot"), definition(), ApplicationResource::new("test-abcdef"));
        let payload = bound.execute().await.expect("execute failed");
        let body: serde_json::Value = serde_json::from_slice(&payload).expect("payload is not JSON");
        assert_eq!(body["snapshots"][0], "test-abcdef-snapshot");

        // The unbound prototype still refuses to run.
        let err = prototype.execute().await.expect_err("unbound task ran");
        let body: serde_json::Value = serde_json::from_slice(&error_body(&err)).expect("error body is not JSON");
        assert!(body["error"].as_str().expect("no error string").contains("set_info"));
    }
}
