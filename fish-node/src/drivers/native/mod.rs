//! The native resource driver: environments are ephemeral unprivileged OS
//! users on the host itself, with layered images unpacked into their home
//! and attached disks.

mod config;
mod linux;
mod macos;
mod options;
mod platform;
mod windows;

pub use config::NativeConfig;
pub use options::NativeOptions;

use crate::{
    drivers::{DriverError, DriverTask, ResourceDriver, ResourceStatus, instance_capacity},
    images::{TarInvocation, load_images},
    registry::ResourceDriverFactory,
    runner::{CommandRunner, TokioCommandRunner},
    util::random_name,
};
use anyhow::Context;
use async_trait::async_trait;
use fish_models::{
    label::{ApplicationResource, LabelDefinition},
    resources::Resources,
};
use metrics::counter;
use options::render_entry;
use platform::{Platform, platform_for};
use serde_json::value::RawValue;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};
use sysinfo::System;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

/// Serializes the uid-selection + user-creation window across concurrent
/// allocations; two allocations picking the same uid would corrupt the
/// second user.
static USER_CREATE_LOCK: Mutex<()> = Mutex::const_new(());

pub struct Factory;

impl ResourceDriverFactory for Factory {
    fn name(&self) -> &'static str {
        "native"
    }

    fn build(&self) -> Box<dyn ResourceDriver> {
        Box::new(NativeDriver::new())
    }
}

pub struct NativeDriver {
    name: String,
    os: String,
    runner: Arc<dyn CommandRunner>,
    cfg: Arc<NativeConfig>,
    platform: Option<Arc<dyn Platform>>,
    total_cpu: u32,
    total_ram: u32,
    probe_host: bool,
    leases: Mutex<HashSet<String>>,
}

impl NativeDriver {
    pub fn new() -> Self {
        Self {
            name: "native".to_string(),
            os: std::env::consts::OS.to_string(),
            runner: Arc::new(TokioCommandRunner),
            cfg: Arc::new(NativeConfig::default()),
            platform: None,
            total_cpu: 0,
            total_ram: 0,
            probe_host: true,
            leases: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(os: &str, runner: Arc<dyn CommandRunner>, total_cpu: u32, total_ram: u32) -> Self {
        Self {
            name: "native".to_string(),
            os: os.to_string(),
            runner,
            cfg: Arc::new(NativeConfig::default()),
            platform: None,
            total_cpu,
            total_ram,
            probe_host: false,
            leases: Mutex::new(HashSet::new()),
        }
    }

    fn platform(&self) -> Result<Arc<dyn Platform>, DriverError> {
        self.platform
            .clone()
            .ok_or_else(|| DriverError::Unavailable(format!("{}: driver is not prepared", self.name)))
    }

    fn valid_identifier(&self, id: &str) -> bool {
        if self.cfg.users.iter().any(|u| u == id) {
            return true;
        }
        id.len() == 11 && id.starts_with("fish-") && id.as_bytes()[5..].iter().all(u8::is_ascii_lowercase)
    }

    fn env_file_path(&self, user: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{user}.env"))
    }

    async fn next_uid(&self, platform: &dyn Platform) -> anyhow::Result<u32> {
        let ids = platform.existing_user_ids().await?;
        Ok(ids.into_iter().max().unwrap_or(1000).max(1000) + 1)
    }

    /// Leases an identifier: a pool user when a pool is configured, a fresh
    /// ephemeral name otherwise.
    async fn lease_user(&self) -> Result<(String, bool), DriverError> {
        if self.cfg.users.is_empty() {
            return Ok((random_name("fish-", 6), true));
        }
        let mut leases = self.leases.lock().await;
        for user in &self.cfg.users {
            if !leases.contains(user) {
                leases.insert(user.clone());
                return Ok((user.clone(), false));
            }
        }
        Err(DriverError::Allocate(format!("{}: no free pool users", self.name)))
    }

    async fn release_user(&self, user: &str) {
        self.leases.lock().await.remove(user);
    }

    /// Detects a sudoers misconfiguration before the driver accepts work:
    /// creates a throwaway user, runs a trivial script as it, deletes it.
    async fn sudoers_roundtrip(&self, platform: &Arc<dyn Platform>) -> Result<(), DriverError> {
        let user = random_name("fish-", 6);
        debug!("Checking sudoers rules with throwaway user {user}");
        {
            let _guard = USER_CREATE_LOCK.lock().await;
            let uid = self
                .next_uid(platform.as_ref())
                .await
                .map_err(|e| DriverError::Config(format!("{}: cannot pick a uid: {e:#}", self.name)))?;
            platform
                .user_create(&user, uid, &[])
                .await
                .map_err(|e| DriverError::Config(format!("{}: cannot create users: {e:#}", self.name)))?;
        }
        let exec = platform.user_exec(&user, "echo fish-ok").await;
        if let Err(e) = platform.user_delete(&user).await {
            warn!("Failed to delete throwaway user {user}: {e:#}");
        }
        match exec {
            Ok(output) if output.contains("fish-ok") => Ok(()),
            Ok(output) => Err(DriverError::Config(format!(
                "{}: unexpected output from a script run as {user}: '{}'",
                self.name,
                output.trim()
            ))),
            Err(e) => Err(DriverError::Config(format!("{}: cannot run scripts as created users: {e:#}", self.name))),
        }
    }

    async fn allocate_inner(
        &self,
        platform: &dyn Platform,
        user: &str,
        ephemeral: bool,
        options: &NativeOptions,
        def: &LabelDefinition,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<ApplicationResource> {
        if ephemeral {
            let _guard = USER_CREATE_LOCK.lock().await;
            let uid = self.next_uid(platform).await?;
            platform.user_create(user, uid, &options.groups).await.context("failed to create user")?;
        }

        let mut disk_paths = HashMap::new();
        for (name, disk) in &def.resources.disks {
            let path = platform
                .disk_create(user, name, disk)
                .await
                .with_context(|| format!("failed to create disk '{name}'"))?;
            disk_paths.insert(name.clone(), path);
        }
        // The empty tag is the default unpack target: the user's home.
        disk_paths.insert(String::new(), platform.user_home(user));

        if !options.images.is_empty() {
            let cfg = &self.cfg;
            let tar = TarInvocation {
                tar: cfg.tar_path.clone(),
                escalate: Some((cfg.sudo_path.clone(), vec!["-n".to_string()])),
            };
            let download_user = (!cfg.download_user.is_empty()).then_some(cfg.download_user.as_str());
            let download_password =
                (!cfg.download_password.is_empty()).then_some(cfg.download_password.as_str());
            load_images(
                self.runner.as_ref(),
                &tar,
                &options.images,
                &cfg.images_path,
                &disk_paths,
                download_user,
                download_password,
            )
            .await
            .context("failed to load images")?;
            for path in disk_paths.values() {
                platform
                    .chown_tree(user, path)
                    .await
                    .with_context(|| format!("failed to hand {} to the user", path.display()))?;
            }
        }

        let env_path = self.env_file_path(user);
        let mut content = String::new();
        let mut keys: Vec<_> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            let value = match &metadata[key] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            content.push_str(&platform.env_line(key, &value));
        }
        fs::write(&env_path, content).await.context("failed to write metadata file")?;
        platform.grant_read(user, &env_path).await.context("failed to share metadata file")?;

        let entry = render_entry(&options.entry_for(&self.os), &disk_paths).map_err(anyhow::Error::msg)?;
        platform.user_run(user, &env_path, &entry).await?;

        Ok(ApplicationResource {
            identifier: user.to_string(),
            ip_addr: None,
            authentication: def.authentication.clone(),
        })
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceDriver for NativeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn prepare(&mut self, config: &[u8]) -> Result<(), DriverError> {
        let mut cfg = NativeConfig::apply(config)
            .map_err(|e| DriverError::Config(format!("{}: {e}", self.name)))?;
        cfg.validate(&self.os).map_err(|e| DriverError::Config(format!("{}: {e}", self.name)))?;
        fs::create_dir_all(&cfg.images_path)
            .await
            .map_err(|e| DriverError::Config(format!("{}: cannot create images path: {e}", self.name)))?;
        fs::create_dir_all(&cfg.workspace_path)
            .await
            .map_err(|e| DriverError::Config(format!("{}: cannot create workspace path: {e}", self.name)))?;

        if self.probe_host {
            let sys = System::new_all();
            self.total_cpu = sys.cpus().len() as u32;
            self.total_ram = (sys.total_memory() / (1024 * 1024 * 1024)) as u32;
        }
        if self.total_cpu == 0 || self.total_ram == 0 {
            return Err(DriverError::Config(format!("{}: cannot determine host resources", self.name)));
        }

        let cfg = Arc::new(cfg);
        let platform = platform_for(&self.os, cfg.clone(), self.runner.clone())
            .map_err(|e| DriverError::Config(format!("{}: {e}", self.name)))?;
        self.cfg = cfg;
        if self.os == "macos" {
            self.sudoers_roundtrip(&platform).await?;
        }
        self.platform = Some(platform);
        info!(
            "Native driver {} ready: {} cpu, {} GB ram, workspace {}",
            self.name,
            self.total_cpu,
            self.total_ram,
            self.cfg.workspace_path.display()
        );
        Ok(())
    }

    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError> {
        let platform = self.platform()?;
        def.resources
            .validate(platform.allowed_disk_types(), false)
            .map_err(|e| DriverError::Definition(format!("{}: {e}", self.name)))?;
        let options = NativeOptions::parse(&def.options)
            .map_err(|e| DriverError::Definition(format!("{}: {e}", self.name)))?;
        options.validate(&def.resources).map_err(|e| DriverError::Definition(format!("{}: {e}", self.name)))
    }

    fn available_capacity(&self, node_usage: &Resources, def: &LabelDefinition) -> i64 {
        if self.platform.is_none() {
            return -1;
        }
        instance_capacity(
            self.total_cpu,
            self.total_ram,
            self.cfg.cpu_alter,
            self.cfg.ram_alter,
            self.cfg.cpu_overbook,
            self.cfg.ram_overbook,
            node_usage,
            &def.resources,
        )
    }

    async fn allocate(
        &self,
        def: &LabelDefinition,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<ApplicationResource, DriverError> {
        let platform = self.platform()?;
        let options =
            NativeOptions::parse(&def.options).map_err(|e| DriverError::Allocate(format!("{}: {e}", self.name)))?;
        options.validate(&def.resources).map_err(|e| DriverError::Allocate(format!("{}: {e}", self.name)))?;

        let (user, ephemeral) = self.lease_user().await?;
        info!("Allocating environment {user}");
        match self.allocate_inner(platform.as_ref(), &user, ephemeral, &options, def, metadata).await {
            Ok(res) => {
                counter!("fish_allocations_total", "driver" => "native").increment(1);
                info!("Environment {user} is up");
                Ok(res)
            }
            Err(e) => {
                warn!("Allocation of {user} failed, rolling back: {e:#}");
                if let Err(te) = platform.disks_delete(&user).await {
                    warn!("Rollback of {user} disks failed: {te:#}");
                }
                if ephemeral {
                    if let Err(te) = platform.user_delete(&user).await {
                        warn!("Rollback of user {user} failed: {te:#}");
                    }
                } else {
                    self.release_user(&user).await;
                }
                counter!("fish_allocation_failures_total", "driver" => "native").increment(1);
                Err(DriverError::Allocate(format!("{}: {e:#}", self.name)))
            }
        }
    }

    async fn status(&self, res: &ApplicationResource) -> Result<ResourceStatus, DriverError> {
        let platform = self.platform()?;
        if !self.valid_identifier(&res.identifier) {
            return Err(DriverError::Status(format!("{}: malformed identifier '{}'", self.name, res.identifier)));
        }
        match platform.home_exists(&res.identifier).await {
            Ok(true) => Ok(ResourceStatus::Allocated),
            Ok(false) => Ok(ResourceStatus::None),
            Err(e) => Err(DriverError::Status(format!("{}: {e:#}", self.name))),
        }
    }

    async fn deallocate(&self, res: &ApplicationResource) -> Result<(), DriverError> {
        let platform = self.platform()?;
        let user = &res.identifier;
        if !self.valid_identifier(user) {
            return Err(DriverError::Deallocate(format!("{}: malformed identifier '{user}'", self.name)));
        }

        // Cleanup runs every step even when earlier ones fail; the combined
        // error is reported at the end.
        info!("Deallocating environment {user}");
        let mut failures = Vec::new();
        if let Err(e) = platform.user_stop(user).await {
            warn!("Failed to stop {user} processes: {e:#}");
            failures.push(format!("stop: {e:#}"));
        }
        if let Err(e) = platform.disks_delete(user).await {
            warn!("Failed to remove {user} disks: {e:#}");
            failures.push(format!("disks: {e:#}"));
        }
        let ephemeral = !self.cfg.users.iter().any(|u| u == user);
        if ephemeral {
            if let Err(e) = platform.user_delete(user).await {
                warn!("Failed to delete user {user}: {e:#}");
                failures.push(format!("user: {e:#}"));
            }
        } else {
            self.release_user(user).await;
        }
        if let Err(e) = fs::remove_file(self.env_file_path(user)).await {
            debug!("Metadata file of {user} was already gone: {e}");
        }

        if failures.is_empty() {
            counter!("fish_deallocations_total", "driver" => "native").increment(1);
            Ok(())
        } else {
            Err(DriverError::Deallocate(format!("{}: {}", self.name, failures.join("; "))))
        }
    }

    fn task(&self, _name: &str, _options: &RawValue) -> Option<Box<dyn DriverTask>> {
        None
    }
}
