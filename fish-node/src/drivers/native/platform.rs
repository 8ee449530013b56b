//! Per-OS backends behind the native driver front-end. Every host
//! interaction goes through the command runner so a whole platform can
//! dry-run against a mock.

use crate::{
    drivers::native::config::NativeConfig,
    drivers::native::{linux::LinuxPlatform, macos::MacosPlatform, windows::WindowsPlatform},
    runner::CommandRunner,
};
use async_trait::async_trait;
use fish_models::resources::ResourceDisk;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub(crate) const TOOL_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DISK_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);
pub(crate) const START_PROBE: Duration = Duration::from_secs(1);
pub(crate) const DELETE_RETRIES: u32 = 5;

#[async_trait]
pub(crate) trait Platform: Send + Sync {
    /// Disk backends this platform can provide.
    fn allowed_disk_types(&self) -> &'static [&'static str];

    /// Home directory of an environment user.
    fn user_home(&self, user: &str) -> PathBuf;

    /// One environment line for the metadata file sourced before the entry.
    fn env_line(&self, key: &str, value: &str) -> String;

    /// Numeric user ids already present on the host.
    async fn existing_user_ids(&self) -> anyhow::Result<Vec<u32>>;

    /// Creates `user` with the given uid and groups (primary first) and a
    /// populated home directory.
    async fn user_create(&self, user: &str, uid: u32, groups: &[String]) -> anyhow::Result<()>;

    /// Removes `user` and its home. Tolerates a partially created user.
    async fn user_delete(&self, user: &str) -> anyhow::Result<()>;

    /// Runs a short command as `user`, returning its stdout.
    async fn user_exec(&self, user: &str, command: &str) -> anyhow::Result<String>;

    /// Launches the entry command as `user` after sourcing `env_file`,
    /// failing when the process dies within the probe window.
    async fn user_run(&self, user: &str, env_file: &Path, entry: &str) -> anyhow::Result<()>;

    /// Interrupts all of `user`'s processes, escalating to KILL after the
    /// grace period.
    async fn user_stop(&self, user: &str) -> anyhow::Result<()>;

    async fn home_exists(&self, user: &str) -> anyhow::Result<bool>;

    /// Creates or reuses the backing store for one disk and returns the
    /// path the environment sees it under.
    async fn disk_create(&self, user: &str, name: &str, disk: &ResourceDisk) -> anyhow::Result<PathBuf>;

    /// Detaches and removes every volume and workspace artifact of `user`.
    async fn disks_delete(&self, user: &str) -> anyhow::Result<()>;

    /// Hands the whole tree under `path` to `user`.
    async fn chown_tree(&self, user: &str, path: &Path) -> anyhow::Result<()>;

    /// Makes `path` readable to `user` via an ACL grant, without widening
    /// the file mode.
    async fn grant_read(&self, user: &str, path: &Path) -> anyhow::Result<()>;
}

pub(crate) fn platform_for(
    os: &str,
    cfg: Arc<NativeConfig>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Platform>, String> {
    match os {
        "macos" => Ok(Arc::new(MacosPlatform::new(cfg, runner))),
        "linux" => Ok(Arc::new(LinuxPlatform::new(cfg, runner))),
        "windows" => Ok(Arc::new(WindowsPlatform::new(cfg, runner))),
        other => Err(format!("unsupported host OS '{other}'")),
    }
}

/// Strips path separators out of a volume label before it lands in a
/// mount command.
pub(crate) fn safe_label(label: &str, fallback: &str) -> String {
    let label = if label.is_empty() { fallback } else { label };
    label.replace(['/', '\\'], "_")
}

pub(crate) fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Extracts mount points from the `mount` tool's output; both the BSD
/// (`dev on /point (fs, flags)`) and Linux (`dev on /point type fs`)
/// shapes are handled.
pub(crate) fn parse_mount_points(mount_output: &str) -> Vec<String> {
    mount_output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once(" on ")?;
            let point = rest.split(" type ").next().unwrap_or(rest);
            let point = point.split(" (").next().unwrap_or(point);
            Some(point.trim().to_string())
        })
        .collect()
}
