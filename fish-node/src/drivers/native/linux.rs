//! Linux backend: shadow-utils users, loop-mounted disk images under /mnt,
//! workload launch through sudo + su.

use crate::{
    drivers::native::config::NativeConfig,
    drivers::native::platform::{
        DELETE_RETRIES, DISK_TIMEOUT, Platform, START_PROBE, STOP_GRACE, TOOL_TIMEOUT, argv,
        parse_mount_points, safe_label,
    },
    runner::{CmdError, CmdOutput, CommandInput, CommandRunner, run_retry},
    util::shell_escape,
};
use anyhow::Context;
use async_trait::async_trait;
use fish_models::resources::ResourceDisk;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, time};
use tracing::{debug, warn};

pub(crate) struct LinuxPlatform {
    cfg: Arc<NativeConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl LinuxPlatform {
    pub(crate) fn new(cfg: Arc<NativeConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cfg, runner }
    }

    async fn sudo(&self, args: Vec<String>) -> Result<CmdOutput, CmdError> {
        let mut full = vec!["-n".to_string()];
        full.extend(args);
        self.runner.run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sudo_path, &full).await
    }

    async fn sh(&self, script: &str) -> Result<CmdOutput, CmdError> {
        self.runner.run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sh_path, &argv(["-c", script])).await
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn allowed_disk_types(&self) -> &'static [&'static str] {
        &["dir", "ext4", "xfs"]
    }

    fn user_home(&self, user: &str) -> PathBuf {
        PathBuf::from(format!("/home/{user}"))
    }

    fn env_line(&self, key: &str, value: &str) -> String {
        format!("export {key}={}\n", shell_escape(value))
    }

    async fn existing_user_ids(&self) -> anyhow::Result<Vec<u32>> {
        // getent respects NSS, so users from LDAP and friends count too.
        let output = self.sh("getent passwd | cut -d: -f3").await.context("failed to list user ids")?;
        Ok(output.stdout.lines().filter_map(|line| line.trim().parse().ok()).collect())
    }

    async fn user_create(&self, user: &str, uid: u32, groups: &[String]) -> anyhow::Result<()> {
        let mut args = argv(["useradd", "-m", "-s", "/bin/sh", "-u", &uid.to_string()]);
        if let Some(primary) = groups.first() {
            args.extend(argv(["-g", primary]));
        }
        if groups.len() > 1 {
            args.extend(argv(["-G", &groups[1..].join(",")]));
        }
        args.push(user.to_string());
        self.sudo(args).await.with_context(|| format!("failed to create user {user}"))?;
        Ok(())
    }

    async fn user_delete(&self, user: &str) -> anyhow::Result<()> {
        let args = argv(["-n", "userdel", "-r", user]);
        let result = run_retry(
            self.runner.as_ref(),
            DELETE_RETRIES,
            TOOL_TIMEOUT,
            CommandInput::None,
            &self.cfg.sudo_path,
            &args,
        )
        .await;
        if let Err(e) = result {
            if e.to_string().contains("does not exist") {
                debug!("User {user} is already gone");
            } else {
                return Err(e).context("failed to delete user");
            }
        }

        let home = self.user_home(user).display().to_string();
        let rm = self.cfg.rm_path.display().to_string();
        self.sudo(argv([&rm, "-rf", &home])).await.context("failed to remove home directory")?;
        Ok(())
    }

    async fn user_exec(&self, user: &str, command: &str) -> anyhow::Result<String> {
        let args = argv(["-n", &self.cfg.su_path.display().to_string(), "-l", user, "-c", command]);
        let output = self
            .runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sudo_path, &args)
            .await
            .with_context(|| format!("failed to run command as {user}"))?;
        Ok(output.stdout)
    }

    async fn user_run(&self, user: &str, env_file: &Path, entry: &str) -> anyhow::Result<()> {
        let script = format!(". {}; {entry}", shell_escape(&env_file.display().to_string()));
        let args = argv(["-n", &self.cfg.su_path.display().to_string(), "-l", user, "-c", &script]);
        self.runner
            .start(START_PROBE, &self.cfg.sudo_path, &args)
            .await
            .context("entry process died right after start")?;
        Ok(())
    }

    async fn user_stop(&self, user: &str) -> anyhow::Result<()> {
        let killall = self.cfg.killall_path.display().to_string();
        if let Err(e) = self.sudo(argv([&killall, "-INT", "-u", user])).await {
            debug!("INT delivery to {user} processes: {e}");
        }
        time::sleep(STOP_GRACE).await;
        if let Err(e) = self.sudo(argv([&killall, "-KILL", "-u", user])).await {
            debug!("KILL delivery to {user} processes: {e}");
        }
        Ok(())
    }

    async fn home_exists(&self, user: &str) -> anyhow::Result<bool> {
        let home = self.user_home(user).display().to_string();
        match self.sh(&format!("test -d {}", shell_escape(&home))).await {
            Ok(_) => Ok(true),
            Err(CmdError::Failed { .. }) => Ok(false),
            Err(e) => Err(e).context("failed to check home directory"),
        }
    }

    async fn disk_create(&self, user: &str, name: &str, disk: &ResourceDisk) -> anyhow::Result<PathBuf> {
        if disk.disk_type == "dir" {
            let dir = self.cfg.workspace_path.join(user).join(name);
            fs::create_dir_all(&dir).await.context("failed to create disk directory")?;
            self.chown_tree(user, &dir).await?;
            return Ok(dir);
        }

        let label = safe_label(&disk.label, name);
        let image = if disk.reuse {
            self.cfg.workspace_path.join("disks").join(format!("{label}-{name}.img"))
        } else {
            self.cfg.workspace_path.join(user).join(format!("{name}.img"))
        };
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent).await.context("failed to create disk parent directory")?;
        }

        let image_str = image.display().to_string();
        if fs::try_exists(&image).await? {
            debug!("Reusing disk image {image_str}");
        } else if !disk.clone.is_empty() {
            let source = self.cfg.workspace_path.join("disks").join(format!("{}.img", disk.clone));
            fs::copy(&source, &image)
                .await
                .with_context(|| format!("failed to clone disk from {}", source.display()))?;
        } else {
            let fs_type = match disk.disk_type.as_str() {
                "xfs" => "xfs",
                _ => "ext4",
            };
            self.sh(&format!("truncate -s {}G {}", disk.size, shell_escape(&image_str)))
                .await
                .with_context(|| format!("failed to create backing file for '{name}'"))?;
            self.sudo(argv([&format!("mkfs.{fs_type}"), "-L", &label, &image_str]))
                .await
                .with_context(|| format!("failed to format disk '{name}'"))?;
        }

        let mount_point = PathBuf::from(format!("/mnt/{user}_{name}"));
        let mount_str = mount_point.display().to_string();
        self.sudo(argv(["mkdir", "-p", &mount_str])).await.context("failed to create mount point")?;
        let mount = self.cfg.mount_path.display().to_string();
        self.runner
            .run(
                DISK_TIMEOUT,
                CommandInput::None,
                &self.cfg.sudo_path,
                &argv(["-n", &mount, "-o", "loop", &image_str, &mount_str]),
            )
            .await
            .with_context(|| format!("failed to mount disk '{name}'"))?;
        self.chown_tree(user, &mount_point).await?;
        Ok(mount_point)
    }

    async fn disks_delete(&self, user: &str) -> anyhow::Result<()> {
        let output = self
            .runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.mount_path, &[])
            .await
            .context("failed to read mount table")?;
        let prefix = format!("/mnt/{user}_");
        let rm = self.cfg.rm_path.display().to_string();
        for mount_point in parse_mount_points(&output.stdout) {
            if !mount_point.starts_with(&prefix) {
                continue;
            }
            if let Err(e) = self.sudo(argv(["umount", &mount_point])).await {
                warn!("Failed to unmount {mount_point}: {e}");
                continue;
            }
            if let Err(e) = self.sudo(argv([&rm, "-rf", &mount_point])).await {
                warn!("Failed to remove mount point {mount_point}: {e}");
            }
        }

        match fs::remove_dir_all(self.cfg.workspace_path.join(user)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove workspace"),
        }
    }

    async fn chown_tree(&self, user: &str, path: &Path) -> anyhow::Result<()> {
        let chown = self.cfg.chown_path.display().to_string();
        self.sudo(argv([&chown, "-R", &format!("{user}:"), &path.display().to_string()]))
            .await
            .with_context(|| format!("failed to chown {} to {user}", path.display()))?;
        Ok(())
    }

    async fn grant_read(&self, user: &str, path: &Path) -> anyhow::Result<()> {
        self.sh(&format!("setfacl -m u:{user}:r {}", shell_escape(&path.display().to_string())))
            .await
            .with_context(|| format!("failed to grant {user} read on {}", path.display()))?;
        Ok(())
    }
}
