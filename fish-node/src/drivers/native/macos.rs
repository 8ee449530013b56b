//! macOS backend: Directory Service users, sparse disk images attached
//! under /Volumes, workload launch through sudo + su.

use crate::{
    drivers::native::config::NativeConfig,
    drivers::native::platform::{
        DELETE_RETRIES, DISK_TIMEOUT, Platform, START_PROBE, STOP_GRACE, TOOL_TIMEOUT, argv, safe_label,
    },
    runner::{CommandInput, CommandRunner, run_retry},
    util::shell_escape,
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use fish_models::resources::ResourceDisk;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, time};
use tracing::{debug, warn};

pub(crate) struct MacosPlatform {
    cfg: Arc<NativeConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl MacosPlatform {
    pub(crate) fn new(cfg: Arc<NativeConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cfg, runner }
    }

    async fn sudo(&self, args: Vec<String>) -> Result<crate::runner::CmdOutput, crate::runner::CmdError> {
        let mut full = vec!["-n".to_string()];
        full.extend(args);
        self.runner.run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sudo_path, &full).await
    }

    async fn dscl(&self, args: &[&str]) -> anyhow::Result<()> {
        let mut full = vec![self.cfg.dscl_path.display().to_string(), ".".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.sudo(full).await.with_context(|| format!("dscl {args:?} failed"))?;
        Ok(())
    }

    async fn primary_group_id(&self, groups: &[String]) -> anyhow::Result<String> {
        match groups.first() {
            Some(group) => {
                let args = argv([".", "-read", &format!("/Groups/{group}"), "PrimaryGroupID"]);
                let output = self
                    .runner
                    .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.dscl_path, &args)
                    .await
                    .with_context(|| format!("failed to read group '{group}'"))?;
                parse_group_id(&output.stdout)
                    .with_context(|| format!("no PrimaryGroupID in dscl output for '{group}'"))
            }
            None => {
                // Default to the node process's own group.
                let args = argv(["-c", "id -g"]);
                let output = self
                    .runner
                    .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sh_path, &args)
                    .await
                    .context("failed to read current group id")?;
                Ok(output.stdout.trim().to_string())
            }
        }
    }
}

#[async_trait]
impl Platform for MacosPlatform {
    fn allowed_disk_types(&self) -> &'static [&'static str] {
        &["dir", "hfs+", "exfat", "fat32"]
    }

    fn user_home(&self, user: &str) -> PathBuf {
        PathBuf::from(format!("/Users/{user}"))
    }

    fn env_line(&self, key: &str, value: &str) -> String {
        format!("export {key}={}\n", shell_escape(value))
    }

    async fn existing_user_ids(&self) -> anyhow::Result<Vec<u32>> {
        let args = argv([".", "-list", "/Users", "UniqueID"]);
        let output = self
            .runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.dscl_path, &args)
            .await
            .context("failed to list user ids")?;
        Ok(parse_user_ids(&output.stdout))
    }

    async fn user_create(&self, user: &str, uid: u32, groups: &[String]) -> anyhow::Result<()> {
        let record = format!("/Users/{user}");
        let home = self.user_home(user).display().to_string();
        let gid = self.primary_group_id(groups).await?;

        self.dscl(&["-create", &record]).await?;
        self.dscl(&["-create", &record, "RealName", user]).await?;
        self.dscl(&["-create", &record, "UserShell", "/bin/sh"]).await?;
        self.dscl(&["-create", &record, "UniqueID", &uid.to_string()]).await?;
        self.dscl(&["-create", &record, "PrimaryGroupID", &gid]).await?;
        self.dscl(&["-create", &record, "NFSHomeDirectory", &home]).await?;
        for group in groups.iter().skip(1) {
            self.dscl(&["-append", &format!("/Groups/{group}"), "GroupMembership", user]).await?;
        }

        let args = argv([&self.cfg.createhomedir_path.display().to_string(), "-c", "-u", user]);
        self.sudo(args).await.context("createhomedir failed")?;
        Ok(())
    }

    async fn user_delete(&self, user: &str) -> anyhow::Result<()> {
        // The directory service occasionally refuses deletes of a user that
        // just had processes, hence the retries.
        let args = argv(["-n", &self.cfg.dscl_path.display().to_string(), ".", "-delete", &format!("/Users/{user}")]);
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
            if e.to_string().contains("eDSRecordNotFound") {
                debug!("User {user} is already gone");
            } else {
                return Err(e).context("failed to delete user record");
            }
        }

        let home = self.user_home(user).display().to_string();
        let args = argv(["-n", &self.cfg.rm_path.display().to_string(), "-rf", &home]);
        self.runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sudo_path, &args)
            .await
            .context("failed to remove home directory")?;
        Ok(())
    }

    async fn user_exec(&self, user: &str, command: &str) -> anyhow::Result<String> {
        let args =
            argv(["-n", &self.cfg.su_path.display().to_string(), "-l", user, "-c", command]);
        let output = self
            .runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sudo_path, &args)
            .await
            .with_context(|| format!("failed to run command as {user}"))?;
        Ok(output.stdout)
    }

    async fn user_run(&self, user: &str, env_file: &Path, entry: &str) -> anyhow::Result<()> {
        let script = format!("source {}; {entry}", shell_escape(&env_file.display().to_string()));
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
        let args = argv(["-c", &format!("test -d {}", shell_escape(&home))]);
        match self.runner.run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.sh_path, &args).await {
            Ok(_) => Ok(true),
            Err(crate::runner::CmdError::Failed { .. }) => Ok(false),
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
            self.cfg.workspace_path.join("disks").join(format!("{label}-{name}.sparseimage"))
        } else {
            self.cfg.workspace_path.join(user).join(format!("{name}.sparseimage"))
        };
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent).await.context("failed to create disk parent directory")?;
        }

        if fs::try_exists(&image).await? {
            debug!("Reusing disk image {}", image.display());
        } else if !disk.clone.is_empty() {
            let source = self.cfg.workspace_path.join("disks").join(format!("{}.sparseimage", disk.clone));
            fs::copy(&source, &image)
                .await
                .with_context(|| format!("failed to clone disk from {}", source.display()))?;
        } else {
            let fs_type = match disk.disk_type.as_str() {
                "exfat" => "ExFAT",
                "fat32" => "FAT32",
                _ => "HFS+",
            };
            let args = argv([
                "create",
                "-size",
                &format!("{}g", disk.size),
                "-fs",
                fs_type,
                "-type",
                "SPARSE",
                "-volname",
                &label,
                &image.display().to_string(),
            ]);
            self.runner
                .run(DISK_TIMEOUT, CommandInput::None, &self.cfg.hdiutil_path, &args)
                .await
                .with_context(|| format!("failed to create disk image for '{name}'"))?;
        }

        let mount_point = PathBuf::from(format!("/Volumes/{user}_{name}"));
        let args = argv([
            "attach",
            &image.display().to_string(),
            "-owners",
            "on",
            "-mountpoint",
            &mount_point.display().to_string(),
        ]);
        self.runner
            .run(DISK_TIMEOUT, CommandInput::None, &self.cfg.hdiutil_path, &args)
            .await
            .with_context(|| format!("failed to attach disk '{name}'"))?;
        self.chown_tree(user, &mount_point).await?;

        // Indexing a scratch volume only burns cycles.
        let mdutil = self.cfg.mdutil_path.display().to_string();
        if let Err(e) = self.sudo(argv([&mdutil, "-i", "off", &mount_point.display().to_string()])).await {
            debug!("Failed to disable indexing on {}: {e}", mount_point.display());
        }
        Ok(mount_point)
    }

    async fn disks_delete(&self, user: &str) -> anyhow::Result<()> {
        let output = self
            .runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.mount_path, &[])
            .await
            .context("failed to read mount table")?;
        let prefix = format!("/Volumes/{user}_");
        for mount_point in super::platform::parse_mount_points(&output.stdout) {
            if !mount_point.starts_with(&prefix) {
                continue;
            }
            let args = argv(["detach", &mount_point]);
            if let Err(e) = self.runner.run(DISK_TIMEOUT, CommandInput::None, &self.cfg.hdiutil_path, &args).await
            {
                warn!("Failed to detach {mount_point}: {e}");
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
        let args = argv(["+a", &format!("{user} allow read"), &path.display().to_string()]);
        self.runner
            .run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.chmod_path, &args)
            .await
            .with_context(|| format!("failed to grant {user} read on {}", path.display()))?;
        Ok(())
    }
}

fn parse_user_ids(dscl_output: &str) -> Vec<u32> {
    dscl_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|id| id.parse().ok())
        .collect()
}

fn parse_group_id(dscl_output: &str) -> anyhow::Result<String> {
    for line in dscl_output.lines() {
        if let Some(id) = line.strip_prefix("PrimaryGroupID:") {
            return Ok(id.trim().to_string());
        }
    }
    bail!("no PrimaryGroupID line")
}
