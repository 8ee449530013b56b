//! Windows backend: local users driven through PowerShell, directory-backed
//! disks only. The created user gets a one-off password kept in memory for
//! the lifetime of the allocation, since launching a process as another
//! user needs a credential object.

use crate::{
    drivers::native::config::NativeConfig,
    drivers::native::platform::{DELETE_RETRIES, Platform, START_PROBE, STOP_GRACE, TOOL_TIMEOUT, argv},
    runner::{CmdError, CmdOutput, CommandInput, CommandRunner, run_retry},
    util::random_name,
};
use anyhow::Context;
use async_trait::async_trait;
use fish_models::resources::ResourceDisk;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::Mutex, time};
use tracing::debug;

pub(crate) struct WindowsPlatform {
    cfg: Arc<NativeConfig>,
    runner: Arc<dyn CommandRunner>,
    passwords: Mutex<HashMap<String, String>>,
}

impl WindowsPlatform {
    pub(crate) fn new(cfg: Arc<NativeConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cfg, runner, passwords: Mutex::new(HashMap::new()) }
    }

    async fn powershell(&self, script: &str) -> Result<CmdOutput, CmdError> {
        let args = argv(["-NoProfile", "-NonInteractive", "-Command", script]);
        self.runner.run(TOOL_TIMEOUT, CommandInput::None, &self.cfg.powershell_path, &args).await
    }

    fn credential_expr(user: &str, password: &str) -> String {
        format!(
            "New-Object System.Management.Automation.PSCredential('{user}', \
             (ConvertTo-SecureString '{password}' -AsPlainText -Force))"
        )
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn allowed_disk_types(&self) -> &'static [&'static str] {
        &["dir"]
    }

    fn user_home(&self, user: &str) -> PathBuf {
        PathBuf::from(format!(r"C:\Users\{user}"))
    }

    fn env_line(&self, key: &str, value: &str) -> String {
        format!("$env:{key} = '{}'\n", value.replace('\'', "''"))
    }

    async fn existing_user_ids(&self) -> anyhow::Result<Vec<u32>> {
        // Local accounts have no numeric uid to collide on.
        Ok(Vec::new())
    }

    async fn user_create(&self, user: &str, _uid: u32, groups: &[String]) -> anyhow::Result<()> {
        let password = random_name("", 24);
        let script = format!(
            "New-LocalUser -Name '{user}' -Password (ConvertTo-SecureString '{password}' \
             -AsPlainText -Force) -AccountNeverExpires | Out-Null"
        );
        self.powershell(&script).await.with_context(|| format!("failed to create user {user}"))?;
        for group in groups {
            let script = format!("Add-LocalGroupMember -Group '{group}' -Member '{user}'");
            self.powershell(&script).await.with_context(|| format!("failed to add {user} to {group}"))?;
        }
        let home = self.user_home(user).display().to_string();
        self.powershell(&format!("New-Item -ItemType Directory -Force -Path '{home}' | Out-Null"))
            .await
            .context("failed to create home directory")?;
        self.passwords.lock().await.insert(user.to_string(), password);
        Ok(())
    }

    async fn user_delete(&self, user: &str) -> anyhow::Result<()> {
        let script = format!("Remove-LocalUser -Name '{user}'");
        let args = argv(["-NoProfile", "-NonInteractive", "-Command", &script]);
        let result = run_retry(
            self.runner.as_ref(),
            DELETE_RETRIES,
            TOOL_TIMEOUT,
            CommandInput::None,
            &self.cfg.powershell_path,
            &args,
        )
        .await;
        if let Err(e) = result {
            if e.to_string().contains("was not found") {
                debug!("User {user} is already gone");
            } else {
                return Err(e).context("failed to delete user");
            }
        }
        let home = self.user_home(user).display().to_string();
        self.powershell(&format!("Remove-Item -Recurse -Force -Path '{home}' -ErrorAction Ignore"))
            .await
            .context("failed to remove home directory")?;
        self.passwords.lock().await.remove(user);
        Ok(())
    }

    async fn user_exec(&self, user: &str, command: &str) -> anyhow::Result<String> {
        let password = self
            .passwords
            .lock()
            .await
            .get(user)
            .cloned()
            .with_context(|| format!("no credential for user {user}"))?;
        let credential = Self::credential_expr(user, &password);
        let script = format!("Invoke-Command -ComputerName localhost -Credential ({credential}) -ScriptBlock {{ {command} }}");
        let output = self.powershell(&script).await.with_context(|| format!("failed to run command as {user}"))?;
        Ok(output.stdout)
    }

    async fn user_run(&self, user: &str, env_file: &Path, entry: &str) -> anyhow::Result<()> {
        let password = self
            .passwords
            .lock()
            .await
            .get(user)
            .cloned()
            .with_context(|| format!("no credential for user {user}"))?;
        let credential = Self::credential_expr(user, &password);
        let home = self.user_home(user).display().to_string();
        let inner = format!(". '{}'; {entry}", env_file.display());
        let script = format!(
            "Start-Process -FilePath '{}' -Credential ({credential}) -WorkingDirectory '{home}' \
             -ArgumentList '-NoProfile','-Command','{}'",
            self.cfg.powershell_path.display(),
            inner.replace('\'', "''"),
        );
        self.runner
            .start(START_PROBE, &self.cfg.powershell_path, &argv(["-NoProfile", "-NonInteractive", "-Command", &script]))
            .await
            .context("entry process died right after start")?;
        Ok(())
    }

    async fn user_stop(&self, user: &str) -> anyhow::Result<()> {
        let stop = format!(
            "Get-Process -IncludeUserName | Where-Object {{ $_.UserName -match '{user}$' }} | \
             Stop-Process -ErrorAction Ignore"
        );
        if let Err(e) = self.powershell(&stop).await {
            debug!("Stop delivery to {user} processes: {e}");
        }
        time::sleep(STOP_GRACE).await;
        let kill = format!(
            "Get-Process -IncludeUserName | Where-Object {{ $_.UserName -match '{user}$' }} | \
             Stop-Process -Force -ErrorAction Ignore"
        );
        if let Err(e) = self.powershell(&kill).await {
            debug!("Forced stop of {user} processes: {e}");
        }
        Ok(())
    }

    async fn home_exists(&self, user: &str) -> anyhow::Result<bool> {
        let home = self.user_home(user).display().to_string();
        let script = format!("if (Test-Path -Path '{home}') {{ exit 0 }} else {{ exit 1 }}");
        match self.powershell(&script).await {
            Ok(_) => Ok(true),
            Err(CmdError::Failed { .. }) => Ok(false),
            Err(e) => Err(e).context("failed to check home directory"),
        }
    }

    async fn disk_create(&self, user: &str, name: &str, disk: &ResourceDisk) -> anyhow::Result<PathBuf> {
        if disk.disk_type != "dir" {
            anyhow::bail!("disk type '{}' is not supported on windows", disk.disk_type);
        }
        let dir = self.cfg.workspace_path.join(user).join(name);
        fs::create_dir_all(&dir).await.context("failed to create disk directory")?;
        self.chown_tree(user, &dir).await?;
        Ok(dir)
    }

    async fn disks_delete(&self, user: &str) -> anyhow::Result<()> {
        match fs::remove_dir_all(self.cfg.workspace_path.join(user)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove workspace"),
        }
    }

    async fn chown_tree(&self, user: &str, path: &Path) -> anyhow::Result<()> {
        let args = argv([&path.display().to_string(), "/grant", &format!("{user}:(OI)(CI)F"), "/T", "/Q"]);
        self.runner
            .run(TOOL_TIMEOUT, CommandInput::None, Path::new("icacls"), &args)
            .await
            .with_context(|| format!("failed to grant {user} ownership of {}", path.display()))?;
        Ok(())
    }

    async fn grant_read(&self, user: &str, path: &Path) -> anyhow::Result<()> {
        let args = argv([&path.display().to_string(), "/grant", &format!("{user}:R"), "/Q"]);
        self.runner
            .run(TOOL_TIMEOUT, CommandInput::None, Path::new("icacls"), &args)
            .await
            .with_context(|| format!("failed to grant {user} read on {}", path.display()))?;
        Ok(())
    }
}
