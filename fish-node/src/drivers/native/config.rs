use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Configuration of one native driver instance. Tool paths left empty are
/// resolved through PATH during validation; the working directories are
/// absolute afterwards.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NativeConfig {
    /// Pre-created users to lease instead of creating ephemeral ones.
    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default)]
    pub sudo_path: PathBuf,

    #[serde(default)]
    pub su_path: PathBuf,

    #[serde(default)]
    pub sh_path: PathBuf,

    #[serde(default)]
    pub tar_path: PathBuf,

    #[serde(default)]
    pub mount_path: PathBuf,

    #[serde(default)]
    pub chown_path: PathBuf,

    #[serde(default)]
    pub chmod_path: PathBuf,

    #[serde(default)]
    pub killall_path: PathBuf,

    #[serde(default)]
    pub rm_path: PathBuf,

    // macOS only
    #[serde(default)]
    pub dscl_path: PathBuf,

    #[serde(default)]
    pub hdiutil_path: PathBuf,

    #[serde(default)]
    pub mdutil_path: PathBuf,

    #[serde(default)]
    pub createhomedir_path: PathBuf,

    // Windows only
    #[serde(default)]
    pub powershell_path: PathBuf,

    /// Shared cache of unpacked images.
    #[serde(default)]
    pub images_path: PathBuf,

    /// Per-allocation scratch space.
    #[serde(default)]
    pub workspace_path: PathBuf,

    /// Correction applied to the detected host CPU count, may be negative.
    #[serde(default)]
    pub cpu_alter: i32,

    /// Correction applied to the detected host RAM GBs, may be negative.
    #[serde(default)]
    pub ram_alter: i32,

    /// Extra virtual CPUs advertised to overbook-tolerant tenants.
    #[serde(default)]
    pub cpu_overbook: u32,

    /// Extra virtual RAM GBs advertised to overbook-tolerant tenants.
    #[serde(default)]
    pub ram_overbook: u32,

    #[serde(default)]
    pub download_user: String,

    #[serde(default)]
    pub download_password: String,
}

impl NativeConfig {
    pub fn apply(config: &[u8]) -> Result<Self, String> {
        if config.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(config).map_err(|e| format!("bad native config: {e}"))
    }

    /// Resolves and verifies every tool the platform needs and absolutizes
    /// the working directories.
    pub fn validate(&mut self, os: &str) -> Result<(), String> {
        for (tool, path) in self.required_tools(os) {
            let resolved = resolve_tool(tool, &path)?;
            self.set_tool(tool, resolved);
        }

        if self.images_path.as_os_str().is_empty() {
            self.images_path = PathBuf::from("fish-native-images");
        }
        if self.workspace_path.as_os_str().is_empty() {
            self.workspace_path = PathBuf::from("fish-native-workspace");
        }
        self.images_path = absolutize(&self.images_path)?;
        self.workspace_path = absolutize(&self.workspace_path)?;

        for user in &self.users {
            if user.is_empty() || user.contains('/') || user.contains('\\') {
                return Err(format!("bad pool user name '{user}'"));
            }
        }
        Ok(())
    }

    fn required_tools(&self, os: &str) -> Vec<(&'static str, PathBuf)> {
        let mut tools = vec![
            ("sudo", self.sudo_path.clone()),
            ("su", self.su_path.clone()),
            ("sh", self.sh_path.clone()),
            ("tar", self.tar_path.clone()),
            ("mount", self.mount_path.clone()),
            ("chown", self.chown_path.clone()),
            ("chmod", self.chmod_path.clone()),
            ("killall", self.killall_path.clone()),
            ("rm", self.rm_path.clone()),
        ];
        match os {
            "macos" => tools.extend([
                ("dscl", self.dscl_path.clone()),
                ("hdiutil", self.hdiutil_path.clone()),
                ("mdutil", self.mdutil_path.clone()),
                ("createhomedir", self.createhomedir_path.clone()),
            ]),
            "windows" => {
                tools = vec![("tar", self.tar_path.clone()), ("powershell", self.powershell_path.clone())];
            }
            _ => {}
        }
        tools
    }

    fn set_tool(&mut self, tool: &str, path: PathBuf) {
        match tool {
            "sudo" => self.sudo_path = path,
            "su" => self.su_path = path,
            "sh" => self.sh_path = path,
            "tar" => self.tar_path = path,
            "mount" => self.mount_path = path,
            "chown" => self.chown_path = path,
            "chmod" => self.chmod_path = path,
            "killall" => self.killall_path = path,
            "rm" => self.rm_path = path,
            "dscl" => self.dscl_path = path,
            "hdiutil" => self.hdiutil_path = path,
            "mdutil" => self.mdutil_path = path,
            "createhomedir" => self.createhomedir_path = path,
            "powershell" => self.powershell_path = path,
            _ => unreachable!("unknown tool {tool}"),
        }
    }
}

/// Verifies a configured tool path or looks the tool up through PATH.
fn resolve_tool(tool: &str, configured: &Path) -> Result<PathBuf, String> {
    if !configured.as_os_str().is_empty() {
        if is_executable(configured) {
            return Ok(configured.to_path_buf());
        }
        return Err(format!("tool '{tool}' at {} is missing or not executable", configured.display()));
    }
    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        for name in candidates(tool) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    Err(format!("tool '{tool}' not found in PATH"))
}

fn candidates(tool: &str) -> Vec<String> {
    if cfg!(windows) { vec![format!("{tool}.exe"), tool.to_string()] } else { vec![tool.to_string()] }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn absolutize(path: &Path) -> Result<PathBuf, String> {
    std::path::absolute(path).map_err(|e| format!("cannot absolutize {}: {e}", path.display()))
}
