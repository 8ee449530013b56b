use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How instances of an environment reach the outside world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// No dedicated network, the environment shares whatever the node exposes.
    #[default]
    #[serde(rename = "")]
    Isolated,

    /// Address-translated access to the node's uplink.
    #[serde(rename = "nat")]
    Nat,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Self::Isolated => "",
            Self::Nat => "nat",
        };
        write!(f, "{mode}")
    }
}

/// One disk requested by an environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDisk {
    /// Disk backend, driver specific (for example "dir", "hfs+", "exfat").
    #[serde(rename = "type", default)]
    pub disk_type: String,

    /// Volume label to assign to the created filesystem.
    #[serde(default)]
    pub label: String,

    /// Size in GB.
    #[serde(default)]
    pub size: u32,

    /// Keep the backing store across allocations.
    #[serde(default)]
    pub reuse: bool,

    /// Name of an existing disk image to clone instead of creating a fresh one.
    #[serde(default)]
    pub clone: String,
}

/// Compute requirements of one environment instance. The same shape is used
/// by the node to accumulate the resources currently in use.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Logical cores.
    #[serde(default)]
    pub cpu: u32,

    /// RAM in GB.
    #[serde(default)]
    pub ram: u32,

    /// Requested disks, keyed by the name the environment sees them under.
    #[serde(default)]
    pub disks: BTreeMap<String, ResourceDisk>,

    #[serde(default)]
    pub network: NetworkMode,

    /// The application tolerates sharing the node with other applications.
    #[serde(default)]
    pub multitenancy: bool,

    /// The application tolerates CPU overbooking by other tolerant tenants.
    #[serde(default)]
    pub cpu_overbook: bool,

    /// The application tolerates RAM overbooking by other tolerant tenants.
    #[serde(default)]
    pub ram_overbook: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResourcesError {
    #[error("invalid resources: {0}")]
    Validate(String),

    #[error("resources underflow: {}", axes.join(", "))]
    Underflow { axes: Vec<String> },
}

impl Resources {
    /// Checks the request against what a driver can provide. `allowed_disk_types`
    /// is the set of disk backends the driver supports (empty means any);
    /// `nat_allowed` tells whether the driver can provide NAT networking.
    pub fn validate(&self, allowed_disk_types: &[&str], nat_allowed: bool) -> Result<(), ResourcesError> {
        if self.cpu < 1 {
            return Err(ResourcesError::Validate("cpu must be at least 1".into()));
        }
        if self.ram < 1 {
            return Err(ResourcesError::Validate("ram must be at least 1".into()));
        }
        for (name, disk) in &self.disks {
            if name.is_empty() {
                return Err(ResourcesError::Validate("disk name cannot be empty".into()));
            }
            if name.contains('/') || name.contains('\\') {
                return Err(ResourcesError::Validate(format!("disk name '{name}' contains a path separator")));
            }
            if disk.size < 1 {
                return Err(ResourcesError::Validate(format!("disk '{name}' size must be at least 1GB")));
            }
            if !allowed_disk_types.is_empty() && !allowed_disk_types.contains(&disk.disk_type.as_str()) {
                return Err(ResourcesError::Validate(format!(
                    "disk '{name}' type '{}' is not supported, allowed: {allowed_disk_types:?}",
                    disk.disk_type
                )));
            }
        }
        if self.network == NetworkMode::Nat && !nat_allowed {
            return Err(ResourcesError::Validate("network mode 'nat' is not supported".into()));
        }
        Ok(())
    }

    /// True when nothing has been accumulated yet.
    pub fn is_empty(&self) -> bool {
        self.cpu == 0 && self.ram == 0 && self.disks.is_empty()
    }

    /// Accumulates another request. The first request added to an empty
    /// accumulator fixes the tenancy policy; later adds leave it untouched.
    pub fn add(&mut self, res: &Resources) {
        if self.is_empty() {
            self.multitenancy = res.multitenancy;
            self.cpu_overbook = res.cpu_overbook;
            self.ram_overbook = res.ram_overbook;
        }
        self.cpu += res.cpu;
        self.ram += res.ram;
    }

    /// Removes a previously added request. Underflowing axes are clamped at
    /// zero and reported together in the returned error; the accumulator is
    /// mutated to the clamped values either way.
    pub fn subtract(&mut self, res: &Resources) -> Result<(), ResourcesError> {
        let mut axes = Vec::new();
        if res.cpu > self.cpu {
            axes.push(format!("cpu: {} - {}", self.cpu, res.cpu));
        }
        if res.ram > self.ram {
            axes.push(format!("ram: {} - {}", self.ram, res.ram));
        }
        self.cpu = self.cpu.saturating_sub(res.cpu);
        self.ram = self.ram.saturating_sub(res.ram);
        if axes.is_empty() { Ok(()) } else { Err(ResourcesError::Underflow { axes }) }
    }
}
