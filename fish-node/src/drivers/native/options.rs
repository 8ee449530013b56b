use crate::images::Image;
use fish_models::resources::Resources;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::{collections::HashMap, path::PathBuf};

/// Label options understood by the native driver.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NativeOptions {
    /// Layered images unpacked into the environment, in order.
    #[serde(default)]
    pub images: Vec<Image>,

    /// Entry command template; the only substitution is `.Disks.<name>`.
    #[serde(default)]
    pub entry: String,

    /// Groups for the created user, primary first.
    #[serde(default)]
    pub groups: Vec<String>,
}

// Deliberately the single recognized template field; anything broader
// belongs to the workload itself.
static DISKS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\.Disks\.([A-Za-z0-9_-]+)\s*\}\}").expect("valid regex"));

impl NativeOptions {
    pub fn parse(options: &RawValue) -> Result<Self, String> {
        serde_json::from_str(options.get()).map_err(|e| format!("bad native options: {e}"))
    }

    /// Checks the options against the definition's resources: every image
    /// must be well-formed and its tag must name a requested disk.
    pub fn validate(&self, resources: &Resources) -> Result<(), String> {
        for image in &self.images {
            image.validate().map_err(|e| e.to_string())?;
            if !image.tag.is_empty() && !resources.disks.contains_key(&image.tag) {
                return Err(format!(
                    "image {} tag '{}' does not match any disk",
                    image.dir_name(),
                    image.tag
                ));
            }
        }
        for group in &self.groups {
            if group.is_empty() {
                return Err("empty group name".to_string());
            }
        }
        Ok(())
    }

    /// The entry template, defaulted per platform.
    pub fn entry_for(&self, os: &str) -> String {
        if !self.entry.is_empty() {
            return self.entry.clone();
        }
        match os {
            "windows" => r".\init.ps1".to_string(),
            _ => "./init.sh".to_string(),
        }
    }
}

/// Substitutes `.Disks.<name>` references with the allocated mount paths.
pub fn render_entry(entry: &str, disks: &HashMap<String, PathBuf>) -> Result<String, String> {
    let mut missing = None;
    let rendered = DISKS_FIELD.replace_all(entry, |caps: &regex::Captures<'_>| {
        match disks.get(&caps[1]) {
            Some(path) => path.display().to_string(),
            None => {
                missing = Some(caps[1].to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(format!("entry references unknown disk '{name}'")),
        None => Ok(rendered.into_owned()),
    }
}
