use crate::resources::Resources;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::net::IpAddr;
use uuid::Uuid;

/// Credentials handed to whoever needs to reach an allocated environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Private key material, when password auth is not enough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// What a label promises: resource requirements plus driver-specific options.
/// Immutable once accepted by a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabelDefinition {
    /// Resource requirements of one instance.
    pub resources: Resources,

    /// Driver-specific options, opaque at this level.
    #[serde(default = "empty_options")]
    pub options: Box<RawValue>,

    /// Authentication material attached to produced environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,

    /// Authorization scope the definition was accepted under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl LabelDefinition {
    pub fn new(resources: Resources) -> Self {
        Self { resources, options: empty_options(), authentication: None, scope: None }
    }

    pub fn with_options(mut self, options: Box<RawValue>) -> Self {
        self.options = options;
        self
    }
}

fn empty_options() -> Box<RawValue> {
    RawValue::from_string("{}".to_string()).expect("valid JSON literal")
}

/// A live allocation produced by a resource driver. The identifier is the
/// sole handle for status, deallocate and task calls; it uniquely keys the
/// allocation on the node and is safe to embed in filesystem paths.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationResource {
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_addr: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
}

impl ApplicationResource {
    pub fn new<S: Into<String>>(identifier: S) -> Self {
        Self { identifier: identifier.into(), ip_addr: None, authentication: None }
    }
}

/// A post-allocation task requested for an application (for example a
/// snapshot of its disks).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationTask {
    pub id: Uuid,

    /// Task name, resolved against the owning driver's task list.
    pub task: String,

    /// Task options, opaque at this level.
    #[serde(default = "empty_options")]
    pub options: Box<RawValue>,
}

impl ApplicationTask {
    pub fn new<S: Into<String>>(task: S) -> Self {
        Self { id: Uuid::new_v4(), task: task.into(), options: empty_options() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_definition_parses_with_defaults() {
        let def: LabelDefinition =
            serde_json::from_str(r#"{"resources": {"cpu": 2, "ram": 4}}"#).expect("parse failed");
        assert_eq!(def.resources.cpu, 2);
        assert_eq!(def.options.get(), "{}");
        assert!(def.authentication.is_none());
    }

    #[test]
    fn label_definition_keeps_options_verbatim() {
        let def: LabelDefinition =
            serde_json::from_str(r#"{"resources": {"cpu": 1, "ram": 1}, "options": {"entry": "./run.sh"}}"#)
                .expect("parse failed");
        assert!(def.options.get().contains("run.sh"));
    }

    #[test]
    fn application_resource_roundtrip() {
        let res = ApplicationResource::new("fish-abcdef");
        let encoded = serde_json::to_string(&res).expect("serialize failed");
        let decoded: ApplicationResource = serde_json::from_str(&encoded).expect("parse failed");
        assert_eq!(decoded, res);
    }
}
