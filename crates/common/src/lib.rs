use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// File name of the persisted record inside each instance directory.
pub const RECORD_FILE: &str = "instance.json";

/// Domain appended to the instance id when no server name was given.
pub const DEFAULT_SERVER_DOMAIN: &str = "example.com";

pub const DEFAULT_TEMPLATE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub http_port: u16,
    pub event_port: u16,
    pub server_name: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub templates: TemplateNames,
}

impl InstanceRecord {
    pub fn new(version: &str, created_at: DateTime<Utc>, http_port: u16, event_port: u16) -> Self {
        Self {
            id: derive_id(version, created_at),
            display_name: None,
            version: version.to_string(),
            created_at,
            last_updated_at: None,
            http_port,
            event_port,
            server_name: None,
            dependencies: Vec::new(),
            users: Vec::new(),
            templates: TemplateNames::default(),
        }
    }

    /// Hostname the reverse proxy answers for.
    pub fn effective_server_name(&self) -> String {
        match &self.server_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}.{}", self.id, DEFAULT_SERVER_DOMAIN),
        }
    }

    /// Both ports claimed by this instance.
    pub fn ports(&self) -> [u16; 2] {
        [self.http_port, self.event_port]
    }

    /// Returns false when the dependency was already present.
    pub fn add_dependency(&mut self, name: &str) -> bool {
        if self.dependencies.iter().any(|d| d == name) {
            return false;
        }
        self.dependencies.push(name.to_string());
        true
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.users.iter().any(|u| u == username)
    }
}

/// Derive the instance id from its version and creation time.
///
/// The first 16 bytes of SHA-256 over `"{version}-{created_at}"`, hex encoded.
pub fn derive_id(version: &str, created_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(format!("{}-{}", version, created_at.to_rfc3339()).as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Names of the templates an instance was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateNames {
    pub odoo: String,
    pub service: String,
    pub nginx: String,
}

impl Default for TemplateNames {
    fn default() -> Self {
        Self {
            odoo: DEFAULT_TEMPLATE.to_string(),
            service: DEFAULT_TEMPLATE.to_string(),
            nginx: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl TemplateNames {
    pub fn for_kind(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Odoo => &self.odoo,
            ArtifactKind::Service => &self.service,
            ArtifactKind::Nginx => &self.nginx,
        }
    }
}

/// A configuration artifact generated from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Deployment config (`odoo.conf`).
    Odoo,
    /// Reverse-proxy site.
    Nginx,
    /// Process-supervision unit.
    Service,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Odoo, ArtifactKind::Nginx, ArtifactKind::Service];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Odoo => "odoo",
            ArtifactKind::Nginx => "nginx",
            ArtifactKind::Service => "service",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odoo" => Ok(ArtifactKind::Odoo),
            "nginx" => Ok(ArtifactKind::Nginx),
            "service" => Ok(ArtifactKind::Service),
            other => Err(format!("unknown target '{}' (expected odoo, nginx or service)", other)),
        }
    }
}

/// Lifecycle state of an instance.
///
/// Only `Provisioning` exists purely in memory; `Active` and `Stopped` are
/// asked of the process supervisor each time and never persisted. A record
/// is saved only once provisioning finished, so every stored instance is
/// `Active` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Provisioning,
    Active,
    Stopped,
    Deleted,
}

impl InstanceState {
    pub fn label(self) -> &'static str {
        match self {
            InstanceState::Uninitialized => "Uninitialized",
            InstanceState::Provisioning => "Provisioning",
            InstanceState::Active => "Running",
            InstanceState::Stopped => "Stopped",
            InstanceState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
