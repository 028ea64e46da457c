//! Placeholder substitution for generated config files, and lookup of the
//! named templates it is applied to.
//!
//! Rendering is plain sequential string replacement. A field value that
//! contains a placeholder replaced later in the order is expanded again.

use std::fs;
use std::path::{Path, PathBuf};

use common::{ArtifactKind, InstanceRecord};
use rust_embed::RustEmbed;
use tracing::debug;

use crate::error::{ManagerError, Result};

#[derive(RustEmbed)]
#[folder = "templates/"]
struct BuiltinTemplates;

const TEMPLATE_EXT: &str = "conf";

pub fn render(template: &str, record: &InstanceRecord, install_root: &Path) -> String {
    let created = record.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let root = install_root.display().to_string();
    let substitutions = [
        ("{{instance_name}}", record.id.clone()),
        ("{{create_datetime}}", created),
        ("{{root}}", root),
        ("{{odoo_version}}", record.version.clone()),
        ("{{longpolling_port}}", record.event_port.to_string()),
        ("{{port}}", record.http_port.to_string()),
        ("{{server_name}}", record.effective_server_name()),
    ];

    substitutions
        .iter()
        .fold(template.to_string(), |text, (placeholder, value)| text.replace(placeholder, value))
}

/// Resolves template names to template text.
///
/// A configured directory is searched first (`<dir>/<kind>/<name>.conf`);
/// the templates compiled into the binary are the fallback.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    dir: Option<PathBuf>,
}

impl TemplateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn builtin() -> Self {
        Self { dir: None }
    }

    pub fn load(&self, kind: ArtifactKind, name: &str) -> Result<String> {
        let relative = format!("{}/{}.{}", kind, name, TEMPLATE_EXT);

        if let Some(dir) = &self.dir {
            let path = dir.join(&relative);
            if path.is_file() {
                debug!(path = %path.display(), "loading template");
                return fs::read_to_string(&path).map_err(|source| ManagerError::Io { path, source });
            }
        }

        let not_found = || ManagerError::TemplateNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        };
        let file = BuiltinTemplates::get(&relative).ok_or_else(not_found)?;
        String::from_utf8(file.data.into_owned()).map_err(|_| not_found())
    }

    /// Load the template the record was created with and render it.
    pub fn render_for(&self, kind: ArtifactKind, record: &InstanceRecord, install_root: &Path) -> Result<String> {
        let template = self.load(kind, record.templates.for_kind(kind))?;
        Ok(render(&template, record, install_root))
    }
}
