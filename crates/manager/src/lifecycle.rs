//! Instance lifecycle: create, update, add dependency, add user, reset,
//! start/stop and delete.
//!
//! Each operation is a fixed, ordered list of collaborator calls. Nothing is
//! retried and nothing is rolled back: when a step fails the error is
//! returned and every earlier step stays done. A failed `create` therefore
//! leaves an account, directories and possibly a database role behind, but
//! no record, so its ports are not reserved. The other side of this is
//! that a stored record always describes a fully provisioned instance.
//!
//! Operations that write into an instance directory ask the host to confirm
//! root rights once their own validation has passed.
//!
//! There is no locking. Two processes creating instances at the same time
//! can both accept the same port before either saves its record.

use std::path::PathBuf;

use chrono::{NaiveDate, Utc};
use common::{ArtifactKind, InstanceRecord, InstanceState, TemplateNames};
use tracing::{info, warn};

use crate::allocator::validate_port;
use crate::collaborators::Host;
use crate::error::{ManagerError, PortRole, Result};
use crate::registry::InstanceRepository;
use crate::template::TemplateStore;

/// Parameters of a `create` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub version: String,
    pub http_port: u16,
    pub event_port: u16,
    pub display_name: Option<String>,
    pub server_name: Option<String>,
    pub templates: TemplateNames,
}

impl CreateRequest {
    pub fn new(version: impl Into<String>, http_port: u16, event_port: u16) -> Self {
        Self {
            version: version.into(),
            http_port,
            event_port,
            display_name: None,
            server_name: None,
            templates: TemplateNames::default(),
        }
    }
}

/// Result of attaching a login to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogin {
    pub username: String,
    pub password: String,
    /// False when sshd refuses password logins, so the password is only
    /// usable locally.
    pub ssh_password_auth: bool,
}

pub struct LifecycleManager<R, H> {
    registry: R,
    host: H,
    templates: TemplateStore,
    install_root: PathBuf,
    supported_versions: Vec<String>,
}

impl<R: InstanceRepository, H: Host> LifecycleManager<R, H> {
    pub fn new(registry: R, host: H, templates: TemplateStore, install_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            host,
            templates,
            install_root: install_root.into(),
            supported_versions: Vec::new(),
        }
    }

    /// Restrict `create` to these versions. An empty list accepts any version.
    pub fn with_supported_versions(mut self, versions: Vec<String>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn load(&self, id: &str) -> Result<InstanceRecord> {
        self.registry
            .load_one(id)?
            .ok_or_else(|| ManagerError::InstanceNotFound(id.to_string()))
    }

    /// Current state, asked of the process supervisor.
    pub fn state_of(&self, record: &InstanceRecord) -> Result<InstanceState> {
        if self.host.unit_is_active(record)? {
            Ok(InstanceState::Active)
        } else {
            Ok(InstanceState::Stopped)
        }
    }

    /// All records with their current state.
    pub fn list(&self) -> Result<Vec<(InstanceRecord, InstanceState)>> {
        self.registry
            .load_all()?
            .into_iter()
            .map(|record| {
                let state = self.state_of(&record)?;
                Ok((record, state))
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<(InstanceRecord, InstanceState)> {
        let record = self.load(id)?;
        let state = self.state_of(&record)?;
        Ok((record, state))
    }

    fn check_version(&self, version: &str) -> Result<()> {
        if self.supported_versions.is_empty() || self.supported_versions.iter().any(|v| v == version) {
            return Ok(());
        }
        Err(ManagerError::UnsupportedVersion {
            version: version.to_string(),
            supported: self.supported_versions.join(", "),
        })
    }

    fn check_ports(&self, request: &CreateRequest) -> Result<()> {
        if request.http_port == request.event_port {
            return Err(ManagerError::PortsNotDistinct(request.http_port));
        }
        let records = self.registry.load_all()?;
        for (role, port) in [(PortRole::Http, request.http_port), (PortRole::Event, request.event_port)] {
            validate_port(port, &self.host, &records).map_err(|source| ManagerError::Port { role, source })?;
        }
        Ok(())
    }

    /// Provision a new instance end to end and return its record.
    pub fn create(&self, request: CreateRequest) -> Result<InstanceRecord> {
        self.check_version(&request.version)?;
        self.check_ports(&request)?;

        // Validate template names before touching the host.
        for kind in ArtifactKind::ALL {
            self.templates.load(kind, request.templates.for_kind(kind))?;
        }
        self.host.require_root("create")?;
        if self.host.firewall_enabled() {
            warn!(
                http_port = request.http_port,
                event_port = request.event_port,
                "firewall is enabled; open the ports if they must be reachable"
            );
        }

        let mut record = InstanceRecord::new(&request.version, Utc::now(), request.http_port, request.event_port);
        record.display_name = request.display_name;
        record.server_name = request.server_name;
        record.templates = request.templates;

        info!(id = %record.id, state = %InstanceState::Provisioning, "provisioning instance");
        self.host.ensure_prerequisites()?;
        self.host.create_service_account(&record)?;
        self.host.create_layout(&record)?;
        self.host.create_role(&record)?;
        self.host.create_venv(&record)?;
        self.write_artifact(ArtifactKind::Odoo, &record)?;
        self.write_artifact(ArtifactKind::Service, &record)?;
        self.host.enable_unit(&record)?;
        self.write_artifact(ArtifactKind::Nginx, &record)?;
        self.host.enable_site(&record)?;
        self.host.reload_proxy()?;

        self.refresh_code(&mut record, None)?;
        self.registry.save(&record)?;
        self.host.restart_unit(&record)?;
        info!(id = %record.id, state = %InstanceState::Active, "instance created");
        Ok(record)
    }

    fn write_artifact(&self, kind: ArtifactKind, record: &InstanceRecord) -> Result<()> {
        let contents = self.templates.render_for(kind, record, &self.install_root)?;
        self.install_artifact(kind, record, &contents)
    }

    fn install_artifact(&self, kind: ArtifactKind, record: &InstanceRecord, contents: &str) -> Result<()> {
        match kind {
            ArtifactKind::Odoo => self.host.write_deployment_config(record, contents),
            ArtifactKind::Service => self.host.install_unit(record, contents),
            ArtifactKind::Nginx => self.host.install_site(record, contents),
        }
    }

    fn refresh_code(&self, record: &mut InstanceRecord, nightly: Option<NaiveDate>) -> Result<()> {
        self.host.fetch_source(record, nightly)?;
        record.last_updated_at = Some(Utc::now());
        self.host.install_requirements(record)
    }

    /// Fetch fresh source, reinstall dependencies and restart.
    pub fn update(&self, id: &str, nightly: Option<NaiveDate>) -> Result<InstanceRecord> {
        let mut record = self.load(id)?;
        self.host.require_root("update")?;
        info!(id = %record.id, version = %record.version, "updating code");
        self.refresh_code(&mut record, nightly)?;
        self.registry.save(&record)?;
        self.host.restart_unit(&record)?;
        Ok(record)
    }

    /// Add an extra package, reinstall dependencies and restart. Adding a
    /// dependency that is already present changes nothing in the record.
    pub fn add_dependency(&self, id: &str, dependency: &str) -> Result<InstanceRecord> {
        let mut record = self.load(id)?;
        self.host.require_root("add_dependency")?;
        if !record.add_dependency(dependency) {
            info!(id = %record.id, dependency, "dependency already present");
        }
        self.registry.save(&record)?;
        self.host.install_requirements(&record)?;
        self.host.restart_unit(&record)?;
        Ok(record)
    }

    pub fn add_user(&self, id: &str, username: &str) -> Result<NewLogin> {
        let mut record = self.load(id)?;
        if record.has_user(username) {
            return Err(ManagerError::UserAlreadyAttached {
                id: record.id,
                user: username.to_string(),
            });
        }
        self.host.require_root("add_user")?;
        let password = self.host.create_login(&record, username)?;
        record.users.push(username.to_string());
        self.registry.save(&record)?;

        let ssh_password_auth = self.host.password_auth_enabled();
        if !ssh_password_auth {
            warn!("password authentication is disabled for ssh; enable it to connect to the instance over ssh");
        }
        Ok(NewLogin {
            username: username.to_string(),
            password,
            ssh_password_auth,
        })
    }

    /// Regenerate one artifact from the record's current fields.
    pub fn reset(&self, id: &str, target: ArtifactKind) -> Result<InstanceRecord> {
        let record = self.load(id)?;
        let contents = self.templates.render_for(target, &record, &self.install_root)?;
        self.host.require_root("reset")?;
        info!(id = %record.id, %target, "regenerating artifact");
        self.install_artifact(target, &record, &contents)?;
        match target {
            ArtifactKind::Odoo => {}
            ArtifactKind::Service => self.host.enable_unit(&record)?,
            ArtifactKind::Nginx => {
                self.host.enable_site(&record)?;
                self.host.reload_proxy()?;
            }
        }
        Ok(record)
    }

    pub fn start(&self, id: &str) -> Result<InstanceState> {
        let record = self.load(id)?;
        self.host.start_unit(&record)?;
        self.state_of(&record)
    }

    pub fn stop(&self, id: &str) -> Result<InstanceState> {
        let record = self.load(id)?;
        self.host.stop_unit(&record)?;
        self.state_of(&record)
    }

    pub fn restart(&self, id: &str) -> Result<InstanceState> {
        let record = self.load(id)?;
        self.host.restart_unit(&record)?;
        self.state_of(&record)
    }

    pub fn journal(&self, id: &str, lines: u32, follow: bool) -> Result<()> {
        let record = self.load(id)?;
        self.host.journal(&record, lines, follow)
    }

    /// Tear the instance down. Traffic is cut first (proxy, then the unit)
    /// so nothing reaches an instance whose database or account is gone.
    pub fn delete(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.load(id)?;
        self.host.require_root("delete")?;
        info!(id = %record.id, "deleting instance");
        self.host.remove_site(&record)?;
        self.host.stop_unit(&record)?;
        self.host.disable_unit(&record)?;
        self.host.remove_unit(&record)?;
        self.host.drop_role(&record)?;
        for user in &record.users {
            self.host.delete_login(user)?;
        }
        self.host.delete_service_account(&record)?;
        self.registry.delete(&record.id)?;
        info!(id = %record.id, state = %InstanceState::Deleted, "instance deleted");
        Ok(record)
    }
}
