//! Registry and lifecycle management for per-tenant Odoo instances on a
//! single Linux host.
//!
//! [`LifecycleManager`] drives every operation against an
//! [`InstanceRepository`] and a [`Host`]. [`FsRegistry`] and [`SystemHost`]
//! are the production implementations.

pub mod allocator;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod runner;
pub mod system;
pub mod template;

pub use allocator::validate_port;
pub use collaborators::{
    AccountManager, DatabaseAdmin, FilesystemLayout, Firewall, Host, PackageInstaller, PortProbe, ProcessSupervisor,
    ReverseProxyManager, SourceFetcher, TcpProbe,
};
pub use config::Settings;
pub use error::{ManagerError, PortError, PortRole, Result};
pub use lifecycle::{CreateRequest, LifecycleManager, NewLogin};
pub use registry::{FsRegistry, InstanceRepository, MemoryRegistry};
pub use system::SystemHost;
pub use template::{render, TemplateStore};

/// Production manager built from settings.
pub fn system_manager(settings: &Settings) -> LifecycleManager<FsRegistry, SystemHost> {
    let registry = FsRegistry::new(&settings.install_root);
    let templates = TemplateStore::new(settings.templates_dir.clone());
    LifecycleManager::new(registry, SystemHost::new(settings.clone()), templates, &settings.install_root)
        .with_supported_versions(settings.supported_versions.clone())
}
