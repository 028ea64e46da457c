//! Capability traits for the external systems an instance depends on.
//!
//! The lifecycle manager only talks to these traits. `SystemHost` shells
//! out to the real tools; tests substitute a recording implementation.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use chrono::NaiveDate;
use common::InstanceRecord;

use crate::error::Result;

/// Checks whether something already accepts connections on a local port.
pub trait PortProbe {
    fn is_listening(&self, port: u16) -> bool;
}

/// System packages and the per-instance Python runtime.
pub trait PackageInstaller {
    /// Install nginx, PostgreSQL, build packages and wkhtmltopdf if missing.
    fn ensure_prerequisites(&self) -> Result<()>;
    fn create_venv(&self, record: &InstanceRecord) -> Result<()>;
    /// Install the source tree's requirements followed by every extra dependency.
    fn install_requirements(&self, record: &InstanceRecord) -> Result<()>;
}

/// System accounts: the instance's service account and operator logins.
pub trait AccountManager {
    fn create_service_account(&self, record: &InstanceRecord) -> Result<()>;
    /// Create a login with a generated password, add it to the instance group
    /// and return the password.
    fn create_login(&self, record: &InstanceRecord, username: &str) -> Result<String>;
    fn delete_login(&self, username: &str) -> Result<()>;
    fn delete_service_account(&self, record: &InstanceRecord) -> Result<()>;
    fn password_auth_enabled(&self) -> bool;
}

/// Working directories and files inside the instance directory.
pub trait FilesystemLayout {
    /// Fails unless the process may write into instance directories, which
    /// belong to the instance's service account once created.
    fn require_root(&self, operation: &'static str) -> Result<()>;
    fn create_layout(&self, record: &InstanceRecord) -> Result<()>;
    fn write_deployment_config(&self, record: &InstanceRecord, contents: &str) -> Result<()>;
}

pub trait DatabaseAdmin {
    fn create_role(&self, record: &InstanceRecord) -> Result<()>;
    /// Drop every database owned by the role, then the role itself.
    fn drop_role(&self, record: &InstanceRecord) -> Result<()>;
}

pub trait ProcessSupervisor {
    fn install_unit(&self, record: &InstanceRecord, contents: &str) -> Result<()>;
    fn enable_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn disable_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn remove_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn start_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn stop_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn restart_unit(&self, record: &InstanceRecord) -> Result<()>;
    fn unit_is_active(&self, record: &InstanceRecord) -> Result<bool>;
    fn journal(&self, record: &InstanceRecord, lines: u32, follow: bool) -> Result<()>;
}

pub trait ReverseProxyManager {
    fn install_site(&self, record: &InstanceRecord, contents: &str) -> Result<()>;
    fn enable_site(&self, record: &InstanceRecord) -> Result<()>;
    /// Disable and delete the site, then reload the proxy.
    fn remove_site(&self, record: &InstanceRecord) -> Result<()>;
    fn reload_proxy(&self) -> Result<()>;
}

pub trait Firewall {
    /// True when a host firewall is active, so new ports may need opening by hand.
    fn firewall_enabled(&self) -> bool;
}

/// Fetches application source into the instance's `src` directory.
pub trait SourceFetcher {
    /// `nightly` selects a dated build instead of the latest one.
    fn fetch_source(&self, record: &InstanceRecord, nightly: Option<NaiveDate>) -> Result<()>;
}

/// Everything the lifecycle manager needs from the host.
pub trait Host:
    PortProbe
    + PackageInstaller
    + AccountManager
    + FilesystemLayout
    + DatabaseAdmin
    + ProcessSupervisor
    + ReverseProxyManager
    + SourceFetcher
    + Firewall
{
}

impl<T> Host for T where
    T: PortProbe
        + PackageInstaller
        + AccountManager
        + FilesystemLayout
        + DatabaseAdmin
        + ProcessSupervisor
        + ReverseProxyManager
        + SourceFetcher
    + Firewall
{
}

/// Probe that attempts a TCP connection to localhost.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PortProbe for TcpProbe {
    fn is_listening(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}
