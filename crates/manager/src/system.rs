//! Production host: every collaborator call becomes a `sudo` command line.
//!
//! The tool runs as root. Instance directories are owned by their service
//! accounts and the registry writes records into them directly, so
//! operations that touch them check the effective uid first. Commands still
//! go through `sudo` to switch to the instance or `postgres` user, and files
//! outside the instance directory are written with `sudo tee`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use chrono::NaiveDate;
use common::InstanceRecord;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::collaborators::{
    AccountManager, DatabaseAdmin, FilesystemLayout, Firewall, PackageInstaller, PortProbe, ProcessSupervisor,
    ReverseProxyManager, SourceFetcher, TcpProbe,
};
use crate::config::Settings;
use crate::error::{ManagerError, Result};
use crate::runner::{check, CommandRunner, SystemRunner};

/// Build and runtime packages the application needs on the host.
pub const PYTHON_DEPENDENCIES: &[&str] = &[
    "build-essential",
    "python3.10",
    "python3.10-full",
    "python3-pip",
    "python3-dev",
    "python3-venv",
    "python3-wheel",
    "libxml2-dev",
    "libpq-dev",
    "libjpeg8-dev",
    "liblcms2-dev",
    "libxslt1-dev",
    "zlib1g-dev",
    "libsasl2-dev",
    "libldap2-dev",
    "libssl-dev",
    "libffi-dev",
    "libmysqlclient-dev",
    "libjpeg-dev",
    "libblas-dev",
    "libatlas-base-dev",
];

const WKHTMLTOPDF_RELEASE: &str = "https://github.com/wkhtmltopdf/packaging/releases/download/0.12.6.1-2";

const LAYOUT_DIRS: [&str; 4] = ["src", "logs", "backups", "custom_addons"];

const PASSWORD_LEN: usize = 16;

/// Fetches a URL into a local file.
pub trait Downloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Blocking HTTP downloads.
pub struct HttpDownloader {
    timeout: Duration,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        // Nightly archives are a few hundred megabytes.
        Self {
            timeout: Duration::from_secs(900),
        }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url, "downloading");
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ManagerError::collaborator("download", e))?;
        let mut response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ManagerError::collaborator("download", e))?;
        let mut file = fs::File::create(dest).map_err(|source| ManagerError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        response
            .copy_to(&mut file)
            .map_err(|e| ManagerError::collaborator("download", e))?;
        Ok(())
    }
}

pub struct SystemHost<R: CommandRunner = SystemRunner, D: Downloader = HttpDownloader> {
    settings: Settings,
    runner: R,
    downloader: D,
    probe: TcpProbe,
}

impl SystemHost {
    pub fn new(settings: Settings) -> Self {
        Self::with_parts(settings, SystemRunner, HttpDownloader::default())
    }
}

impl<R: CommandRunner, D: Downloader> SystemHost<R, D> {
    pub fn with_parts(settings: Settings, runner: R, downloader: D) -> Self {
        let probe = TcpProbe::new(settings.probe_timeout());
        Self {
            settings,
            runner,
            downloader,
            probe,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn instance_dir(&self, record: &InstanceRecord) -> PathBuf {
        self.settings.instance_dir(&record.id)
    }

    fn unit_name(record: &InstanceRecord) -> String {
        format!("{}.service", record.id)
    }

    fn unit_path(&self, record: &InstanceRecord) -> PathBuf {
        self.settings.systemd_dir.join(Self::unit_name(record))
    }

    fn site_available(&self, record: &InstanceRecord) -> PathBuf {
        self.settings.nginx_available_dir.join(&record.id)
    }

    fn site_enabled(&self, record: &InstanceRecord) -> PathBuf {
        self.settings.nginx_enabled_dir.join(&record.id)
    }

    fn sudo(&self, step: &str, args: &[&str]) -> Result<Output> {
        check(step, self.runner.run("sudo", args)?)
    }

    fn write_root_file(&self, step: &str, path: &Path, contents: &str) -> Result<()> {
        let target = path_arg(path);
        check(step, self.runner.run_with_stdin("sudo", &["tee", &target], contents.as_bytes())?)?;
        Ok(())
    }

    fn as_instance_user(&self, step: &str, record: &InstanceRecord, args: &[&str]) -> Result<Output> {
        let mut full = vec!["-u", record.id.as_str()];
        full.extend_from_slice(args);
        self.sudo(step, &full)
    }

    fn as_postgres(&self, step: &str, args: &[&str]) -> Result<Output> {
        let mut full = vec!["-u", "postgres"];
        full.extend_from_slice(args);
        self.sudo(step, &full)
    }

    fn chown_instance(&self, record: &InstanceRecord) -> Result<()> {
        let owner = format!("{0}:{0}", record.id);
        let dir = path_arg(&self.instance_dir(record));
        self.sudo("chown", &["chown", "-R", &owner, &dir])?;
        Ok(())
    }

    fn apt_install(&self, packages: &[&str]) -> Result<()> {
        let mut args = vec!["apt-get", "install", "-y"];
        args.extend_from_slice(packages);
        self.sudo("apt-get install", &args)?;
        Ok(())
    }

    fn install_wkhtmltopdf(&self) -> Result<()> {
        if self.settings.wkhtmltopdf_bin.exists() {
            return Ok(());
        }
        let url = wkhtmltopdf_url(std::env::consts::ARCH);
        info!("installing wkhtmltopdf");
        let package = tempfile::Builder::new()
            .prefix("wkhtmltox-")
            .suffix(".deb")
            .tempfile()
            .map_err(|e| ManagerError::collaborator("wkhtmltopdf", e))?;
        self.downloader.download(&url, package.path())?;
        self.apt_install(&[&path_arg(package.path())])
    }

    fn postgres_version(&self) -> Result<String> {
        let out = check("psql --version", self.runner.run("psql", &["--version"])?)?;
        let text = String::from_utf8_lossy(&out.stdout);
        parse_postgres_version(&text)
            .ok_or_else(|| ManagerError::collaborator("psql --version", format!("unrecognised output '{}'", text.trim())))
    }

    fn pg_hba_path(&self) -> Result<String> {
        let version = self.postgres_version()?;
        Ok(path_arg(&self.settings.postgres_config_dir.join(version).join("main").join("pg_hba.conf")))
    }

    fn restart_postgres(&self) -> Result<()> {
        self.sudo("restart postgresql", &["systemctl", "restart", "postgresql"])?;
        Ok(())
    }

    fn systemctl(&self, action: &str, record: &InstanceRecord) -> Result<()> {
        let unit = Self::unit_name(record);
        self.sudo(&format!("systemctl {}", action), &["systemctl", action, &unit])?;
        Ok(())
    }

    fn daemon_reload(&self) -> Result<()> {
        self.sudo("systemctl daemon-reload", &["systemctl", "daemon-reload"])?;
        Ok(())
    }
}

impl<R: CommandRunner, D: Downloader> PortProbe for SystemHost<R, D> {
    fn is_listening(&self, port: u16) -> bool {
        self.probe.is_listening(port)
    }
}

impl<R: CommandRunner, D: Downloader> PackageInstaller for SystemHost<R, D> {
    fn ensure_prerequisites(&self) -> Result<()> {
        let nginx_installed = self
            .settings
            .nginx_available_dir
            .parent()
            .map(Path::exists)
            .unwrap_or(false);
        if !nginx_installed {
            info!("installing nginx");
            self.apt_install(&["nginx"])?;
        }
        if !self.settings.postgres_config_dir.exists() {
            info!("installing PostgreSQL");
            self.apt_install(&["postgresql"])?;
        }
        if !self.settings.unzip_bin.exists() {
            info!("installing unzip");
            self.apt_install(&["unzip"])?;
        }
        self.apt_install(PYTHON_DEPENDENCIES)?;
        self.install_wkhtmltopdf()
    }

    fn create_venv(&self, record: &InstanceRecord) -> Result<()> {
        info!(id = %record.id, "creating venv");
        self.chown_instance(record)?;
        let venv = path_arg(&self.instance_dir(record).join("venv"));
        self.sudo("remove old venv", &["rm", "-rf", &venv])?;
        self.as_instance_user("python3 -m venv", record, &["python3", "-m", "venv", &venv])?;
        Ok(())
    }

    fn install_requirements(&self, record: &InstanceRecord) -> Result<()> {
        let dir = self.instance_dir(record);
        let pip_path = dir.join("venv").join("bin").join("pip");
        if !pip_path.exists() {
            self.create_venv(record)?;
        }
        let pip = path_arg(&pip_path);
        self.as_instance_user("pip upgrade", record, &[&pip, "install", "--upgrade", "pip", "wheel"])?;

        let requirements = dir.join("src").join("requirements.txt");
        if requirements.exists() {
            info!(id = %record.id, "installing requirements");
            let requirements = path_arg(&requirements);
            self.as_instance_user("pip install -r", record, &[&pip, "install", "-r", &requirements])?;
        } else {
            warn!(id = %record.id, "no requirements.txt in source tree");
        }

        for dependency in &record.dependencies {
            info!(id = %record.id, dependency = %dependency, "installing dependency");
            self.as_instance_user("pip install", record, &[&pip, "install", dependency])?;
        }
        Ok(())
    }
}

impl<R: CommandRunner, D: Downloader> AccountManager for SystemHost<R, D> {
    fn create_service_account(&self, record: &InstanceRecord) -> Result<()> {
        info!(id = %record.id, "creating user");
        let home = path_arg(&self.instance_dir(record));
        self.sudo("useradd", &["useradd", "-r", "-s", "/bin/bash", "-d", &home, &record.id])?;
        Ok(())
    }

    fn create_login(&self, record: &InstanceRecord, username: &str) -> Result<String> {
        let password = generate_password();
        let home = path_arg(&self.instance_dir(record));
        self.sudo("useradd", &["useradd", "-r", "-s", "/bin/bash", "-d", &home, username])?;
        let credentials = format!("{}:{}", username, password);
        check("chpasswd", self.runner.run_with_stdin("sudo", &["chpasswd"], credentials.as_bytes())?)?;
        self.sudo("usermod", &["usermod", "-a", "-G", &record.id, username])?;
        Ok(password)
    }

    fn delete_login(&self, username: &str) -> Result<()> {
        info!(username, "deleting user");
        self.sudo("userdel", &["userdel", username])?;
        Ok(())
    }

    fn delete_service_account(&self, record: &InstanceRecord) -> Result<()> {
        self.sudo("userdel", &["userdel", &record.id])?;
        Ok(())
    }

    fn password_auth_enabled(&self) -> bool {
        match fs::read_to_string(&self.settings.sshd_config) {
            Ok(config) => sshd_allows_passwords(&config),
            Err(e) => {
                debug!(error = %e, "cannot read sshd config");
                false
            }
        }
    }
}

impl<R: CommandRunner, D: Downloader> FilesystemLayout for SystemHost<R, D> {
    fn require_root(&self, operation: &'static str) -> Result<()> {
        if nix::unistd::geteuid().is_root() {
            Ok(())
        } else {
            Err(ManagerError::RootRequired { operation })
        }
    }

    fn create_layout(&self, record: &InstanceRecord) -> Result<()> {
        let dir = self.instance_dir(record);
        let subdirs: Vec<String> = LAYOUT_DIRS.iter().map(|d| path_arg(&dir.join(d))).collect();
        let mut args = vec!["mkdir", "-p"];
        args.extend(subdirs.iter().map(String::as_str));
        self.sudo("mkdir", &args)?;

        let addons = path_arg(&dir.join("custom_addons"));
        self.sudo("chmod", &["chmod", "-R", "775", &addons])?;
        self.chown_instance(record)
    }

    fn write_deployment_config(&self, record: &InstanceRecord, contents: &str) -> Result<()> {
        info!(id = %record.id, "writing odoo config");
        let path = self.instance_dir(record).join("odoo.conf");
        self.write_root_file("write odoo.conf", &path, contents)
    }
}

impl<R: CommandRunner, D: Downloader> DatabaseAdmin for SystemHost<R, D> {
    fn create_role(&self, record: &InstanceRecord) -> Result<()> {
        info!(id = %record.id, "creating PostgreSQL role");
        let pg_hba = self.pg_hba_path()?;
        self.as_postgres("createuser", &["createuser", "-d", "-r", "-s", &record.id])?;
        let insert = format!(
            "/# Database administrative login by Unix domain socket/i {}",
            pg_hba_line(&record.id)
        );
        self.sudo("edit pg_hba.conf", &["sed", "-i", &insert, &pg_hba])?;
        self.restart_postgres()
    }

    fn drop_role(&self, record: &InstanceRecord) -> Result<()> {
        info!(id = %record.id, "dropping PostgreSQL role and databases");
        let query = format!(
            "SELECT datname FROM pg_database WHERE datdba = (SELECT usesysid FROM pg_user WHERE usename = '{}')",
            record.id
        );
        let out = self.as_postgres("list databases", &["psql", "-At", "-c", &query])?;
        let listing = String::from_utf8_lossy(&out.stdout).into_owned();
        for database in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.as_postgres("dropdb", &["dropdb", "--if-exists", database])?;
        }
        self.as_postgres("dropuser", &["dropuser", "--if-exists", &record.id])?;

        let pg_hba = self.pg_hba_path()?;
        let delete = format!("\\%{}%d", pg_hba_line(&record.id));
        self.sudo("edit pg_hba.conf", &["sed", "-i", &delete, &pg_hba])?;
        self.restart_postgres()
    }
}

impl<R: CommandRunner, D: Downloader> ProcessSupervisor for SystemHost<R, D> {
    fn install_unit(&self, record: &InstanceRecord, contents: &str) -> Result<()> {
        info!(id = %record.id, "writing service unit");
        self.write_root_file("write service unit", &self.unit_path(record), contents)?;
        self.daemon_reload()
    }

    fn enable_unit(&self, record: &InstanceRecord) -> Result<()> {
        self.systemctl("enable", record)
    }

    fn disable_unit(&self, record: &InstanceRecord) -> Result<()> {
        self.systemctl("disable", record)
    }

    fn remove_unit(&self, record: &InstanceRecord) -> Result<()> {
        let unit = path_arg(&self.unit_path(record));
        self.sudo("remove service unit", &["rm", "-f", &unit])?;
        self.daemon_reload()
    }

    fn start_unit(&self, record: &InstanceRecord) -> Result<()> {
        self.systemctl("start", record)
    }

    fn stop_unit(&self, record: &InstanceRecord) -> Result<()> {
        self.systemctl("stop", record)
    }

    fn restart_unit(&self, record: &InstanceRecord) -> Result<()> {
        self.systemctl("restart", record)
    }

    fn unit_is_active(&self, record: &InstanceRecord) -> Result<bool> {
        let unit = Self::unit_name(record);
        let out = self.runner.run("sudo", &["systemctl", "is-active", "--quiet", &unit])?;
        Ok(out.status.success())
    }

    fn journal(&self, record: &InstanceRecord, lines: u32, follow: bool) -> Result<()> {
        let unit = Self::unit_name(record);
        let count = lines.to_string();
        let mut args = vec!["journalctl", "-u", unit.as_str(), "-n", count.as_str()];
        if follow {
            args.push("-f");
        }
        let status = self.runner.run_interactive("sudo", &args)?;
        // journalctl -f ends on Ctrl-C, which is not a failure.
        if !status.success() && !follow {
            return Err(ManagerError::collaborator("journalctl", format!("exited with {}", status)));
        }
        Ok(())
    }
}

impl<R: CommandRunner, D: Downloader> ReverseProxyManager for SystemHost<R, D> {
    fn install_site(&self, record: &InstanceRecord, contents: &str) -> Result<()> {
        info!(id = %record.id, "writing nginx config");
        self.write_root_file("write nginx site", &self.site_available(record), contents)
    }

    fn enable_site(&self, record: &InstanceRecord) -> Result<()> {
        let available = path_arg(&self.site_available(record));
        let enabled = path_arg(&self.site_enabled(record));
        self.sudo("enable nginx site", &["ln", "-sf", &available, &enabled])?;
        Ok(())
    }

    fn remove_site(&self, record: &InstanceRecord) -> Result<()> {
        let available = path_arg(&self.site_available(record));
        let enabled = path_arg(&self.site_enabled(record));
        self.sudo("disable nginx site", &["rm", "-f", &enabled])?;
        self.sudo("remove nginx site", &["rm", "-f", &available])?;
        self.reload_proxy()
    }

    fn reload_proxy(&self) -> Result<()> {
        self.sudo("nginx reload", &["nginx", "-s", "reload"])?;
        Ok(())
    }
}

impl<R: CommandRunner, D: Downloader> Firewall for SystemHost<R, D> {
    fn firewall_enabled(&self) -> bool {
        match self.runner.run("sudo", &["ufw", "status"]) {
            Ok(out) => out.status.success() && ufw_is_active(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                debug!(error = %e, "cannot query ufw");
                false
            }
        }
    }
}

impl<R: CommandRunner, D: Downloader> SourceFetcher for SystemHost<R, D> {
    fn fetch_source(&self, record: &InstanceRecord, nightly: Option<NaiveDate>) -> Result<()> {
        let dir = self.instance_dir(record);
        let staging = dir.join("update_temp");
        let staging_arg = path_arg(&staging);
        let src = path_arg(&dir.join("src"));

        self.sudo("clear staging", &["rm", "-rf", &staging_arg])?;
        self.sudo("mkdir", &["mkdir", "-p", &staging_arg])?;
        self.sudo("remove old source", &["rm", "-rf", &src])?;

        let url = nightly_url(&self.settings.nightly_base_url, &record.version, nightly);
        let archive = tempfile::Builder::new()
            .prefix("odoo-")
            .suffix(".zip")
            .tempfile()
            .map_err(|e| ManagerError::collaborator("download", e))?;
        self.downloader.download(&url, archive.path())?;

        info!(id = %record.id, "unpacking source");
        let archive_arg = path_arg(archive.path());
        self.sudo("unzip", &["unzip", "-q", &archive_arg, "-d", &staging_arg])?;

        let extracted = path_arg(&single_subdir(&staging)?);
        self.sudo("move source", &["mv", &extracted, &src])?;

        let launcher = path_arg(&dir.join("src").join("setup").join("odoo"));
        let odoo_bin = path_arg(&dir.join("src").join("odoo-bin"));
        self.sudo("copy odoo-bin", &["cp", &launcher, &odoo_bin])?;
        self.sudo("clear staging", &["rm", "-rf", &staging_arg])?;
        self.chown_instance(record)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The archive unpacks into one top-level directory whose name carries the build date.
fn single_subdir(dir: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(dir).map_err(|source| ManagerError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
        .ok_or_else(|| ManagerError::collaborator("unzip", "archive contained no directory"))
}

pub fn nightly_url(base: &str, version: &str, nightly: Option<NaiveDate>) -> String {
    let build = match nightly {
        Some(date) => date.format("%Y%m%d").to_string(),
        None => "latest".to_string(),
    };
    format!(
        "{}/{v}/nightly/src/odoo_{v}.{b}.zip",
        base.trim_end_matches('/'),
        v = version,
        b = build
    )
}

pub fn wkhtmltopdf_url(arch: &str) -> String {
    let deb_arch = if arch.contains("arm") || arch == "aarch64" { "arm64" } else { "amd64" };
    format!("{}/wkhtmltox_0.12.6.1-2.jammy_{}.deb", WKHTMLTOPDF_RELEASE, deb_arch)
}

/// Major version as used in `/etc/postgresql/<version>`, from `psql --version`.
pub fn parse_postgres_version(output: &str) -> Option<String> {
    let number = output.split_whitespace().nth(2)?;
    let mut parts = number.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    if major >= 10 {
        return Some(major.to_string());
    }
    // Before 10 the directory carries the minor version too, e.g. 9.6.
    let minor: u32 = parts.next()?.parse().ok()?;
    Some(format!("{}.{}", major, minor))
}

fn pg_hba_line(role: &str) -> String {
    format!("host    all    {}    127.0.0.1/32    trust", role)
}

fn ufw_is_active(status: &str) -> bool {
    status
        .lines()
        .any(|l| l.trim().eq_ignore_ascii_case("status: active"))
}

fn sshd_allows_passwords(config: &str) -> bool {
    config
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("PasswordAuthentication"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .last()
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<String>>,
        stdin: RefCell<Vec<String>>,
        // (command prefix, exit code, stdout)
        replies: Vec<(&'static str, i32, &'static str)>,
    }

    impl RecordingRunner {
        fn replying(replies: Vec<(&'static str, i32, &'static str)>) -> Self {
            Self {
                replies,
                ..Self::default()
            }
        }

        fn reply(&self, line: &str) -> Output {
            let (code, stdout) = self
                .replies
                .iter()
                .find(|(prefix, _, _)| line.starts_with(prefix))
                .map(|(_, code, out)| (*code, *out))
                .unwrap_or((0, ""));
            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.as_bytes().to_vec(),
                stderr: if code == 0 { Vec::new() } else { b"denied".to_vec() },
            }
        }

        fn record(&self, program: &str, args: &[&str]) -> String {
            let line = std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ");
            self.calls.borrow_mut().push(line.clone());
            line
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
            let line = self.record(program, args);
            Ok(self.reply(&line))
        }

        fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
            let line = self.record(program, args);
            self.stdin.borrow_mut().push(String::from_utf8_lossy(stdin).into_owned());
            Ok(self.reply(&line))
        }

        fn run_interactive(&self, program: &str, args: &[&str]) -> Result<ExitStatus> {
            let line = self.record(program, args);
            Ok(self.reply(&line).status)
        }
    }

    struct NoDownload;

    impl Downloader for NoDownload {
        fn download(&self, _url: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn settings(root: &Path) -> Settings {
        Settings {
            install_root: root.join("opt"),
            systemd_dir: root.join("systemd"),
            nginx_available_dir: root.join("nginx/sites-available"),
            nginx_enabled_dir: root.join("nginx/sites-enabled"),
            postgres_config_dir: root.join("postgresql"),
            sshd_config: root.join("sshd_config"),
            unzip_bin: root.join("unzip"),
            wkhtmltopdf_bin: root.join("wkhtmltopdf"),
            ..Settings::default()
        }
    }

    fn record() -> InstanceRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        InstanceRecord::new("17.0", at, 8069, 8072)
    }

    fn host(root: &Path, runner: RecordingRunner) -> SystemHost<RecordingRunner, NoDownload> {
        SystemHost::with_parts(settings(root), runner, NoDownload)
    }

    #[test]
    fn service_account_uses_instance_dir_as_home() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        host.create_service_account(&rec).unwrap();

        let home = tmp.path().join("opt").join(&rec.id);
        assert_eq!(
            host.runner().calls(),
            vec![format!("sudo useradd -r -s /bin/bash -d {} {}", home.display(), rec.id)]
        );
    }

    #[test]
    fn files_are_written_through_sudo_tee() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        host.install_unit(&rec, "[Unit]\n").unwrap();

        let calls = host.runner().calls();
        let unit = tmp.path().join("systemd").join(format!("{}.service", rec.id));
        assert_eq!(calls[0], format!("sudo tee {}", unit.display()));
        assert_eq!(calls[1], "sudo systemctl daemon-reload");
        assert_eq!(host.runner().stdin.borrow()[0], "[Unit]\n");
    }

    #[test]
    fn failing_command_names_the_step() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::replying(vec![("sudo useradd", 9, "")]));
        let err = host.create_service_account(&record()).unwrap_err();
        match err {
            ManagerError::CollaboratorCallFailed { step, detail } => {
                assert_eq!(step, "useradd");
                assert!(detail.contains("denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn login_gets_password_and_group() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        let password = host.create_login(&rec, "alice").unwrap();

        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        let calls = host.runner().calls();
        assert_eq!(calls[1], "sudo chpasswd");
        assert_eq!(calls[2], format!("sudo usermod -a -G {} alice", rec.id));
        assert_eq!(host.runner().stdin.borrow()[0], format!("alice:{}", password));
    }

    #[test]
    fn role_is_created_with_trust_line_for_detected_version() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::replying(vec![("psql --version", 0, "psql (PostgreSQL) 14.10 (Ubuntu 14.10-0ubuntu0.22.04.1)\n")]);
        let host = host(tmp.path(), runner);
        let rec = record();
        host.create_role(&rec).unwrap();

        let calls = host.runner().calls();
        let pg_hba = tmp.path().join("postgresql/14/main/pg_hba.conf");
        assert_eq!(calls[1], format!("sudo -u postgres createuser -d -r -s {}", rec.id));
        assert!(calls[2].starts_with("sudo sed -i /# Database administrative login"));
        assert!(calls[2].ends_with(&format!("127.0.0.1/32    trust {}", pg_hba.display())));
        assert_eq!(calls[3], "sudo systemctl restart postgresql");
    }

    #[test]
    fn dropping_a_role_drops_owned_databases_first() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::replying(vec![
            ("sudo -u postgres psql", 0, "acme\nacme_test\n"),
            ("psql --version", 0, "psql (PostgreSQL) 16.2\n"),
        ]);
        let host = host(tmp.path(), runner);
        let rec = record();
        host.drop_role(&rec).unwrap();

        let calls = host.runner().calls();
        assert_eq!(calls[1], "sudo -u postgres dropdb --if-exists acme");
        assert_eq!(calls[2], "sudo -u postgres dropdb --if-exists acme_test");
        assert_eq!(calls[3], format!("sudo -u postgres dropuser --if-exists {}", rec.id));
        assert!(calls[5].contains(&format!("\\%host    all    {}    127.0.0.1/32    trust%d", rec.id)));
    }

    #[test]
    fn inactive_unit_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::replying(vec![("sudo systemctl is-active", 3, "")]));
        assert!(!host.unit_is_active(&record()).unwrap());
    }

    #[test]
    fn requirements_then_extra_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let mut rec = record();
        rec.add_dependency("pandas");
        let dir = tmp.path().join("opt").join(&rec.id);
        fs::create_dir_all(dir.join("venv/bin")).unwrap();
        fs::write(dir.join("venv/bin/pip"), "").unwrap();
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/requirements.txt"), "lxml\n").unwrap();

        host.install_requirements(&rec).unwrap();

        let pip = dir.join("venv/bin/pip");
        let calls = host.runner().calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].ends_with(&format!("{} install -r {}", pip.display(), dir.join("src/requirements.txt").display())));
        assert_eq!(calls[2], format!("sudo -u {} {} install pandas", rec.id, pip.display()));
    }

    #[test]
    fn missing_venv_is_created_before_installing() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        host.install_requirements(&rec).unwrap();
        assert!(host.runner().calls().iter().any(|c| c.contains("python3 -m venv")));
    }

    #[test]
    fn fetch_moves_the_unpacked_tree_into_src() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        let staging = tmp.path().join("opt").join(&rec.id).join("update_temp");
        fs::create_dir_all(staging.join("odoo-17.0.post20240301")).unwrap();

        host.fetch_source(&rec, None).unwrap();

        let calls = host.runner().calls();
        let src = tmp.path().join("opt").join(&rec.id).join("src");
        assert!(calls.iter().any(|c| c.starts_with("sudo unzip -q")));
        assert!(calls.contains(&format!(
            "sudo mv {} {}",
            staging.join("odoo-17.0.post20240301").display(),
            src.display()
        )));
        assert!(calls.iter().any(|c| c.ends_with(&format!("{}", src.join("odoo-bin").display()))));
    }

    #[test]
    fn prerequisites_only_install_what_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nginx/sites-available")).unwrap();
        fs::create_dir_all(tmp.path().join("postgresql")).unwrap();
        fs::write(tmp.path().join("unzip"), "").unwrap();
        fs::write(tmp.path().join("wkhtmltopdf"), "").unwrap();
        let host = host(tmp.path(), RecordingRunner::default());

        host.ensure_prerequisites().unwrap();

        let calls = host.runner().calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("sudo apt-get install -y build-essential"));
    }

    #[test]
    fn journal_follow_passes_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let rec = record();
        host.journal(&rec, 50, true).unwrap();
        assert_eq!(
            host.runner().calls(),
            vec![format!("sudo journalctl -u {}.service -n 50 -f", rec.id)]
        );
    }

    #[test]
    fn nightly_urls() {
        assert_eq!(
            nightly_url("https://nightly.odoo.com/", "17.0", None),
            "https://nightly.odoo.com/17.0/nightly/src/odoo_17.0.latest.zip"
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            nightly_url("https://nightly.odoo.com", "16.0", Some(date)),
            "https://nightly.odoo.com/16.0/nightly/src/odoo_16.0.20240301.zip"
        );
    }

    #[test]
    fn wkhtmltopdf_package_follows_architecture() {
        assert!(wkhtmltopdf_url("aarch64").ends_with("jammy_arm64.deb"));
        assert!(wkhtmltopdf_url("x86_64").ends_with("jammy_amd64.deb"));
    }

    #[test]
    fn postgres_versions() {
        assert_eq!(parse_postgres_version("psql (PostgreSQL) 14.10 (Ubuntu)\n").as_deref(), Some("14"));
        assert_eq!(parse_postgres_version("psql (PostgreSQL) 9.6.24\n").as_deref(), Some("9.6"));
        assert_eq!(parse_postgres_version("command not found"), None);
    }

    #[test]
    fn sshd_password_setting() {
        assert!(sshd_allows_passwords("# comment\nPasswordAuthentication yes\n"));
        assert!(!sshd_allows_passwords("PasswordAuthentication no\n"));
        assert!(!sshd_allows_passwords("#PasswordAuthentication yes\n"));
        assert!(!sshd_allows_passwords(""));
    }

    #[test]
    fn firewall_reported_only_when_ufw_is_active() {
        let tmp = tempfile::tempdir().unwrap();
        let active = host(tmp.path(), RecordingRunner::replying(vec![("sudo ufw status", 0, "Status: active\n\nTo Action From\n")]));
        assert!(active.firewall_enabled());
        assert_eq!(active.runner().calls(), vec!["sudo ufw status"]);

        let inactive = host(tmp.path(), RecordingRunner::replying(vec![("sudo ufw status", 0, "Status: inactive\n")]));
        assert!(!inactive.firewall_enabled());

        let missing = host(tmp.path(), RecordingRunner::replying(vec![("sudo ufw status", 1, "")]));
        assert!(!missing.firewall_enabled());
    }

    #[test]
    fn root_check_follows_effective_uid() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path(), RecordingRunner::default());
        let result = host.require_root("create");
        if nix::unistd::geteuid().is_root() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(ManagerError::RootRequired { operation: "create" })));
        }
        assert!(host.runner().calls().is_empty());
    }
}
