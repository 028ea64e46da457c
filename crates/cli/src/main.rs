use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use common::{ArtifactKind, InstanceRecord, InstanceState, TemplateNames};
use manager::{CreateRequest, Settings};
use owo_colors::{OwoColorize, Stream::Stdout};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "odoo-manager", author, version, about = "Provision and manage Odoo instances on this host", long_about = None)]
struct Cli {
    /// Settings file (JSON). Defaults to ~/.config/odoo-manager/config.json when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding one subdirectory per instance
    #[arg(long, global = true, env = "ODOO_MANAGER_ROOT")]
    root: Option<PathBuf>,

    /// Directory searched for named templates before the built-in ones
    #[arg(long, global = true, env = "ODOO_MANAGER_TEMPLATES")]
    templates: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all instances
    List {
        /// Print a detail block per instance
        #[arg(short, long)]
        details: bool,
    },
    /// Provision a new instance
    Create {
        /// Odoo version (e.g. 17.0)
        #[arg(short = 'v', long)]
        version: String,

        /// HTTP port
        #[arg(short = 'p', long)]
        port: u16,

        /// Longpolling / websocket port
        #[arg(short = 'l', long)]
        longpolling_port: u16,

        /// Friendly name
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Hostname served by nginx (default: <id>.example.com)
        #[arg(short = 's', long)]
        server_name: Option<String>,

        #[arg(long, default_value = common::DEFAULT_TEMPLATE)]
        odoo_template: String,

        #[arg(long, default_value = common::DEFAULT_TEMPLATE)]
        service_template: String,

        #[arg(long, default_value = common::DEFAULT_TEMPLATE)]
        nginx_template: String,
    },
    /// Fetch fresh code, reinstall dependencies and restart
    Update {
        #[arg(short, long)]
        instance: String,

        /// Use the nightly build of this date (YYYYMMDD) instead of the latest
        #[arg(short = 'd', long, value_parser = parse_nightly)]
        date: Option<NaiveDate>,
    },
    /// Add a Python package to an instance
    #[command(name = "add_dependency")]
    AddDependency {
        #[arg(short, long)]
        instance: String,

        #[arg(short = 'd', long)]
        dependency: String,
    },
    /// Create a login with access to an instance
    #[command(name = "add_user")]
    AddUser {
        #[arg(short, long)]
        instance: String,

        #[arg(short, long)]
        username: String,
    },
    /// Regenerate one config file from its template
    Reset {
        #[arg(short, long)]
        instance: String,

        /// odoo, nginx or service
        #[arg(short, long)]
        target: ArtifactKind,
    },
    /// Tear an instance down completely
    Delete {
        #[arg(short, long)]
        instance: String,
    },
    /// Show the instance's service logs
    Journal {
        #[arg(short, long)]
        instance: String,

        #[arg(short = 'n', long, default_value_t = 100)]
        lines: u32,

        #[arg(short, long)]
        follow: bool,
    },
    /// Start an instance's service
    Start {
        #[arg(short, long)]
        instance: String,
    },
    /// Stop an instance's service
    Stop {
        #[arg(short, long)]
        instance: String,
    },
    /// Restart an instance's service
    Restart {
        #[arg(short, long)]
        instance: String,
    },
    /// Show one instance
    Status {
        #[arg(short, long)]
        instance: String,
    },
}

fn parse_nightly(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| format!("'{}' is not a date in YYYYMMDD form", value))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(root) = &cli.root {
        settings.install_root = root.clone();
    }
    if let Some(dir) = &cli.templates {
        settings.templates_dir = Some(dir.clone());
    }
    debug!(root = %settings.install_root.display(), "settings loaded");
    Ok(settings)
}

fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli)?;
    let manager = manager::system_manager(&settings);

    match cli.command {
        Commands::List { details } => {
            let instances = manager.list()?;
            if instances.is_empty() {
                println!("No instances in {}", settings.install_root.display());
            }
            for (record, state) in instances {
                let label = state_label(state);
                if details {
                    print!("{}", format_details(&record, &label));
                } else {
                    println!("{}", format_summary(&record, &label));
                }
            }
        }
        Commands::Create {
            version,
            port,
            longpolling_port,
            name,
            server_name,
            odoo_template,
            service_template,
            nginx_template,
        } => {
            let request = CreateRequest {
                version,
                http_port: port,
                event_port: longpolling_port,
                display_name: name,
                server_name,
                templates: TemplateNames {
                    odoo: odoo_template,
                    service: service_template,
                    nginx: nginx_template,
                },
            };
            let record = manager.create(request).context("creating instance")?;
            println!("Created instance {}", record.id);
            println!("Serving {} on ports {}/{}", record.effective_server_name(), record.http_port, record.event_port);
        }
        Commands::Update { instance, date } => {
            let record = manager.update(&instance, date)?;
            println!("Updated {} ({})", record.id, record.version);
        }
        Commands::AddDependency { instance, dependency } => {
            let record = manager.add_dependency(&instance, &dependency)?;
            println!("Dependencies of {}: {}", record.id, record.dependencies.join(", "));
        }
        Commands::AddUser { instance, username } => {
            let login = manager.add_user(&instance, &username)?;
            println!("Created user {} with password {}", login.username, login.password);
            if !login.ssh_password_auth {
                println!("Password authentication is not enabled for ssh. Enable it to connect to the instance via ssh.");
            }
        }
        Commands::Reset { instance, target } => {
            let record = manager.reset(&instance, target)?;
            println!("Regenerated {} config for {}", target, record.id);
        }
        Commands::Delete { instance } => {
            let record = manager.delete(&instance)?;
            println!("Deleted instance {}", record.id);
        }
        Commands::Journal { instance, lines, follow } => {
            manager.journal(&instance, lines, follow)?;
        }
        Commands::Start { instance } => {
            let state = manager.start(&instance)?;
            println!("{}: {}", instance, state_label(state));
        }
        Commands::Stop { instance } => {
            let state = manager.stop(&instance)?;
            println!("{}: {}", instance, state_label(state));
        }
        Commands::Restart { instance } => {
            let state = manager.restart(&instance)?;
            println!("{}: {}", instance, state_label(state));
        }
        Commands::Status { instance } => {
            let (record, state) = manager.get(&instance)?;
            print!("{}", format_details(&record, &state_label(state)));
        }
    }

    Ok(())
}

fn state_label(state: InstanceState) -> String {
    match state {
        InstanceState::Active => state.label().if_supports_color(Stdout, |t| t.green()).to_string(),
        InstanceState::Stopped => state.label().if_supports_color(Stdout, |t| t.red()).to_string(),
        _ => state.label().if_supports_color(Stdout, |t| t.yellow()).to_string(),
    }
}

fn format_summary(record: &InstanceRecord, state: &str) -> String {
    match &record.display_name {
        Some(name) => format!("{} - {} - {} ({})", record.id, record.version, state, name),
        None => format!("{} - {} - {}", record.id, record.version, state),
    }
}

fn format_details(record: &InstanceRecord, state: &str) -> String {
    let mut out = format!("{} ({}):\n", record.id, state);
    let mut field = |label: &str, value: String| {
        out.push_str(&format!("    {:<21}: {}\n", label, value));
    };
    if let Some(name) = &record.display_name {
        field("Name", name.clone());
    }
    field("Instance name", record.id.clone());
    field("Odoo version", record.version.clone());
    field("Server name", record.effective_server_name());
    field("Port", record.http_port.to_string());
    field("Longpolling port", record.event_port.to_string());
    field("Create datetime", record.created_at.format("%Y-%m-%d %H:%M:%S").to_string());
    field(
        "Last update datetime",
        record
            .last_updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string()),
    );
    if !record.dependencies.is_empty() {
        field("Dependencies", record.dependencies.join(", "));
    }
    if !record.users.is_empty() {
        field("Users", record.users.join(", "));
    }
    out
}
