use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xenhost_core::config::LoggingConfig;
use xenhost_core::{
    standard_chain, standard_dispatcher, AgentConfig, ClusterVmStateCache, Command,
    HostConnector, HypervisorRegistry, RotatingCredentials, SshExecutor,
};

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "xenhost")]
#[command(about = "Hypervisor host agent core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Connect to the configured host and run one command
    Exec {
        /// Agent configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Command as JSON, e.g. '{"kind":"get_host_stats"}'
        #[arg(long, conflicts_with = "command_file")]
        command: Option<String>,

        /// File containing the command as JSON
        #[arg(long)]
        command_file: Option<PathBuf>,
    },
    /// List known releases and what each one enables
    Releases,
    /// List available hypervisor backends
    Backends,
    /// Load and validate a configuration file
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("xenhost={}", logging.level).parse()?)
        .add_directive(format!("xenhost_core={}", logging.level).parse()?);

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn read_command(command: Option<String>, command_file: Option<PathBuf>) -> Result<Command> {
    let json = match (command, command_file) {
        (Some(json), _) => json,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read command file {}", path.display()))?,
        (None, None) => bail!("either --command or --command-file is required"),
    };
    serde_json::from_str(&json).context("Invalid command JSON")
}

async fn exec(config: AgentConfig, command: Command) -> Result<bool> {
    let registry = HypervisorRegistry::default();
    let api = registry.create(&config)?;
    let chain = Arc::new(standard_chain()?);
    let dispatcher = standard_dispatcher(chain.clone())?;

    let connector = HostConnector::new(
        api,
        chain,
        Arc::new(ClusterVmStateCache::new()),
        Arc::new(SshExecutor::new(SSH_CONNECT_TIMEOUT)),
        Arc::new(RotatingCredentials::new(
            config.host.credentials.passwords.clone(),
        )),
    );
    let ctx = connector
        .connect(&config)
        .await
        .with_context(|| format!("Failed to connect to host {}", config.host.ip))?;

    let answer = dispatcher.execute(&ctx, &command).await;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(answer.success)
}

fn print_releases() -> Result<()> {
    let chain = standard_chain()?;
    println!(
        "{:<18} {:<24} {:<22} {:<8} {:<8} {:<6}",
        "RELEASE", "MATCHES", "PATCH", "VIFPLUG", "STORAGE", "GPU"
    );
    for tag in chain.releases() {
        let behavior = chain.resolve_all(&tag.name)?;
        let matches = match &tag.required_hotfix {
            Some(hotfix) => format!(">= {} + {}", tag.version, hotfix),
            None => format!(">= {}", tag.version),
        };
        println!(
            "{:<18} {:<24} {:<22} {:<8} {:<8} {:<6}",
            tag.name,
            matches,
            behavior.patch_bundle.display(),
            behavior.dom0_vif_plug,
            behavior.supports_storage_motion(),
            behavior.gpu_support
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Exec {
            config,
            command,
            command_file,
        } => {
            let config = load_config(&config)?;
            init_logging(&config.logging)?;
            let command = read_command(command, command_file)?;
            info!(kind = %command.kind(), "Running command against {}", config.host.ip);

            if !exec(config, command).await? {
                std::process::exit(1);
            }
        }
        Commands::Releases => print_releases()?,
        Commands::Backends => {
            for backend in HypervisorRegistry::default().list_available_backends() {
                println!("{}", backend);
            }
        }
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            println!(
                "Configuration OK: host {} ({}) in pool {}, backend '{}'",
                config.host.host_uuid,
                config.host.ip,
                config.host.pool_uuid,
                config.hypervisor_backend
            );
        }
    }

    Ok(())
}
