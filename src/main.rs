use shipyard::bundle::{FormatRegistry, SecretBundle};
use shipyard::config::{ConfigManager, LogFormat, ObservabilityConfig};
use shipyard::service::{DeployParams, Service};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "shipyard", about = "Single-slot deployment orchestrator")]
struct Opt {
    /// Path to configuration file
    #[structopt(short, long, parse(from_os_str), env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Parse and validate a secret bundle without deploying
    Check {
        /// Bundle file
        #[structopt(short, long, parse(from_os_str))]
        bundle: PathBuf,

        /// Bundle format; defaults to the file extension
        #[structopt(short, long)]
        format: Option<String>,

        /// Print values instead of redacting them
        #[structopt(long)]
        show_values: bool,
    },

    /// Deploy a repository and hold it until interrupted
    Deploy {
        /// Bundle file
        #[structopt(short, long, parse(from_os_str))]
        bundle: PathBuf,

        /// Owning user id
        #[structopt(short, long)]
        user: String,

        /// Project name, published as the subdomain
        #[structopt(short, long)]
        name: String,

        /// Repository URL
        #[structopt(short, long)]
        repo: String,

        /// Bundle format; defaults to the file extension
        #[structopt(short, long)]
        format: Option<String>,

        /// Exit after a successful start, leaving the services running
        #[structopt(long)]
        detach: bool,
    },

    /// Ensure a user's encryption key exists and print its id
    Keys {
        /// User id
        #[structopt(short, long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let opt = Opt::from_args();

    // Load configuration
    let config_manager = match &opt.config {
        Some(path) => Some(ConfigManager::load_from_file(path)?),
        None => None,
    };
    let defaults = ConfigManager::default_config();
    let observability = config_manager
        .as_ref()
        .map(|m| &m.get_config().observability)
        .unwrap_or(&defaults.observability);

    // Initialize tracing
    init_tracing(observability);
    info!("Shipyard {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &opt.config {
        info!("Configuration loaded from {}", path.display());
    }

    if observability.metrics.enabled {
        init_metrics(observability)?;
    }

    match opt.command {
        Command::Check {
            bundle,
            format,
            show_values,
        } => {
            let required = config_manager
                .as_ref()
                .map(|m| m.get_config().deployment.required_variables.clone())
                .unwrap_or_else(|| defaults.deployment.required_variables.clone());

            let bundle = read_bundle(&bundle, format)?;
            let settings = bundle.convert(&FormatRegistry::with_defaults(), &required)?;

            for (key, value) in settings.iter() {
                if show_values {
                    println!("{}={}", key, value);
                } else {
                    println!("{}=<redacted>", key);
                }
            }
            info!("Bundle is valid ({} variables)", settings.len());
        }

        Command::Deploy {
            bundle,
            user,
            name,
            repo,
            format,
            detach,
        } => {
            let service = build_service(config_manager)?;
            let params = DeployParams::new(read_bundle(&bundle, format)?, user, name.clone(), repo);

            if !service.start(params).await? {
                error!("{} did not start: the build or the bring-up failed", name);
                service.shutdown().await?;
                return Err(format!("{} did not start", name).into());
            }

            if detach {
                info!("{} is running, detaching", name);
                service.shutdown().await?;
                return Ok(());
            }

            wait_for_shutdown().await?;

            info!("Stopping {}...", name);
            if let Err(e) = service.stop().await {
                warn!("Stop finished with errors: {}", e);
            }
            service.shutdown().await?;
        }

        Command::Keys { user } => {
            let service = build_service(config_manager)?;
            let key_id = service.ensure_key(&user).await?;
            println!("{}", key_id);
            service.shutdown().await?;
        }
    }

    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(observability.logging.level.as_directive()));

    match observability.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn init_metrics(observability: &ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = observability
        .metrics
        .listen_addr
        .as_deref()
        .unwrap_or("127.0.0.1:9000")
        .parse()?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("Prometheus metrics on http://{}/metrics", addr);

    Ok(())
}

fn build_service(config_manager: Option<ConfigManager>) -> Result<Service, Box<dyn std::error::Error>> {
    let mut config_manager = config_manager.ok_or("a configuration file is required (--config or SHIPYARD_CONFIG)")?;
    Ok(Service::from_config_manager(&mut config_manager)?)
}

fn read_bundle(path: &Path, format: Option<String>) -> Result<SecretBundle, Box<dyn std::error::Error>> {
    let format = format
        .or_else(|| path.extension().map(|e| e.to_string_lossy().into_owned()))
        .ok_or("bundle format unknown; pass --format")?;
    let content = std::fs::read_to_string(path)?;
    Ok(SecretBundle::new(content, format))
}

async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    // Create a shutdown channel
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    // Set up signal handling
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down...");
        }
        let _ = shutdown_tx.send(()).await;
    });

    // Wait for shutdown signal
    shutdown_rx.recv().await;
    Ok(())
}
