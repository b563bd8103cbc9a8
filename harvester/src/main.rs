//! `galadriel-harvester` binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use galadriel_harvester::clock::{Clock, SystemClock};
use galadriel_harvester::config::{Config, LoggingConfig};
use galadriel_harvester::{
    integrity, ConsentStatus, Engine, HubClient, HubError, SpireServer, UpstreamError,
};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_RUNTIME_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "galadriel-harvester")]
#[command(version, about = "Federates SPIFFE trust bundles through the Galadriel hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the bundle federation engine until SIGINT or SIGTERM.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "harvester.toml")]
        config: PathBuf,
        /// One-time enrollment token; overrides `join_token` in the file.
        #[arg(long)]
        join_token: Option<String>,
    },
    /// Manages federation relationships of the local trust domain.
    #[command(subcommand)]
    Relationship(RelationshipCommand),
}

#[derive(Subcommand, Debug)]
enum RelationshipCommand {
    /// Lists relationships.
    List {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "harvester.toml")]
        config: PathBuf,
        /// Only show relationships with this consent status.
        #[arg(long)]
        status: Option<Consent>,
    },
    /// Approves a relationship.
    Approve {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "harvester.toml")]
        config: PathBuf,
        /// Relationship ID.
        #[arg(long)]
        id: Uuid,
    },
    /// Denies a relationship.
    Deny {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "harvester.toml")]
        config: PathBuf,
        /// Relationship ID.
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Consent {
    Approved,
    Denied,
    Pending,
}

impl From<Consent> for ConsentStatus {
    fn from(value: Consent) -> Self {
        match value {
            Consent::Approved => ConsentStatus::Approved,
            Consent::Denied => ConsentStatus::Denied,
            Consent::Pending => ConsentStatus::Pending,
        }
    }
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Integrity(#[from] integrity::ConfigError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("failed registering signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Command::Run { config, .. } => config,
        Command::Relationship(
            RelationshipCommand::List { config, .. }
            | RelationshipCommand::Approve { config, .. }
            | RelationshipCommand::Deny { config, .. },
        ) => config,
    };
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("galadriel-harvester: {e}");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    init_logging(&config.logging);

    match cli.command {
        Command::Run { join_token, .. } => run(config, join_token).await,
        Command::Relationship(command) => match relationship(&config, command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Relationship command failed");
                ExitCode::from(EXIT_STARTUP_FAILURE)
            }
        },
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: Config, join_token: Option<String>) -> ExitCode {
    let cancel = CancellationToken::new();

    let engine = match start(&config, join_token, &cancel).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed starting harvester");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    match engine.run(cancel).await {
        Ok(()) => {
            info!("Harvester stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Harvester stopped on error");
            ExitCode::from(EXIT_RUNTIME_FAILURE)
        }
    }
}

async fn start(
    config: &Config,
    join_token: Option<String>,
    cancel: &CancellationToken,
) -> Result<Engine, StartupError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let signer = config.integrity.build_signer(Arc::clone(&clock))?;
    let verifier = config.integrity.build_verifier(clock)?;

    let hub = HubClient::connect(&config.hub_client_config()).await?;
    match join_token.or_else(|| config.harvester.join_token.clone()) {
        Some(token) if !hub.is_onboarded() => hub.enroll(&token).await?,
        Some(_) => info!("Bearer token already present; ignoring join token"),
        None if !hub.is_onboarded() => {
            return Err(HubError::NotOnboarded(format!(
                "no bearer token in {} and no join token given",
                config.harvester.data_dir.display()
            ))
            .into());
        }
        None => {}
    }

    let spire = SpireServer::new(&config.harvester.spire_socket_path).await?;
    spawn_signal_handler(cancel.clone())?;

    info!(
        trust_domain = %config.harvester.trust_domain,
        server_address = %config.harvester.server_address,
        spire_socket_path = %config.harvester.spire_socket_path,
        "Starting harvester"
    );
    Ok(Engine::new(
        config.harvester.trust_domain.clone(),
        Arc::new(spire),
        Arc::new(hub),
        signer,
        verifier,
        config.intervals(),
    ))
}

fn spawn_signal_handler(cancel: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}

async fn relationship(config: &Config, command: RelationshipCommand) -> Result<(), HubError> {
    let hub = HubClient::connect(&config.hub_client_config()).await?;

    match command {
        RelationshipCommand::List { status, .. } => {
            for r in hub.get_relationships(status.map(ConsentStatus::from)).await? {
                println!(
                    "{}\t{} ({})\t{} ({})",
                    r.id,
                    r.trust_domain_a_name,
                    r.trust_domain_a_consent,
                    r.trust_domain_b_name,
                    r.trust_domain_b_consent
                );
            }
        }
        RelationshipCommand::Approve { id, .. } => {
            let r = hub.update_relationship(id, ConsentStatus::Approved).await?;
            println!("{}\tapproved", r.id);
        }
        RelationshipCommand::Deny { id, .. } => {
            let r = hub.update_relationship(id, ConsentStatus::Denied).await?;
            println!("{}\tdenied", r.id);
        }
    }
    Ok(())
}
