//! `run-agent` command-line entry point.
//!
//! Loads `run-agent.toml`, wires the coordinator client, token store, event
//! bus and driver together, then listens for runs until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use run_agent::agent::{Agent, AgentSettings};
use run_agent::auth::{Authorizer, MemoryTokenStore, RedisTokenStore, TokenStore};
use run_agent::bus::{CoordinatorNotifier, EventBus};
use run_agent::driver::Driver;
use run_agent::driver::docker::{BollardEngine, DockerDriver, DockerOptions};
use run_agent::driver::inline::{InlineDriver, InlineOptions};
use run_agent::driver::kubernetes::{KubePods, KubernetesDriver, KubernetesOptions};
use run_agent::exit_codes;
use run_agent::io::config::{
    AgentConfig, DEFAULT_CONFIG_PATH, DriverKind, TokenStoreConfig, TokenStoreKind, load_config,
    write_config,
};
use run_agent::io::coordinator::{Coordinator, HttpCoordinator};
use run_agent::listener::{AmqpSource, BrokerListener, Listener, PollingListener};
use run_agent::logging;
use run_agent::server::{self, CallbackState};

#[derive(Parser)]
#[command(
    name = "run-agent",
    version,
    about = "Executes queued plan and apply runs for a coordinator"
)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the configuration, then print the effective values.
    CheckConfig,
    /// Poll the organization's run queue.
    Poll {
        /// Coordinator API token.
        #[arg(long, env = "RUN_AGENT_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Consume run events from the AMQP broker.
    Consume {
        /// Coordinator API token.
        #[arg(long, env = "RUN_AGENT_TOKEN", hide_env_values = true)]
        token: String,
    },
}

fn main() {
    logging::init(logging::DEFAULT_DIRECTIVE);
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::INVALID);
    }
    std::process::exit(exit_codes::OK);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::CheckConfig => cmd_check_config(&cli.config),
        Command::Poll { token } => {
            let cfg = load_valid_config(&cli.config)?;
            let organization_id = cfg.require_organization()?.to_string();
            block_on(async move {
                let coordinator = build_coordinator(&cfg, token)?;
                let listener =
                    PollingListener::new(coordinator.clone(), organization_id, cfg.poll_interval());
                run_agent_loop(cfg, coordinator, listener).await
            })
        }
        Command::Consume { token } => {
            let cfg = load_valid_config(&cli.config)?;
            block_on(async move {
                let coordinator = build_coordinator(&cfg, token)?;
                let source = AmqpSource::new(
                    cfg.broker.amqp_url.clone(),
                    cfg.broker.queue.clone(),
                    Duration::from_secs(cfg.broker.reconnect_interval_secs),
                );
                run_agent_loop(cfg, coordinator, BrokerListener::new(source)).await
            })
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &AgentConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let cfg = load_valid_config(path)?;
    let rendered = toml::to_string_pretty(&cfg).context("serialize config")?;
    print!("{rendered}");
    Ok(())
}

fn load_valid_config(path: &Path) -> Result<AgentConfig> {
    let cfg = load_config(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(future)
}

fn build_coordinator(cfg: &AgentConfig, token: String) -> Result<Arc<dyn Coordinator>> {
    Ok(Arc::new(HttpCoordinator::new(&cfg.coordinator, token)?))
}

async fn build_authorizer(cfg: &TokenStoreConfig) -> Result<Authorizer> {
    let store: Arc<dyn TokenStore> = match cfg.kind {
        TokenStoreKind::Memory => Arc::new(MemoryTokenStore::new(cfg.ttl())),
        TokenStoreKind::Redis => Arc::new(RedisTokenStore::connect(&cfg.redis_url, cfg.ttl()).await?),
    };
    Ok(Authorizer::new(store))
}

async fn build_driver(cfg: &AgentConfig, coordinator: Arc<dyn Coordinator>) -> Result<Arc<dyn Driver>> {
    let callback_url = cfg.callback.public_url.clone();
    let driver: Arc<dyn Driver> = match cfg.driver {
        DriverKind::Inline => {
            let work_root = cfg
                .inline
                .work_root
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("run-agent"));
            Arc::new(InlineDriver::new(
                InlineOptions {
                    command: cfg.inline.command.clone(),
                    work_root,
                    callback_url,
                    output_limit_bytes: cfg.inline.output_limit_bytes,
                    timeout: cfg.wait.timeout_secs.map(Duration::from_secs),
                },
                coordinator,
            ))
        }
        DriverKind::Docker => Arc::new(DockerDriver::new(
            BollardEngine::connect()?,
            DockerOptions {
                command: cfg.docker.command.clone(),
                callback_url,
                workspace_mount: cfg.docker.workspace_mount.clone(),
                poll: cfg.wait.poll_policy(),
            },
        )),
        DriverKind::Kubernetes => Arc::new(KubernetesDriver::new(
            Arc::new(KubePods::connect(&cfg.kubernetes.namespace).await?),
            KubernetesOptions {
                namespace: cfg.kubernetes.namespace.clone(),
                command: cfg.kubernetes.command.clone(),
                callback_url,
                poll: cfg.wait.poll_policy(),
            },
        )),
    };
    Ok(driver)
}

/// Start the callback server, then feed the listener's events to the agent
/// until Ctrl-C.
async fn run_agent_loop<L: Listener>(
    cfg: AgentConfig,
    coordinator: Arc<dyn Coordinator>,
    mut listener: L,
) -> Result<()> {
    let authorizer = build_authorizer(&cfg.token_store).await?;
    let mut bus = EventBus::new();
    if cfg.notify_coordinator {
        bus.subscribe_all(Arc::new(CoordinatorNotifier::new(coordinator.clone())));
    }
    let driver = build_driver(&cfg, coordinator.clone()).await?;
    let agent = Agent::new(
        AgentSettings {
            runner_image: cfg.runner_image.clone(),
            image_pull_policy: cfg.image_pull_policy,
        },
        coordinator.clone(),
        driver,
        authorizer.clone(),
        Arc::new(bus),
    );

    let callbacks = server::bind(&cfg.callback.bind).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested, finishing the current run");
                    shutdown.cancel();
                }
                Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
            }
        }
    });

    info!(driver = ?cfg.driver, "agent started");
    server::listen_with_callbacks(
        &mut listener,
        &agent,
        callbacks,
        CallbackState::new(authorizer, coordinator),
        shutdown,
    )
    .await
}
