use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use fleet_broker::config::{NodeConfig, SandboxConfig, StoreConfig, VaultConfig};
use fleet_broker::node::{Node, NodeContext};
use fleet_broker::runtime::docker::DockerCli;
use fleet_broker::shutdown::install_shutdown_handler;
use fleet_broker::store::{JobStore, MemoryJobStore, PostgresJobStore};
use fleet_broker::vault::{SecretBroker, VaultClient};

#[derive(Parser, Debug)]
#[command(name = "fleet-broker")]
#[command(version)]
#[command(about = "A fleet-coordinated container job broker")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a broker node
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port the job API listens on
    #[arg(long, env = "BROKER_PORT", default_value = "3232")]
    port: u16,

    /// Vault address
    #[arg(long, env = "VAULT_ADDR", default_value = "http://127.0.0.1:8200")]
    vault_addr: String,

    /// AppRole role id jobs authenticate under
    #[arg(long, env = "BROKER_ROLE_ID")]
    role_id: String,

    /// AppRole role name; also the transit key name
    #[arg(long, env = "BROKER_ROLE_NAME")]
    role_name: String,

    /// PostgreSQL URL of the shared job store. Without it jobs live in memory
    /// and the node cannot share work with a fleet.
    #[arg(long, env = "BROKER_DB_URL")]
    db_url: Option<String>,

    #[arg(long, env = "BROKER_DB_POOL_SIZE", default_value = "10")]
    db_pool_size: u32,

    /// Vault token used to fetch dynamic database credentials
    #[arg(long, env = "BROKER_DBAUTH_TOKEN", hide_env_values = true)]
    dbauth_token: Option<String>,

    /// Vault path holding the database credentials
    #[arg(long, env = "BROKER_DB_CREDS_PATH", default_value = "database/creds/broker")]
    db_creds_path: String,

    /// Maximum jobs executing concurrently on this node
    #[arg(long, env = "BROKER_MAX_CONCURRENT_JOBS", default_value = "8")]
    max_concurrent_jobs: usize,

    /// Registry that qualifies image names without a registry host
    #[arg(long, env = "BROKER_DEFAULT_REGISTRY", default_value = "docker.io")]
    default_registry: String,

    /// Container runtime CLI
    #[arg(long, default_value = "docker")]
    docker_binary: String,

    /// Run job containers without network access
    #[arg(long)]
    network_disabled: bool,

    /// Memory limit per job container (e.g. "512m")
    #[arg(long)]
    memory_limit: Option<String>,

    /// CPU limit per job container (e.g. "1.5")
    #[arg(long)]
    cpu_limit: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

/// Fill the username and password of `url` from a Vault database
/// credentials secret.
async fn with_db_credentials(
    broker: &dyn SecretBroker,
    token: &SecretString,
    path: &str,
    url: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let secret = broker
        .read(token, path)
        .await?
        .ok_or_else(|| format!("no database credentials at {path}"))?;
    let values = secret
        .values()
        .ok_or_else(|| format!("database credentials at {path} have no data"))?;
    let field = |name: &str| {
        values
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| format!("database credentials at {path} have no {name}"))
    };

    let mut url = Url::parse(url)?;
    url.set_username(&field("username")?)
        .map_err(|_| "database URL cannot carry credentials")?;
    url.set_password(Some(&field("password")?))
        .map_err(|_| "database URL cannot carry credentials")?;
    Ok(url.to_string())
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let vault = VaultConfig {
        addr: args.vault_addr,
        role_id: args.role_id,
        role_name: args.role_name,
        request_timeout: Duration::from_secs(30),
    };
    let broker: Arc<dyn SecretBroker> = Arc::new(VaultClient::new(&vault)?);

    let store_config = match args.db_url {
        Some(url) => {
            let url = match args.dbauth_token {
                Some(token) => {
                    let token = SecretString::from(token);
                    with_db_credentials(broker.as_ref(), &token, &args.db_creds_path, &url).await?
                }
                None => url,
            };
            StoreConfig::Postgres {
                url,
                pool_size: args.db_pool_size,
            }
        }
        None => StoreConfig::Memory,
    };

    let store: Arc<dyn JobStore> = match &store_config {
        StoreConfig::Memory => {
            tracing::warn!("No database configured, jobs are kept in memory on this node only");
            Arc::new(MemoryJobStore::new())
        }
        StoreConfig::Postgres { url, pool_size } => {
            Arc::new(PostgresJobStore::connect(url, *pool_size).await?)
        }
    };

    let sandbox = SandboxConfig {
        docker_binary: args.docker_binary,
        network_disabled: args.network_disabled,
        memory_limit: args.memory_limit,
        cpu_limit: args.cpu_limit,
        ..SandboxConfig::default()
    };
    let runtime = Arc::new(DockerCli::new(sandbox.clone()));

    let config = NodeConfig {
        max_concurrent_jobs: args.max_concurrent_jobs.max(1),
        default_registry: args.default_registry,
        sandbox,
        ..NodeConfig::new(listen_addr)
            .with_vault(vault)
            .with_store(store_config)
    };

    let ctx = NodeContext::new(config, store, broker, runtime);
    tracing::info!(
        node_uuid = %ctx.node_id,
        listen_addr = %ctx.config.listen_addr,
        vault_addr = %ctx.config.vault.addr,
        max_concurrent_jobs = ctx.config.max_concurrent_jobs,
        "Starting fleet-broker node"
    );

    let node = Node::new(Arc::new(ctx));
    let shutdown = install_shutdown_handler(node.context().clone())?;
    node.run(shutdown).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
    }

    Ok(())
}
