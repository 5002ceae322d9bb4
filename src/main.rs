//! meshgate - expose private TCP/UDP services through a peer-to-peer mesh
//!
//! Providers advertise backends, gateways open public ports for them.
//! Both join the same router, derived from a shared secret.

mod documents;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshgate_api::{
    FingerprintResolver, ResolverConfig, UnlimitedConfig, UnlimitedService,
};
use meshgate_auth::{generate_secret, RouterIdentity};
use meshgate_control::{FingerprintSink, PolicyOverrides};
use meshgate_gateway::{Gateway, GatewayConfig, RouteFilter};
use meshgate_provider::{ProviderConfig, ProviderExtensions, ServiceProvider};
use meshgate_transport::{TcpSwarm, TcpSwarmConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// meshgate - tunnel TCP/UDP services through a peer-to-peer mesh
#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(version)]
struct Cli {
    /// Log level or filter directives (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Overlay connectivity options
#[derive(clap::Args, Debug)]
struct SwarmArgs {
    /// Accept mesh peers on this address
    #[arg(long, env = "MESHGATE_SWARM_LISTEN")]
    swarm_listen: Option<SocketAddr>,

    /// Mesh peers to dial (repeatable)
    #[arg(long = "bootstrap", env = "MESHGATE_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<SocketAddr>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a fresh router secret
    NewSecret,

    /// Open public gates for services advertised on the router
    #[command(long_about = r#"
Join the router as a gateway. Every service advertised by a provider gets a
listener on its gate port; client connections are forwarded to a provider.

EXAMPLES:
  # Expose everything on the router, accepting providers on :7400
  meshgate gateway --router $SECRET --listen 0.0.0.0 --swarm-listen 0.0.0.0:7400

  # Only expose services tagged "public"
  meshgate gateway --router $SECRET --filter '[{"tags": "public"}]'
    "#)]
    Gateway {
        /// Router secret (64 hex characters)
        #[arg(long, env = "MESHGATE_ROUTER")]
        router: String,

        /// Address gates listen on
        #[arg(long, env = "MESHGATE_LISTEN", default_value = "127.0.0.1")]
        listen: IpAddr,

        /// Service filter: inline JSON, file or URL (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,

        #[command(flatten)]
        swarm: SwarmArgs,
    },

    /// Advertise local backends on the router
    #[command(long_about = r#"
Join the router as a service provider and advertise backends to gateways.

EXAMPLES:
  meshgate provider --router $SECRET --bootstrap gateway.example:7400 \
    --services '[{"gatePort": 8080, "serviceHost": "127.0.0.1", "servicePort": 80}]'

  # Deny everybody except one network
  meshgate provider --router $SECRET --services services.json \
    --ingress-policy '{"defaults": {"allow": false}, "ips": {"10.0.0.0/8": {"allow": true}}}'
    "#)]
    Provider {
        /// Router secret (64 hex characters)
        #[arg(long, env = "MESHGATE_ROUTER")]
        router: String,

        /// Services: inline JSON, file or URL (repeatable)
        #[arg(long = "services", required = true)]
        services: Vec<String>,

        /// Ingress policy documents, merged in order (repeatable)
        #[arg(long = "ingress-policy")]
        ingress_policies: Vec<String>,

        /// Serve the fingerprint resolver on this address
        #[arg(long, env = "MESHGATE_RESOLVER_LISTEN")]
        resolver_listen: Option<SocketAddr>,

        /// Basic auth for the resolver as user:pass
        #[arg(long, env = "MESHGATE_RESOLVER_AUTH")]
        resolver_auth: Option<String>,

        /// Serve the limit-override service on this address
        #[arg(long, env = "MESHGATE_UNLIMITED_LISTEN", requires = "unlimited_secret")]
        unlimited_listen: Option<SocketAddr>,

        /// Secret the override tokens are encrypted with
        #[arg(long, env = "MESHGATE_UNLIMITED_SECRET")]
        unlimited_secret: Option<String>,

        #[command(flatten)]
        swarm: SwarmArgs,
    },
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn bind_swarm(args: &SwarmArgs) -> Result<Arc<TcpSwarm>> {
    let mut config = TcpSwarmConfig::default();
    if let Some(listen) = args.swarm_listen {
        config = config.with_listen(listen);
    }
    for addr in &args.bootstrap {
        config = config.with_bootstrap(*addr);
    }
    if config.listen.is_none() && config.bootstrap.is_empty() {
        warn!("Neither --swarm-listen nor --bootstrap given; this node cannot reach any peer");
    }

    let swarm = TcpSwarm::bind(config)
        .await
        .context("Failed to start mesh transport")?;
    if let Some(addr) = swarm.local_addr() {
        info!("Accepting mesh peers on {}", addr);
    }
    Ok(Arc::new(swarm))
}

fn check_router(secret: &str) -> Result<()> {
    let identity = RouterIdentity::from_secret_hex(secret).context("Invalid router secret")?;
    info!("Router {}", identity.public_key());
    Ok(())
}

async fn run_gateway(
    router: String,
    listen: IpAddr,
    filters: Vec<String>,
    swarm: SwarmArgs,
) -> Result<()> {
    check_router(&router)?;
    let filter = documents::load_filter(&filters)
        .await?
        .map(|f| Arc::new(f) as Arc<dyn RouteFilter>);
    let swarm = bind_swarm(&swarm).await?;

    let config = GatewayConfig::new(router).with_listen_ip(listen);
    let gateway = Gateway::start(config, swarm, filter)
        .await
        .context("Failed to start gateway")?;
    info!("Gates will listen on {}", listen);

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    gateway.stop().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_provider(
    router: String,
    services: Vec<String>,
    ingress_policies: Vec<String>,
    resolver_listen: Option<SocketAddr>,
    resolver_auth: Option<String>,
    unlimited_listen: Option<SocketAddr>,
    unlimited_secret: Option<String>,
    swarm: SwarmArgs,
) -> Result<()> {
    check_router(&router)?;

    let mut config = ProviderConfig::new(router);
    for service in documents::load_services(&services).await? {
        config = config.with_service(service);
    }
    if config.services.is_empty() {
        warn!("No valid services given; nothing will be advertised");
    }
    for source in &ingress_policies {
        config = config.with_policy_document(documents::load(source).await?);
    }

    let mut extensions = ProviderExtensions::default();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    if let Some(listen) = resolver_listen {
        let mut resolver_config = ResolverConfig::default().with_listen(listen);
        resolver_config.basic_auth = resolver_auth;
        let resolver = FingerprintResolver::new(&resolver_config);
        servers.push(resolver.spawn_sweeper());
        let (_, server) = meshgate_api::serve("Fingerprint resolver", listen, resolver.router())
            .await
            .context("Failed to start fingerprint resolver")?;
        servers.push(server);
        extensions = extensions.with_fingerprint_sink(resolver as Arc<dyn FingerprintSink>);
    }

    if let (Some(listen), Some(secret)) = (unlimited_listen, unlimited_secret) {
        let service = UnlimitedService::new(UnlimitedConfig::new(secret).with_listen(listen));
        let (_, server) = meshgate_api::serve("Limit-override service", listen, service.router())
            .await
            .context("Failed to start limit-override service")?;
        servers.push(server);
        extensions = extensions.with_policy_overrides(service as Arc<dyn PolicyOverrides>);
    }

    let swarm = bind_swarm(&swarm).await?;
    let provider = ServiceProvider::start(config, swarm, extensions)
        .await
        .context("Failed to start service provider")?;

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    provider.stop().await;
    for server in servers {
        server.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::NewSecret => {
            let secret = generate_secret();
            let identity = RouterIdentity::from_secret_hex(&secret)?;
            info!("Router public key: {}", identity.public_key());
            println!("{}", secret);
            Ok(())
        }
        Commands::Gateway {
            router,
            listen,
            filters,
            swarm,
        } => {
            info!("meshgate {} starting gateway", env!("CARGO_PKG_VERSION"));
            run_gateway(router, listen, filters, swarm).await
        }
        Commands::Provider {
            router,
            services,
            ingress_policies,
            resolver_listen,
            resolver_auth,
            unlimited_listen,
            unlimited_secret,
            swarm,
        } => {
            info!("meshgate {} starting provider", env!("CARGO_PKG_VERSION"));
            run_provider(
                router,
                services,
                ingress_policies,
                resolver_listen,
                resolver_auth,
                unlimited_listen,
                unlimited_secret,
                swarm,
            )
            .await
        }
    }
}
