use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use meshgate::{
    ControlPlane, EgressProxy, IngressProxy, LoadBalancer, ServiceRegistry,
    adapters::{HttpConfigManager, InMemoryConfigManager, MeshState, ReqwestTransport, build_router},
    config::{MeshConfig, MeshConfigValidator, load_config, load_validated_config},
    core::CircuitBreakerRegistry,
    ports::{ConfigurationManager, Transport},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "meshgate.yaml")]
    config: String,

    /// Remote policy store base URL; the file's policies are used when absent
    #[clap(long)]
    config_service: Option<String>,

    /// Human-readable logs instead of JSON
    #[clap(long)]
    pretty: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "meshgate.yaml")]
        config: String,
    },
    /// Start the mesh server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "meshgate.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    let tracing_init = if args.pretty {
        tracing_setup::init_console_tracing()
    } else {
        tracing_setup::init_tracing()
    };
    tracing_init.map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Loading configuration from {config_path}");
    let config = load_validated_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    serve(config, args.config_service).await
}

async fn serve(config: MeshConfig, config_service: Option<String>) -> Result<()> {
    let registry = Arc::new(ServiceRegistry::new());
    let config_manager: Arc<dyn ConfigurationManager> = match config_service {
        Some(url) => {
            tracing::info!(url = %url, "Using remote policy store");
            let manager = HttpConfigManager::new(&url, Duration::from_secs(5))
                .wrap_err("Failed to set up remote policy store")?;
            Arc::new(manager)
        }
        None => Arc::new(InMemoryConfigManager::from_config(&config)),
    };
    let control_plane = Arc::new(ControlPlane::new(registry.clone(), config_manager.clone()));

    let _events = registry.subscribe_to_changes(|event| {
        tracing::info!(
            kind = ?event.kind,
            service_id = %event.service_id,
            instance_id = ?event.instance.as_ref().map(|i| i.id.as_str()),
            "Registry changed"
        );
    });

    for (service_id, registrations) in &config.instances {
        for registration in registrations {
            control_plane.register_service(service_id, registration.clone())?;
        }
    }

    if config.heartbeat.enabled {
        control_plane.start_heartbeat_monitor(
            Duration::from_secs(config.heartbeat.ttl_secs),
            Duration::from_secs(config.heartbeat.interval_secs),
        );
    }

    let transport: Arc<dyn Transport> = Arc::new(
        ReqwestTransport::new(Duration::from_secs(2)).context("Failed to create transport")?,
    );

    let ingress_breakers = CircuitBreakerRegistry::shared();
    let egress_breakers = if config.share_breakers {
        ingress_breakers.clone()
    } else {
        CircuitBreakerRegistry::shared()
    };

    let ingress = Arc::new(
        IngressProxy::new(
            config.routes.clone(),
            registry.clone(),
            config_manager.clone(),
            transport.clone(),
        )
        .with_load_balancer(Arc::new(LoadBalancer::new(config.load_balancer.strategy)))
        .with_breakers(ingress_breakers)
        .with_breaker_defaults(config.circuit_breaker),
    );
    let egress = Arc::new(
        EgressProxy::new(config_manager.clone(), transport)
            .with_breakers(egress_breakers)
            .with_breaker_defaults(config.circuit_breaker),
    );

    for route in &config.routes {
        tracing::info!(prefix = %route.prefix, service_id = %route.service_id, "Configured route");
    }

    let app = build_router(
        MeshState {
            control_plane: control_plane.clone(),
            ingress: ingress.clone(),
            egress: egress.clone(),
        },
        &config.admin_prefix,
    );

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "meshgate listening on {} (admin prefix: {}, strategy: {}, shared breakers: {})",
        addr,
        config.admin_prefix,
        config.load_balancer.strategy,
        config.share_breakers
    );

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Shutting down, releasing mesh resources");
    ingress.dispose().await;
    egress.dispose().await;
    control_plane.dispose();

    server_result.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}

/// Validate a configuration file
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match MeshConfigValidator::validate(&config) {
        Ok(()) => {
            let instances: usize = config.instances.values().map(Vec::len).sum();
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Admin Prefix: {}", config.admin_prefix);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Service Policies: {}", config.services.len());
            println!("   • Seeded Instances: {instances}");
            println!("   • Load Balancing: {}", config.load_balancer.strategy);
            println!("   • Shared Breakers: {}", config.share_breakers);
            println!("   • Heartbeat Expiry: {}", config.heartbeat.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Route prefixes must start with '/' and not shadow the admin prefix");
            println!("   • Breaker thresholds and timeouts must be greater than zero");
            println!("   • Heartbeat ttl_secs must exceed interval_secs");
            std::process::exit(1);
        }
    }
}
