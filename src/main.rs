//! Bootstrap binary: parses `--version`, loads configuration from the
//! environment, wires the dependency-injected context together, and
//! hands the three long-running jobs off to the Job Supervisor.

mod config;
mod job;

use std::sync::Arc;

use clap::Parser;
use stevedore_core::{
    adapters, runtime::bollard_runtime::BollardRuntime, transports, PumpSupervisor, Registry,
    RouteStore,
};

use config::Config;

/// A container log-routing sidecar: attaches to every container on a
/// host and fans out log records to dynamically configured sinks.
///
/// All runtime configuration is read from the environment; see the
/// project README for the full variable list.
#[derive(Parser)]
#[command(name = "stevedore", version)]
struct Cli;

#[tokio::main]
async fn main() {
    Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("stevedore: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    init_tracing(config.debug);

    let transport_factories = Arc::new(stevedore_core::TransportFactories::new());
    transports::register_builtin(&transport_factories);

    let adapter_factories = Arc::new(stevedore_core::AdapterFactories::new());
    adapters::register_builtin(&adapter_factories, transport_factories.clone());

    let runtime = match BollardRuntime::connect() {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            tracing::error!(%err, "failed to connect to the container runtime");
            std::process::exit(exitcode::UNAVAILABLE);
        }
    };

    let supervisor = PumpSupervisor::new(runtime, config.supervisor.clone());

    let store = RouteStore::new(&config.routes_path);
    if let Err(err) = store.ensure_dir().await {
        tracing::error!(%err, path = %config.routes_path, "failed to create routes directory");
        std::process::exit(exitcode::CANTCREAT);
    }

    let registry = Arc::new(Registry::new(adapter_factories.clone(), supervisor.clone(), Some(store)));

    for uri in &config.route_uris {
        match stevedore_core::parse_uri(uri) {
            Ok(descriptor) => {
                if let Err(err) = registry.add_bootstrap(descriptor).await {
                    tracing::error!(%err, %uri, "failed to add route from ROUTE_URIS");
                    std::process::exit(exitcode::CONFIG);
                }
            }
            Err(err) => {
                tracing::error!(%err, %uri, "failed to parse route uri from ROUTE_URIS");
                std::process::exit(exitcode::CONFIG);
            }
        }
    }

    if let Err(err) = registry.restore().await {
        tracing::error!(%err, "failed to restore persisted routes");
        std::process::exit(exitcode::SOFTWARE);
    }

    let server = stevedore_api::Server::new(config.bind_address, registry.clone());

    tracing::info!(address = %config.bind_address, routes_path = %config.routes_path, "stevedore starting");

    let terminated = job::run_until_first_terminates(supervisor.run(), registry.run(), server.run()).await;

    tracing::error!(%terminated, "shutting down");
    std::process::exit(exitcode::SOFTWARE);
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
