use clap::Parser;
use tokio::net::TcpListener;

use relay_server::config::{generate_config_template, Cli, Config};
use relay_server::hub::{HubBuilder, HubSettings};
use relay_server::lifecycle::LifecycleTracker;
use relay_server::state::AppState;
use relay_server::{db, routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Layered precedence: defaults < TOML < env < CLI
    let config = Config::load(cli)?;

    // Initialize tracing/logging
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter()).init();
    }

    tracing::info!("Relay server v{} starting", env!("CARGO_PKG_VERSION"));

    let store = db::open_store(config.store, &config.data_dir)?;
    if config.clear_store_on_start {
        store.clear().await?;
        tracing::warn!("Store cleared on startup");
    }

    let tracker = LifecycleTracker::new("relay");
    let hub = HubBuilder::new(HubSettings::from(&config.hub), store, tracker.clone())
        .with_default_handlers()
        .start()?;

    // Ctrl-C starts the same shutdown path as any other trigger
    let signal_hub = hub.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                tracing::info!("Ctrl-C received");
                signal_hub.shutdown();
            }
            _ = signal_hub.wait_for_shutdown() => {}
        }
    });

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    routes::serve(listener, AppState::new(hub.clone())).await?;

    // Server returned: make sure the hub is stopping, then drain every task
    hub.shutdown();
    tracker.wait().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
