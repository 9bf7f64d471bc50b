use clap::Parser;
use log::{error, info};
use server::config::{Config, RelayConfig};
use server::network::Server;
use server::services::{load_users_file, Services};

/// Main-method of the application.
/// Parses command-line arguments, builds the collaborators and runs the relay until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let relay_config = RelayConfig::from(&config);

    let services = match &config.users_file {
        Some(path) => {
            info!("Seeding users from {}", path.display());
            load_users_file(path).await?
        }
        None => Services::in_memory(),
    };

    let server = Server::bind(relay_config, services).await?;
    let handle = server.handle();
    let mut server_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Relay stopped: {}", e),
                Err(e) => error!("Relay task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    handle.shutdown()?;
    if let Err(e) = server_handle.await {
        error!("Relay task panicked: {}", e);
    }

    Ok(())
}
