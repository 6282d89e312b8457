//! CLI entry point for the capability device runtime.
//!
//! Serves the demo LED device on the configured port:
//!
//! ```bash
//! vcap led --port 9999
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use vcap::config::Settings;
use vcap::led;

#[derive(Parser)]
#[command(name = "vcap", about = "Virtual capability device runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo LED device until the peer disconnects or kills it
    Led {
        /// Listen port (overrides configuration)
        #[arg(long)]
        port: Option<u16>,

        /// Configuration file to load (TOML, path without extension)
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Led { port, config } => {
            let mut settings = Settings::new(config.as_deref())?;
            if let Some(port) = port {
                settings.port = port;
            }
            env_logger::Builder::new()
                .parse_filters(&settings.log_level)
                .init();

            let port = settings.port;
            let (device, _state) = led::led_device(settings);
            info!("[Main] Serving LED device on port {}", port);
            device.serve().await?;
            info!("[Main] Device finished");
            Ok(())
        }
    }
}
