//! Pixelboard server: shared real-time pixel canvas.
//!
//! Usage: `pixelboard-server [CONFIG_FILE]`. Log verbosity follows
//! `RUST_LOG`.

mod settings;

use log::{error, info};
use pixelboard_collab::CanvasServer;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let path = std::env::args().nth(1);
    let config = match settings::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    info!("Starting pixelboard server on {}...", config.bind_addr);
    let server = CanvasServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down: {} updates published, {} push frames sent",
                stats.broadcast.messages_published, stats.connections.frames_sent
            );
        }
    }
    ExitCode::SUCCESS
}
