use crate::server::Server;
use log::info;

mod connection;
mod model;
mod packets;
mod server;

const LISTEN_ADDRESS: &str = "0.0.0.0:4444";

#[tokio::main]
async fn main() {
    flexi_logger::Logger::try_with_str("debug")
        .unwrap()
        .adaptive_format_for_stdout(flexi_logger::AdaptiveFormat::WithThread)
        .log_to_stdout()
        .start()
        .unwrap();

    let server = Server::run(LISTEN_ADDRESS).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Shutting down");
        }
        _ = server.has_shutdown() => {}
    };
    server.shutdown();

    info!("Server shutdown");
}
