//! NATS Bridge Service
//!
//! Binary entry point for the JetStream subject relay.

#[tokio::main]
async fn main() {
    if let Err(e) = nats_bridge::run().await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
