use huddle::config::BrokerConfig;
use huddle::signaling::SignalingServer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BrokerConfig::from_env();
    let bind_addr = config.bind_addr();

    println!("   Huddle Signaling Broker");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let listener = TcpListener::bind(&bind_addr).await?;

    let server = SignalingServer::new(config).await;
    server.serve(listener, shutdown_signal()).await?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
