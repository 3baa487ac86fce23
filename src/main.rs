use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use debt_flow_guard::config::Args;
use debt_flow_guard::guard::IpSource;
use debt_flow_guard::rate_limit::RateLimiter;
use debt_flow_guard::router::router;
use debt_flow_guard::state::AppState;
use debt_flow_guard::sweeper::Sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();

    let client = reqwest::Client::builder()
        .timeout(args.upstream_timeout())
        .build()?;
    let state = Arc::new(AppState::new(client, &args.upstream));

    let limiter = Arc::new(RateLimiter::new());
    let sweeper = Sweeper::spawn(limiter.clone(), args.sweep_interval());

    let ip_source = if args.trust_forwarded_for {
        IpSource::ForwardedFor
    } else {
        IpSource::Socket
    };

    let app = router(state.clone(), limiter, ip_source);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Gateway running on http://localhost:{}", args.port);
    tracing::info!("Forwarding to {}", state.upstream);
    tracing::info!("Client IP source: {:?}", ip_source);
    tracing::info!("Sweeping expired entries every {:?}", args.sweep_interval());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.shutdown().await;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
