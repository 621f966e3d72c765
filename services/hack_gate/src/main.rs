use tokio::net::TcpListener;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();
    let app = hack_gate::app();
    let listener = TcpListener::bind(hack_config::GATE_ADDR.as_str()).await?;
    info!(
        compile_url = %hack_config::COMPILE_URL.as_str(),
        steps_per_tick = *hack_config::STEPS_PER_TICK,
        "listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;
    Ok(())
}
