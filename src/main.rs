use flowgate::config::Config;
use flowgate::gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let mut gateway = Gateway::with_tuning(cfg.tuning.to_tuning());

    for gate in &cfg.http {
        gateway.register_http(&gate.listen, &gate.targets).await?;
    }
    for gate in &cfg.tunnels {
        gateway.register_tunnel(&gate.listen, &gate.upstream).await?;
    }

    let handle = gateway.handle();

    tokio::select! {
        _ = gateway.join() => {}

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            handle.shutdown();
        }
    }

    Ok(())
}
