//! Engine and failer commands.

use std::sync::Arc;

use console::style;
use tokio::sync::watch;

use crate::config::Settings;
use crate::queue::MemoryQueueProvider;
use crate::repository::{migrations, SqlitePool};
use crate::services::{CoreContext, Dispatcher, UpdateProcessor, WorkFailer};

/// Run the whole engine in one process.
pub async fn cmd_serve(settings: Settings, bind: &str) -> anyhow::Result<()> {
    let (host, port) = parse_bind_address(bind, settings.port)?;
    let ctx = build_context(&settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));
    tokio::spawn(dispatcher.clone().run_scheduler_pump(shutdown_rx.clone()));

    let updater = Arc::new(UpdateProcessor::new(ctx.clone()));
    for _ in 0..settings.update_consumer_count.max(1) {
        tokio::spawn(updater.clone().run_consumer(shutdown_rx.clone()));
    }

    let failer = Arc::new(WorkFailer::new(ctx.clone(), UpdateProcessor::new(ctx.clone())));
    tokio::spawn(failer.run(shutdown_rx.clone()));

    println!(
        "{} Starting stacflow engine at http://{}:{}",
        style("→").cyan(),
        host,
        port
    );
    println!("  Press Ctrl+C to stop");

    tokio::select! {
        result = crate::server::serve(ctx, &host, port) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{} Shutting down", style("→").cyan());
        }
    }
    let _ = shutdown_tx.send(true);
    // Let in-flight transactions settle before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

/// Run only the timeout sweeper.
pub async fn cmd_failer(settings: Settings, once: bool) -> anyhow::Result<()> {
    let period = settings.work_failer_period_sec;
    let ctx = build_context(&settings).await?;
    let failer = WorkFailer::new(ctx.clone(), UpdateProcessor::new(ctx));

    if once {
        let stats = failer.sweep_once().await?;
        println!(
            "{} Sweep examined {} item(s), expired {}",
            style("✓").green(),
            stats.examined,
            stats.expired
        );
        return Ok(());
    }

    println!(
        "{} Running failer every {}s, Ctrl+C to stop",
        style("→").cyan(),
        period
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::new(failer).run(shutdown_rx));
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    Ok(())
}

async fn build_context(settings: &Settings) -> anyhow::Result<CoreContext> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let pool = SqlitePool::new(&settings.resolved_database_url());
    migrations::ensure_schema(&pool).await?;
    Ok(CoreContext::new(
        settings.clone(),
        pool,
        Arc::new(MemoryQueueProvider::new()),
    ))
}

/// Parse a bind address that can be:
/// - Just a port: "4006" -> 127.0.0.1:4006
/// - Just a host: "0.0.0.0" -> 0.0.0.0:<default>
/// - Host and port: "0.0.0.0:4006" -> 0.0.0.0:4006
fn parse_bind_address(bind: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    if let Ok(port) = bind.parse::<u16>() {
        return Ok(("127.0.0.1".to_string(), port));
    }
    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }
    Ok((bind.to_string(), default_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_forms() {
        assert_eq!(
            parse_bind_address("4006", 4006).unwrap(),
            ("127.0.0.1".to_string(), 4006)
        );
        assert_eq!(
            parse_bind_address("0.0.0.0:9000", 4006).unwrap(),
            ("0.0.0.0".to_string(), 9000)
        );
        assert_eq!(
            parse_bind_address("0.0.0.0", 4006).unwrap(),
            ("0.0.0.0".to_string(), 4006)
        );
    }
}
