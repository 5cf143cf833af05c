//! Process bootstrap: prepare the mount points, open the store, seed
//! defaults, start the supervisor and wait for ctrl-c.

use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use wharf::store::Store;
use wharf::{CoreConfig, Mounts, Supervisor};

fn root_logger(mounts: &Mounts) -> std::io::Result<slog::Logger> {
    let term_decorator = slog_term::TermDecorator::new().build();
    let term_drain = slog_term::FullFormat::new(term_decorator).build().fuse();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(mounts.log_file())?;
    let file_decorator = slog_term::PlainDecorator::new(file);
    let file_drain = slog_term::FullFormat::new(file_decorator).build().fuse();
    let drain = slog::Duplicate::new(term_drain, file_drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Ok(slog::Logger::root(drain, slog::o!()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let base = std::env::var("WHARF_HOME").unwrap_or_else(|_| ".".to_string());
    let mounts = Mounts::prepare(&base)?;
    let logger = root_logger(&mounts)?;
    slog::info!(logger, "starting wharf"; "base" => %base);

    let store = Store::open(mounts.database_path(), logger.new(slog::o!("subsystem" => "store"))).await?;
    if store.bootstrap_defaults(&mounts.data_dir).await? {
        slog::info!(logger, "seeded default configuration");
    }
    let config = CoreConfig::from_store(&store).await?;
    let host_key = wharf::sftp::load_or_generate_host_key(&mounts.host_key_path(), &logger)?;

    let supervisor = Arc::new(Supervisor::new(store, config, host_key, logger.clone()).await?);
    supervisor.start_all_enabled().await?;

    tokio::signal::ctrl_c().await?;
    slog::info!(logger, "shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}
