//! Standalone server binary. The host-PVR integration (channel list and
//! tuner devices) is expected to be wired in by the embedding layer; this
//! binary starts with whatever the configuration provides and serves the
//! protocol surface.

use pvrlink::channels::ChannelList;
use pvrlink::config::Config;
use pvrlink::live::TunerPool;
use pvrlink::server::Server;
use std::sync::Arc;

#[tokio::main]
async fn main() -> pvrlink::Result<()> {
    pretty_env_logger::init_timed();

    let config = Config::load(None);
    log::info!("pvrlink starting on port {}", config.listen_port);

    let channels = Arc::new(ChannelList::new());
    let tuners = Arc::new(TunerPool::new(vec![]));

    if tuners.is_empty() {
        log::warn!("no tuner devices configured, live streaming unavailable");
    }

    // storage first, then the channel cache, then the listener
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(&config.timeshift_dir)?;

    let server = Arc::new(Server::new(config, channels, tuners));
    server.init();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await
}
