use std::net::SocketAddr;

use anyhow::{Context, Result};
use spatialviz_service::config::Config;
use spatialviz_service::metric;
use tokio_util::sync::CancellationToken;

use crate::endpoints;
use crate::service::RenderService;

/// Starts the render service and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let cpu_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("spatialviz-cpu")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("spatialviz-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let renders_config = config.caches.renders;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;

    let service = RenderService::create(config, cpu_pool.handle().to_owned())
        .context("failed to create render service")?;

    let store = service.store();
    tracing::info!(
        entries = store.len(),
        size = store.total_size(),
        max_cache_size = renders_config.max_cache_size,
        "Opened render cache at {}",
        store.cache_dir().display()
    );
    if !renders_config.evict_on_write && renders_config.eviction_interval.is_none() {
        tracing::warn!("Cache eviction is disabled, the render cache grows unbounded");
    }

    let shutdown = CancellationToken::new();
    let sweeper = renders_config.eviction_interval.map(|interval| {
        let _guard = web_pool.enter();
        service
            .eviction()
            .spawn_periodic(interval, shutdown.child_token())
    });

    let server = axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    let result = web_pool.block_on(server);
    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        web_pool.block_on(sweeper).ok();
    }
    result.context("HTTP server failed")?;

    tracing::info!("System shutdown complete");
    Ok(())
}
