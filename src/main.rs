//! callvox — multi-tenant voice-chat media bot, orchestration-engine binary.
//!
//! Wires the process-wide singletons in the init order fixed by the design
//! notes (config, document store, assistant pool) and runs the `/metrics`
//! endpoint until a shutdown signal arrives, tearing down in reverse order.

use anyhow::{Context, Result};
use callvox::assistant::AssistantPool;
use callvox::call::CallController;
use callvox::config::Config;
use callvox::db::DocumentStore;
use callvox::downloader::Downloader;
use callvox::facade::CommandFacade;
use callvox::metrics;
use callvox::queue::QueueStore;
use callvox::resolver::Resolver;
use callvox::update_sink::UpdateSink;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callvox=info,tower_http=warn".into()),
        )
        .json()
        .init();

    // `dotenvy` loads a bare `.env` first; the hand-rolled loader (§6) then
    // overlays any additional env files named on the command line.
    dotenvy::dotenv().ok();
    let env_files: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env(&env_files).context("loading configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting callvox");

    std::fs::create_dir_all(&config.downloads_dir)
        .with_context(|| format!("creating downloads dir {}", config.downloads_dir))?;
    std::fs::create_dir_all(&config.cookies_path)
        .with_context(|| format!("creating cookies dir {}", config.cookies_path))?;

    // Init order per the design notes: config, (translations — external),
    // document store, assistant pool.
    let store = Arc::new(
        DocumentStore::connect(&config.document_store_uri)
            .await
            .context("connecting to the document store")?,
    );

    // Concrete `MessagingClient`/`RtcBinding` implementations (the MTProto
    // client and the native RTC engine's FFI binding) are foreign modules
    // outside this crate's scope (§1); a production deployment constructs
    // one pair per configured session string and registers each with
    // `AssistantPool::start_assistant` here, before the pool is handed to
    // the rest of the engine.
    let assistants = Arc::new(AssistantPool::new(Arc::clone(&store)));

    let queue = Arc::new(QueueStore::new());
    let controller = Arc::new(CallController::new(
        Arc::clone(&queue),
        Arc::clone(&assistants),
        config.downloads_dir.clone(),
    ));
    let _update_sink = UpdateSink::new(Arc::clone(&controller));

    // The resolver's messaging-deep-link branch needs a connected client to
    // resolve `t.me/...` links; it borrows whichever assistant happened to
    // start first. A deployment wires concrete sessions in above, before
    // this point, via `AssistantPool::start_assistant`.
    let deep_link_client = assistants
        .sessions()
        .first()
        .map(|s| Arc::clone(&s.messaging))
        .context("no assistant sessions registered; start at least one before resolving queries")?;

    let resolver = Arc::new(Resolver::new(
        config.api_url.clone(),
        config.api_key.clone(),
        Arc::clone(&store),
        deep_link_client,
        config.default_service,
    ));
    let downloader = Arc::new(Downloader::new(config.downloads_dir.clone()));

    // `facade` is the surface an external command-dispatch loop would hold
    // onto for the process lifetime; this binary has no dispatch loop of
    // its own (§1: routing user commands to it is out of the core's scope),
    // so it is dropped before shutdown below to release its `Arc` clones.
    let facade = CommandFacade::new(
        Arc::clone(&queue),
        Arc::clone(&assistants),
        Arc::clone(&controller),
        resolver,
        downloader,
        config.downloads_dir.clone(),
    );

    let metrics_handle = metrics::install_recorder();
    let metrics_port = config.metrics_port;
    let metrics_queue = Arc::clone(&queue);
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = metrics::serve_metrics(metrics_port, metrics_handle, metrics_queue).await {
            tracing::error!(%err, "metrics endpoint exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing the shutdown signal handler")?;
    info!("received shutdown signal, leaving all calls and stopping assistants");

    metrics_task.abort();

    // Teardown reverses init order: drop every other holder of the pool's
    // `Arc` first so `stop_all` (RTC binding freed before the messaging
    // client, per `AssistantPool::stop_all`) gets exclusive access; the
    // document store connection is dropped with the process afterwards.
    drop(facade);
    drop(controller);
    drop(_update_sink);
    let mut assistants =
        Arc::try_unwrap(assistants).unwrap_or_else(|_| unreachable!("last Arc holder"));
    assistants.stop_all().await;

    info!("shutdown complete");
    Ok(())
}
