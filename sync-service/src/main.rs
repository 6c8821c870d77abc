use anyhow::{bail, Context, Result};
use meter_store::LocalStore;
use sync_service::{
    config::AppConfig,
    metrics_server, observability,
    remote::{MemoryDocumentStore, RemoteClient},
    SyncEngine, SyncPolicy,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

const USAGE: &str = "usage: meterbook-sync <compare|upload|download|full|dedupe|pending>";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let command = std::env::args().nth(1).unwrap_or_else(|| "compare".to_string());

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = LocalStore::open(&cfg.local.database_path)
        .await
        .with_context(|| format!("opening {}", cfg.local.database_path.display()))?;

    let api = match &cfg.remote.snapshot_path {
        Some(path) => MemoryDocumentStore::open(path).with_context(|| format!("opening {}", path.display()))?,
        None => MemoryDocumentStore::new(),
    };
    let remote = RemoteClient::new(api, cfg.remote.page_size);

    match command.as_str() {
        "compare" => {
            let engine = SyncEngine::new(store, remote, cfg.engine_config());
            let comparison = engine.compare_databases().await?;
            println!("{}", engine.sync_summary(&comparison));
            for item in comparison.conflicting.iter() {
                println!("  conflict: {} ({})", item.label(), item.reason().unwrap_or("-"));
            }
        }
        "dedupe" => {
            let removed = store.remove_duplicate_meters(&cfg.owner_id).await?;
            println!("removed {removed} duplicate meter(s)");
        }
        "pending" => {
            for entry in store.get_unsettled_changes().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        "upload" | "download" | "full" => {
            let policy: SyncPolicy = command.parse()?;
            run_sync(SyncEngine::new(store, remote, cfg.engine_config()), policy).await?;
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}

async fn run_sync(engine: SyncEngine<MemoryDocumentStore>, policy: SyncPolicy) -> Result<()> {
    let (tx, rx) = mpsc::channel(64);
    let engine = engine.with_progress(tx);

    let printer = tokio::spawn(async move {
        let mut events = ReceiverStream::new(rx);
        while let Some(p) = events.next().await {
            println!("[{}/{}] {}", p.current, p.total, p.message);
        }
    });

    let mut handle = engine.spawn(policy);
    let report = tokio::select! {
        res = &mut handle => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, cancelling sync");
            engine.cancel();
            handle.await?
        }
    }?;

    // The engine (and its progress sender) must go away for the printer to finish.
    drop(engine);
    let _ = printer.await;

    println!("{}", report.summary());
    for failure in report.failures() {
        println!("  failed: {} ({})", failure.label, failure.error);
    }

    Ok(())
}
