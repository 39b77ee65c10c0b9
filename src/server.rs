use std::sync::Arc;

use creditsync::api::{self, AppState};
use creditsync::config::Config;
use creditsync::engine::SyncContext;
use creditsync::identity::WatchIdentity;
use creditsync::jobs::JobRegistry;
use creditsync::ledger::CreditLedger;
use creditsync::persist::{
    FjallKv, KvStore, Persisted, PersistedStore, PersistenceGateway, namespaced_key,
};
use creditsync::remote::HttpSyncApi;
use tracing::{info, warn};

use crate::cli::{InspectArgs, PurgeArgs, ServeArgs};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const STORES: [&str; 2] = [CreditLedger::STORE_NAME, JobRegistry::STORE_NAME];

pub async fn serve(config: Config, args: ServeArgs) -> Result<(), AnyError> {
    let address = args.address.unwrap_or(config.server.bind_addr);

    info!(path = %config.storage.fjall_path.display(), "Opening snapshot store");
    let kv = Arc::new(FjallKv::open(&config.storage.fjall_path)?);
    let remote = Arc::new(HttpSyncApi::new(&config.remote)?);
    info!(base_url = %remote.base_url(), "Remote API configured");

    let identity = Arc::new(WatchIdentity::resolved(args.identity));

    let context = SyncContext::initialize(config, remote, kv, identity.clone()).await?;
    context.start().await;

    let state = AppState::new(Arc::clone(&context)).with_identity(identity);
    let served = api::run(state, address, shutdown_signal()).await;

    context.stop().await;
    if let Err(e) = context.gateway().kv().flush() {
        warn!(error = %e, "Final flush failed");
    }
    info!("creditsync stopped");

    served
}

pub fn inspect(config: &Config, args: InspectArgs) -> Result<(), AnyError> {
    let kv = FjallKv::open(&config.storage.fjall_path)?;

    for store in STORES {
        if args.store.as_deref().is_some_and(|wanted| wanted != store) {
            continue;
        }
        let key = namespaced_key(store, args.identity.as_deref());
        match kv.get(&key)? {
            Some(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                println!("# {key}");
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            None => println!("# {key} (empty)"),
        }
    }

    Ok(())
}

pub async fn purge(config: &Config, args: PurgeArgs) -> Result<(), AnyError> {
    let kv = Arc::new(FjallKv::open(&config.storage.fjall_path)?);

    // Attach both stores so the gateway knows every namespace to clear
    let gateway = PersistenceGateway::new(kv, None);
    let _ledger = Persisted::attach(&gateway, CreditLedger::new(&config.retention)).await?;
    let _jobs = Persisted::attach(&gateway, JobRegistry::new(&config.retention)).await?;

    let removed = gateway.purge_identity(Some(&args.identity)).await?;
    println!("removed {removed} snapshot(s) for {}", args.identity);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
