use anyhow::Context;
use argus_authority::{AuthorityClient, HttpAuthorityClient};
use argus_engine::app::{AppState, build_router};
use argus_engine::auth::AuthState;
use argus_engine::config::{DocumentStoreBackend, EngineConfig};
use argus_engine::queue::{DeletionQueue, RedisDeletionQueue};
use argus_engine::shutdown::Shutdown;
use argus_engine::sync::{SyncDeps, start_sync};
use argus_engine::observability;
use argus_index::doc::elastic::{ElasticConfig, ElasticDocumentStore};
use argus_index::doc::memory::MemoryDocumentStore;
use argus_index::doc::store::DocumentStore;
use argus_index::{DocEngine, EvalEngine, Index};
use argus_snapshot::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability();

    let config = EngineConfig::from_env_or_yaml().context("engine config")?;
    tracing::info!(
        kind = config.instance_kind.api_type(),
        backend = ?config.document_store.backend,
        "starting argus engine"
    );

    let doc_store: Arc<dyn DocumentStore> = match config.document_store.backend {
        DocumentStoreBackend::Memory => Arc::new(MemoryDocumentStore::new()),
        DocumentStoreBackend::Elasticsearch => {
            let store = ElasticDocumentStore::new(ElasticConfig {
                addresses: config.document_store.elasticsearch_addresses.clone(),
                index: config.document_store.elasticsearch_index.clone(),
                username: config.document_store.elasticsearch_username.clone(),
                password: config.document_store.elasticsearch_password.clone(),
            })
            .context("elasticsearch store")?;
            store
                .ensure_index()
                .await
                .context("ensure elasticsearch index")?;
            Arc::new(store)
        }
    };

    let authority: Arc<dyn AuthorityClient> = Arc::new(
        HttpAuthorityClient::new(
            &config.authority_addr,
            &config.app_code,
            &config.app_secret,
            config.instance_kind,
        )
        .context("authority client")?,
    );
    authority
        .ping()
        .await
        .context("authority unreachable at startup")?;

    std::fs::create_dir_all(&config.storage_path).context("create storage directory")?;
    let snapshot_store = Arc::new(SnapshotStore::new(
        config.storage_path.clone(),
        config.instance_kind,
    ));

    let queue: Option<Arc<dyn DeletionQueue>> = match &config.redis_url {
        Some(url) => {
            let queue = RedisDeletionQueue::connect(url, config.delete_queue_key.clone())
                .await
                .context("deletion queue broker")?;
            Some(Arc::new(queue))
        }
        None => None,
    };

    let index = Arc::new(Index::new(DocEngine::new(doc_store), EvalEngine::new()));
    let auth = Arc::new(
        AuthState::new(
            Arc::clone(&authority),
            config.apigateway_public_key.as_deref(),
            config.super_app_codes.clone(),
        )
        .context("auth state")?,
    );

    let (shutdown_handle, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown_handle.shutdown();
        }
    });

    let (full_sync_tx, full_sync_rx) = mpsc::channel(1);
    start_sync(
        SyncDeps {
            index: Arc::clone(&index),
            authority: Arc::clone(&authority),
            snapshot_store: Arc::clone(&snapshot_store),
            queue,
            kind: config.instance_kind,
            indexer_flush_interval: Duration::from_secs(config.indexer_flush_interval),
        },
        shutdown.clone(),
        full_sync_rx,
    );

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = AppState {
        index,
        auth,
        authority,
        snapshot_store,
        full_sync_tx,
    };
    let app = build_router(state);

    tracing::info!(addr = %config.bind_addr, "engine listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("bind api listener")?;
    let mut serve_shutdown = shutdown;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .context("serve api")?;
    Ok(())
}
