//! # Executor Service
//!
//! [`ExecutorService`] builds the single shared instance of every component from an
//! [`ExecutorConfig`] and hands each one its collaborators explicitly:
//!
//! ```text
//! FileIdResolver ──┬── WatchManager ── RenameDetector
//!                  ├── DebouncedWriter ── DocumentStore, WatchManager
//!                  └── ExecutionOrchestrator ── KernelManager
//! ```
//!
//! ```rust,no_run
//! use kernel_executor::{config::ExecutorConfig, service::ExecutorService};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), kernel_executor::ExecutorError> {
//! let config = ExecutorConfig {
//!     root_dir: "/srv/notebooks".into(),
//!     db_path: Some(".file_id.db".into()),
//!     ..Default::default()
//! };
//! let service = ExecutorService::new(config).await?;
//! let kernel_id = service.kernels().start()?;
//! let response = service
//!     .orchestrator()
//!     .submit(&kernel_id, json!({"path": "nb.ipynb", "cellId": "c1"}))
//!     .await?;
//! println!("{response}");
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::ExecutorConfig,
    db::FileIdStore,
    document::{DocumentStore, FsDocumentStore},
    error::ExecutorError,
    executor::ExecutionOrchestrator,
    identity::{FileIdResolver, IdentityStore},
    kernel::KernelManager,
    watch::WatchManager,
    writer::DebouncedWriter,
};
use std::sync::Arc;

pub struct ExecutorService {
    config: ExecutorConfig,
    resolver: FileIdResolver,
    watcher: Arc<WatchManager>,
    kernels: Arc<KernelManager>,
    writer: DebouncedWriter,
    orchestrator: ExecutionOrchestrator,
}

impl ExecutorService {
    /// Serve `.ipynb` files below `config.root_dir`.
    pub async fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let root_dir = std::fs::canonicalize(&config.root_dir)?;
        let documents = Arc::new(FsDocumentStore::new(root_dir.clone()));
        Self::with_documents(config, documents).await
    }

    /// Like [`ExecutorService::new`] with a caller-provided document store.
    ///
    /// A relative `db_path` is taken relative to the root directory.
    pub async fn with_documents(
        mut config: ExecutorConfig,
        documents: Arc<dyn DocumentStore>,
    ) -> Result<Self, ExecutorError> {
        let root_dir = std::fs::canonicalize(&config.root_dir)?;
        config.root_dir = root_dir.clone();

        let store: Option<Arc<dyn IdentityStore>> = match &config.db_path {
            Some(db_path) => {
                let db_path = root_dir.join(db_path);
                tracing::info!("Tracking file identity in {:?}", db_path);
                Some(Arc::new(FileIdStore::open(db_path, root_dir.clone()).await?))
            }
            None => {
                tracing::info!("File identity tracking disabled, documents are keyed by path");
                None
            }
        };
        let resolver = FileIdResolver::new(root_dir, store);
        let watcher = Arc::new(WatchManager::new(resolver.clone(), config.watch_debounce()));
        let kernels = Arc::new(KernelManager::new(config.kernel_argv.clone()));
        let writer = DebouncedWriter::new(
            config.write_debounce(),
            resolver.clone(),
            documents.clone(),
            watcher.clone(),
        );
        let orchestrator = ExecutionOrchestrator::new(
            kernels.clone(),
            documents,
            resolver.clone(),
            watcher.clone(),
            writer.clone(),
        );

        Ok(ExecutorService {
            config,
            resolver,
            watcher,
            kernels,
            writer,
            orchestrator,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &FileIdResolver {
        &self.resolver
    }

    pub fn watcher(&self) -> &Arc<WatchManager> {
        &self.watcher
    }

    pub fn kernels(&self) -> &Arc<KernelManager> {
        &self.kernels
    }

    pub fn orchestrator(&self) -> &ExecutionOrchestrator {
        &self.orchestrator
    }

    /// Persist every pending write now, then stop watching.
    pub async fn shutdown(&self) {
        self.writer.flush_all().await;
        self.watcher.shutdown();
        tracing::info!("Executor service shut down");
    }
}
