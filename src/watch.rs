//! # Watch Lifecycle Manager
//!
//! [`WatchManager`] owns at most one filesystem watch over the served root. Executions that
//! need rename tracking register as consumers; the watch starts lazily with the first consumer
//! and is cancelled when the last one leaves.
//!
//! ## Threading Model
//!
//! The watch itself is a `notify-debouncer-full` debouncer. Starting one registers a recursive
//! OS watch and walks the root to seed its file id cache, so [`WatchManager::attach`] only spawns
//! a tokio task and that task builds the debouncer on the blocking pool. The debouncer's
//! callback runs on its own thread and does nothing but forward each batch into an unbounded
//! channel. The task then drains that channel, translates each batch into [`FileChange`]s and
//! hands it to the [`RenameDetector`]. Batches are processed strictly in arrival order.
//!
//! Cancelling the watch aborts the task, which drops the debouncer and stops the OS watch.
//! Nothing waits for completion.
//!
//! ## Failure
//!
//! When the debouncer cannot be built, or reports errors later, the task logs it and ends. The
//! next [`WatchManager::attach`] (or [`WatchManager::ensure_started`]) notices the finished task
//! and starts a fresh one.
//!
//! ## Disabled identity tracking
//!
//! Without an identity store there is nothing to keep in sync, so the manager still counts
//! consumers but never starts a watch.

use crate::{
    error::ExecutorError, event::FileChange, identity::FileIdResolver, rename::RenameDetector,
};

use notify_debouncer_full::{
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::{spawn_blocking, JoinHandle},
};

/// A file system watcher with debouncing over the served root
type RootWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one interested party, usually one in-flight execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub fn next() -> Self {
        ConsumerId(NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConsumerId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

struct WatchTask {
    handle: JoinHandle<()>,
}

impl WatchTask {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct WatchState {
    consumers: HashSet<ConsumerId>,
    task: Option<WatchTask>,
    starts: usize,
}

pub struct WatchManager {
    root_dir: PathBuf,
    resolver: FileIdResolver,
    debounce: Duration,
    state: Mutex<WatchState>,
}

impl WatchManager {
    pub fn new(resolver: FileIdResolver, debounce: Duration) -> Self {
        WatchManager {
            root_dir: resolver.root_dir().to_path_buf(),
            resolver,
            debounce,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Register interest, starting the watch if needed. A watch that fails to start is logged
    /// by its task; the consumer stays registered so the next attach retries.
    pub fn attach(&self, consumer: ConsumerId) {
        let mut state = self.state.lock();
        state.consumers.insert(consumer);
        tracing::debug!(
            "[WatchManager] {} attached ({} consumer(s))",
            consumer,
            state.consumers.len()
        );
        self.start_locked(&mut state, &self.root_dir);
    }

    /// Drop interest. The last consumer out cancels the watch.
    pub fn detach(&self, consumer: ConsumerId) {
        let mut state = self.state.lock();
        if !state.consumers.remove(&consumer) {
            return;
        }
        tracing::debug!(
            "[WatchManager] {} detached ({} consumer(s) left)",
            consumer,
            state.consumers.len()
        );
        if state.consumers.is_empty() {
            if let Some(task) = state.task.take() {
                tracing::info!(
                    "[WatchManager] Last consumer gone, stopping watch on {:?}",
                    self.root_dir
                );
                task.cancel();
            }
        }
    }

    /// Make sure a live watch task runs over `root_dir`.
    ///
    /// Returns `true` if a new task was started, `false` if one was already running or identity
    /// tracking is disabled.
    pub fn ensure_started(&self, root_dir: &Path) -> bool {
        let mut state = self.state.lock();
        self.start_locked(&mut state, root_dir)
    }

    fn start_locked(&self, state: &mut WatchState, root_dir: &Path) -> bool {
        if !self.resolver.is_enabled() {
            return false;
        }
        if state
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
        {
            return false;
        }
        if let Some(stale) = state.task.take() {
            tracing::debug!("[WatchManager] Discarding finished watch task");
            stale.cancel();
        }

        let detector = RenameDetector::new(self.resolver.clone());
        let handle = tokio::spawn(run_watch(detector, root_dir.to_path_buf(), self.debounce));
        state.task = Some(WatchTask { handle });
        state.starts += 1;
        true
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Number of watch tasks started over the lifetime of this manager.
    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    /// Cancel the watch regardless of consumers.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.consumers.clear();
        if let Some(task) = state.task.take() {
            tracing::info!("[WatchManager] Shutting down watch on {:?}", self.root_dir);
            task.cancel();
        }
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.cancel();
        }
    }
}

/// Build a debouncer over `root_dir` that forwards every batch into `batch_tx`.
fn start_debouncer(
    root_dir: &Path,
    debounce: Duration,
    batch_tx: UnboundedSender<DebounceEventResult>,
) -> Result<RootWatcher, ExecutorError> {
    let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
        // The receiver is gone once the task was cancelled.
        let _ = batch_tx.send(result);
    })?;
    debouncer
        .watcher()
        .watch(root_dir, RecursiveMode::Recursive)?;
    debouncer.cache().add_root(root_dir, RecursiveMode::Recursive);
    Ok(debouncer)
}

async fn run_watch(detector: RenameDetector, root_dir: PathBuf, debounce: Duration) {
    let (batch_tx, batch_rx) = unbounded_channel::<DebounceEventResult>();
    let setup_root = root_dir.clone();
    let started =
        spawn_blocking(move || start_debouncer(&setup_root, debounce, batch_tx)).await;
    // Dropping the debouncer stops the OS watch, so it lives as long as this task.
    let _debouncer = match started {
        Ok(Ok(debouncer)) => debouncer,
        Ok(Err(e)) => {
            tracing::error!(
                "[WatchManager] Could not watch {:?}, renames will not be tracked: {}",
                root_dir,
                e
            );
            return;
        }
        Err(e) => {
            tracing::error!("[WatchManager] Watch setup on {:?} panicked: {}", root_dir, e);
            return;
        }
    };
    tracing::info!("[WatchManager] Watching {:?} for renames", root_dir);
    watch_loop(detector, batch_rx, root_dir).await;
}

#[tracing::instrument(skip_all)]
async fn watch_loop(
    detector: RenameDetector,
    mut batches: UnboundedReceiver<DebounceEventResult>,
    root_dir: PathBuf,
) {
    while let Some(result) = batches.recv().await {
        match result {
            Ok(events) => {
                let changes = events
                    .iter()
                    .flat_map(|debounced| FileChange::from_notify(&debounced.event))
                    .collect::<Vec<_>>();
                if changes.is_empty() {
                    continue;
                }
                tracing::debug!(
                    "[WatchManager] processing batch of {} change(s)",
                    changes.len()
                );
                detector.process_batch(&changes).await;
            }
            Err(errors) => {
                // Also the usual outcome of the OS watch being torn down at shutdown.
                tracing::error!(
                    "[WatchManager] Watch on {:?} failed, stopping: {:?}",
                    root_dir,
                    errors
                );
                break;
            }
        }
    }
    tracing::debug!("[WatchManager] Watch task on {:?} ended", root_dir);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileIdStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn enabled_manager(temp_dir: &TempDir) -> WatchManager {
        let root = temp_dir.path().canonicalize().unwrap();
        let store = FileIdStore::open(root.join(".file_id.db"), root.clone())
            .await
            .unwrap();
        let resolver = FileIdResolver::new(root, Some(Arc::new(store)));
        WatchManager::new(resolver, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_refcounting_restarts_exactly_once() {
        let temp_dir = TempDir::new().unwrap();
        let manager = enabled_manager(&temp_dir).await;
        let consumers = (0..3).map(|_| ConsumerId::next()).collect::<Vec<_>>();

        for consumer in &consumers {
            manager.attach(*consumer);
        }
        assert!(manager.is_running());
        assert_eq!(manager.starts(), 1);
        assert_eq!(manager.consumer_count(), 3);

        for consumer in &consumers {
            manager.detach(*consumer);
        }
        assert!(!manager.is_running());
        assert_eq!(manager.consumer_count(), 0);

        let late = ConsumerId::next();
        manager.attach(late);
        assert!(manager.is_running());
        assert_eq!(manager.starts(), 2);
        manager.detach(late);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let manager = enabled_manager(&temp_dir).await;
        let root = manager.root_dir().to_path_buf();
        assert!(manager.ensure_started(&root));
        assert!(!manager.ensure_started(&root));
        assert_eq!(manager.starts(), 1);
        manager.shutdown();
        assert!(!manager.is_running());
        assert!(manager.ensure_started(&root));
        assert_eq!(manager.starts(), 2);
    }

    #[tokio::test]
    async fn test_detach_unknown_consumer_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let manager = enabled_manager(&temp_dir).await;
        let consumer = ConsumerId::next();
        manager.attach(consumer);
        manager.detach(ConsumerId::next());
        assert!(manager.is_running());
        manager.detach(consumer);
        manager.detach(consumer);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_by_next_attach() {
        let temp_dir = TempDir::new().unwrap();
        let manager = enabled_manager(&temp_dir).await;
        let missing = manager.root_dir().join("not-yet");

        // Setup fails on the blocking pool; attach itself returns right away.
        assert!(manager.ensure_started(&missing));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "watch task never ended");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let consumer = ConsumerId::next();
        manager.attach(consumer);
        assert!(manager.is_running());
        assert_eq!(manager.starts(), 2);
        manager.detach(consumer);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_disabled_identity_never_watches() {
        let manager = WatchManager::new(
            FileIdResolver::disabled(PathBuf::from("/srv")),
            Duration::from_millis(50),
        );
        let consumer = ConsumerId::next();
        manager.attach(consumer);
        assert!(!manager.is_running());
        assert_eq!(manager.starts(), 0);
        assert!(!manager.ensure_started(Path::new("/srv")));
        manager.detach(consumer);
    }
}
