//! # Execution Orchestrator
//!
//! Tracks in-flight executions per (kernel, document, cell) and decides how each request runs:
//!
//! ```text
//! Idle -> Admitted -> Running -> Completing -> Idle
//! ```
//!
//! Admission rejects a request whose triple is already in flight by echoing its body back
//! unchanged. Requests that target a cell register with the [`WatchManager`] for as long as they
//! run, so a rename of the document mid-execution is tracked. Every admitted execution is
//! represented by an [`ExecutionGuard`]; dropping it removes the record and detaches from the
//! watcher, whichever way the execution ends. A result left to the [`DebouncedWriter`] takes the
//! watch consumer along and releases it once the write has landed.
//!
//! A request blocks when it asks to, or when it has no document and cell to write a result back
//! to. Otherwise it is acknowledged immediately and the result streams into the document through
//! the [`DebouncedWriter`].

use crate::{
    commands::{ExecuteRequest, ExecuteResponse, ExecutingCell},
    document::DocumentStore,
    error::ExecutorError,
    identity::{FileIdResolver, LogicalFileId},
    kernel::{ExecutionResult, KernelChannel, KernelManager},
    watch::{ConsumerId, WatchManager},
    writer::DebouncedWriter,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::unbounded_channel;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub kernel_id: String,
    pub document: Option<LogicalFileId>,
    pub cell_id: Option<String>,
}

impl ExecutionKey {
    pub fn targets_cell(&self) -> bool {
        self.document.is_some() && self.cell_id.is_some()
    }
}

impl Display for ExecutionKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match (&self.document, &self.cell_id) {
            (Some(document), Some(cell_id)) => {
                write!(f, "{}:{}#{}", self.kernel_id, document, cell_id)
            }
            _ => write!(f, "{}:<code>", self.kernel_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Admitted,
    Running,
    Completing,
}

struct ExecutionRecord {
    serial: u64,
    key: ExecutionKey,
    state: ExecutionState,
}

struct OrchestratorInner {
    kernels: Arc<KernelManager>,
    documents: Arc<dyn DocumentStore>,
    resolver: FileIdResolver,
    watcher: Arc<WatchManager>,
    writer: DebouncedWriter,
    /// kernel id -> in-flight executions
    records: Mutex<HashMap<String, Vec<ExecutionRecord>>>,
    next_serial: AtomicU64,
}

/// Scoped ownership of one admitted execution.
pub struct ExecutionGuard {
    inner: Arc<OrchestratorInner>,
    kernel_id: String,
    serial: u64,
    consumer: Option<ConsumerId>,
}

impl ExecutionGuard {
    fn set_state(&self, state: ExecutionState) {
        let mut records = self.inner.records.lock();
        if let Some(record) = records
            .get_mut(&self.kernel_id)
            .and_then(|entries| entries.iter_mut().find(|r| r.serial == self.serial))
        {
            tracing::debug!("[Orchestrator] {} -> {:?}", record.key, state);
            record.state = state;
        }
    }

    /// Take over the watch consumer; the guard will no longer detach it.
    fn take_consumer(&mut self) -> Option<ConsumerId> {
        self.consumer.take()
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        {
            let mut records = self.inner.records.lock();
            if let Some(entries) = records.get_mut(&self.kernel_id) {
                entries.retain(|record| record.serial != self.serial);
                if entries.is_empty() {
                    records.remove(&self.kernel_id);
                }
            }
        }
        if let Some(consumer) = self.consumer.take() {
            self.inner.watcher.detach(consumer);
        }
    }
}

#[derive(Clone)]
pub struct ExecutionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl ExecutionOrchestrator {
    pub fn new(
        kernels: Arc<KernelManager>,
        documents: Arc<dyn DocumentStore>,
        resolver: FileIdResolver,
        watcher: Arc<WatchManager>,
        writer: DebouncedWriter,
    ) -> Self {
        ExecutionOrchestrator {
            inner: Arc::new(OrchestratorInner {
                kernels,
                documents,
                resolver,
                watcher,
                writer,
                records: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    pub fn kernels(&self) -> &Arc<KernelManager> {
        &self.inner.kernels
    }

    pub fn writer(&self) -> &DebouncedWriter {
        &self.inner.writer
    }

    /// Admit `key` unless the same cell is already in flight.
    ///
    /// Check and insert happen under one lock, so of two concurrent identical requests exactly
    /// one is admitted.
    pub fn admit(&self, key: ExecutionKey) -> Option<ExecutionGuard> {
        let targets_cell = key.targets_cell();
        let serial = {
            let mut records = self.inner.records.lock();
            let entries = records.entry(key.kernel_id.clone()).or_default();
            if targets_cell && entries.iter().any(|record| record.key == key) {
                return None;
            }
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[Orchestrator] admitted {}", key);
            entries.push(ExecutionRecord {
                serial,
                key: key.clone(),
                state: ExecutionState::Admitted,
            });
            serial
        };

        // Code-only requests have no document to track.
        let consumer = targets_cell.then(ConsumerId::next);
        if let Some(consumer) = consumer {
            self.inner.watcher.attach(consumer);
        }
        Some(ExecutionGuard {
            inner: self.inner.clone(),
            kernel_id: key.kernel_id,
            serial,
            consumer,
        })
    }

    /// Handle one execute request against `kernel_id`.
    #[tracing::instrument(skip(self, body))]
    pub async fn submit(
        &self,
        kernel_id: &str,
        body: Value,
    ) -> Result<ExecuteResponse, ExecutorError> {
        let kernel = self.inner.kernels.get(kernel_id)?;
        let request: ExecuteRequest = serde_json::from_value(body.clone())
            .map_err(|e| ExecutorError::Command(format!("Malformed execute request: {e}")))?;

        let document = match request.path.as_deref() {
            Some(path) => Some(self.inner.resolver.index(path).await.ok_or_else(|| {
                ExecutorError::NotFound(format!("No such document: {path}"))
            })?),
            None => None,
        };
        let key = ExecutionKey {
            kernel_id: kernel_id.to_string(),
            document,
            cell_id: request.cell_id.clone(),
        };
        let Some(guard) = self.admit(key.clone()) else {
            tracing::info!("{} is already executing, echoing request", key);
            return Ok(ExecuteResponse::Duplicate(body));
        };

        let block = request.block || !key.targets_cell();
        let code = match (&request.code, &key.document, &key.cell_id) {
            (Some(code), _, _) => code.clone(),
            (None, Some(document), Some(cell_id)) => self.read_cell_source(document, cell_id).await?,
            _ => {
                return Err(ExecutorError::Command(
                    "Either code or both path and cell_id are required".to_string(),
                ))
            }
        };
        let write_target = match (key.document, key.cell_id) {
            (Some(document), Some(cell_id)) if !request.not_write => Some((document, cell_id)),
            _ => None,
        };

        if block {
            guard.set_state(ExecutionState::Running);
            let result = kernel.execute(&code, None).await?;
            guard.set_state(ExecutionState::Completing);
            if let Some((document, cell_id)) = write_target {
                self.inner
                    .writer
                    .write_now(document, cell_id, result.clone())
                    .await?;
            }
            drop(guard);
            Ok(ExecuteResponse::completed(body, &result))
        } else {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_detached(guard, kernel, code, write_target).await;
            });
            Ok(ExecuteResponse::Accepted(body))
        }
    }

    /// Background half of a non-blocking execution. Failures end here, logged.
    #[tracing::instrument(skip_all)]
    async fn run_detached(
        &self,
        mut guard: ExecutionGuard,
        kernel: Arc<dyn KernelChannel>,
        code: String,
        write_target: Option<(LogicalFileId, String)>,
    ) {
        guard.set_state(ExecutionState::Running);
        let outcome = match write_target {
            Some((document, cell_id)) => {
                let (updates_tx, mut updates_rx) = unbounded_channel::<ExecutionResult>();
                let writer = self.inner.writer.clone();
                let (stream_document, stream_cell) = (document.clone(), cell_id.clone());
                let forwarder = tokio::spawn(async move {
                    while let Some(snapshot) = updates_rx.recv().await {
                        writer.schedule(stream_document.clone(), stream_cell.clone(), snapshot);
                    }
                });
                let result = kernel.execute(&code, Some(updates_tx)).await;
                // The sender was dropped with the execution; drain what is left in order.
                if let Err(e) = forwarder.await {
                    tracing::warn!("[Orchestrator] Output forwarding ended abnormally: {}", e);
                }
                result.map(|result| {
                    guard.set_state(ExecutionState::Completing);
                    match guard.take_consumer() {
                        Some(consumer) => {
                            self.inner
                                .writer
                                .schedule_holding(document, cell_id, result, consumer)
                        }
                        None => self.inner.writer.schedule(document, cell_id, result),
                    }
                })
            }
            None => kernel.execute(&code, None).await.map(|_| ()),
        };
        if let Err(e) = outcome {
            tracing::error!("[Orchestrator] Background execution failed: {}", e);
        }
        drop(guard);
    }

    async fn read_cell_source(
        &self,
        document: &LogicalFileId,
        cell_id: &str,
    ) -> Result<String, ExecutorError> {
        let guard = self.inner.resolver.document_lock().lock().await;
        let path = self.inner.resolver.path_for_id_locked(document, &guard).await;
        self.inner.documents.get(&path).await?.cell_source(cell_id)
    }

    /// In-flight executions on `kernel_id`, with document paths resolved as of now. Unknown
    /// kernels have nothing in flight.
    pub async fn executing(&self, kernel_id: &str) -> Vec<ExecutingCell> {
        let keys = self
            .inner
            .records
            .lock()
            .get(kernel_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|record| record.key.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut cells = Vec::with_capacity(keys.len());
        for key in keys {
            let path = match &key.document {
                Some(document) => Some(self.inner.resolver.path_for_id(document).await),
                None => None,
            };
            cells.push(ExecutingCell {
                path,
                cell_id: key.cell_id,
            });
        }
        cells
    }

    /// Current state of every in-flight execution, across kernels.
    pub fn states(&self) -> Vec<(ExecutionKey, ExecutionState)> {
        self.inner
            .records
            .lock()
            .values()
            .flatten()
            .map(|record| (record.key.clone(), record.state))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.records.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{init_logging, notebook_fixture, CountingDocumentStore, FakeKernel};
    use serde_json::json;
    use std::{path::PathBuf, time::Duration};

    const KERNEL: &str = "11111111-2222-3333-4444-555555555555";

    struct Harness {
        orchestrator: ExecutionOrchestrator,
        store: Arc<CountingDocumentStore>,
        kernel: Arc<FakeKernel>,
        watcher: Arc<WatchManager>,
    }

    fn harness(kernel_delay: Duration) -> Harness {
        harness_with_write_delay(kernel_delay, Duration::from_millis(20))
    }

    fn harness_with_write_delay(kernel_delay: Duration, write_delay: Duration) -> Harness {
        init_logging();
        let store = Arc::new(CountingDocumentStore::default());
        store.insert(
            "nb.ipynb",
            notebook_fixture(&[("c1", "print('hi')"), ("c2", "print('a')\nprint('b')")]),
        );
        let resolver = FileIdResolver::disabled(PathBuf::from("/srv"));
        let watcher = Arc::new(WatchManager::new(resolver.clone(), Duration::from_millis(50)));
        let writer =
            DebouncedWriter::new(write_delay, resolver.clone(), store.clone(), watcher.clone());
        let kernels = Arc::new(KernelManager::new(Vec::new()));
        let kernel = Arc::new(FakeKernel::with_delay(kernel_delay));
        kernels.register(KERNEL.to_string(), kernel.clone());
        let orchestrator =
            ExecutionOrchestrator::new(kernels, store.clone(), resolver, watcher.clone(), writer);
        Harness {
            orchestrator,
            store,
            kernel,
            watcher,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_code_only_request_blocks() {
        let h = harness(Duration::ZERO);
        let response = h
            .orchestrator
            .submit(KERNEL, json!({"code": "print('x')"}))
            .await
            .unwrap();
        assert!(matches!(response, ExecuteResponse::Completed(_)));
        assert_eq!(
            response.body(),
            &json!({
                "code": "print('x')",
                "outputs": [{"output_type": "stream", "name": "stdout", "text": "x\n"}],
                "execution_count": 1,
            })
        );
        assert_eq!(h.orchestrator.in_flight(), 0);
        assert_eq!(h.store.saves(), 0);
    }

    #[tokio::test]
    async fn test_cell_request_is_acknowledged_then_written() {
        let h = harness(Duration::from_millis(20));
        let body = json!({"path": "nb.ipynb", "cellId": "c1"});
        let response = h.orchestrator.submit(KERNEL, body.clone()).await.unwrap();
        assert_eq!(response, ExecuteResponse::Accepted(body));

        wait_for(|| {
            h.store
                .cell("nb.ipynb", "c1")
                .is_some_and(|cell| cell["execution_count"] == 1)
        })
        .await;
        let cell = h.store.cell("nb.ipynb", "c1").unwrap();
        assert_eq!(
            cell["outputs"],
            json!([{"output_type": "stream", "name": "stdout", "text": "hi\n"}])
        );
        wait_for(|| h.orchestrator.in_flight() == 0).await;
    }

    #[tokio::test]
    async fn test_duplicate_is_echoed_and_not_executed() {
        let h = harness(Duration::from_millis(200));
        let body = json!({"path": "nb.ipynb", "cellId": "c1"});
        let first = h.orchestrator.submit(KERNEL, body.clone()).await.unwrap();
        let duplicate_body = json!({"path": "/nb.ipynb", "cell_id": "c1", "extra": true});
        let second = h
            .orchestrator
            .submit(KERNEL, duplicate_body.clone())
            .await
            .unwrap();
        assert_eq!(first, ExecuteResponse::Accepted(body));
        assert_eq!(second, ExecuteResponse::Duplicate(duplicate_body));

        wait_for(|| h.orchestrator.in_flight() == 0).await;
        assert_eq!(h.kernel.executions(), 1);

        // Once the first one is done the same cell can run again.
        let third = h
            .orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c1", "block": true}))
            .await
            .unwrap();
        assert!(matches!(third, ExecuteResponse::Completed(_)));
        assert_eq!(h.kernel.executions(), 2);
    }

    #[tokio::test]
    async fn test_blocking_cell_request_writes_before_responding() {
        let h = harness(Duration::ZERO);
        let response = h
            .orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c2", "block": true}))
            .await
            .unwrap();
        assert_eq!(response.body()["outputs"][0]["text"], "a\nb\n");
        assert_eq!(h.store.saves(), 1);
        assert_eq!(h.store.cell("nb.ipynb", "c2").unwrap()["execution_count"], 1);
    }

    #[tokio::test]
    async fn test_not_write_leaves_document_alone() {
        let h = harness(Duration::ZERO);
        h.orchestrator
            .submit(
                KERNEL,
                json!({"path": "nb.ipynb", "cellId": "c1", "block": true, "notWrite": true}),
            )
            .await
            .unwrap();
        h.orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c2", "not_write": true}))
            .await
            .unwrap();
        wait_for(|| h.kernel.executions() == 2 && h.orchestrator.in_flight() == 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.saves(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kernel_and_missing_cell() {
        let h = harness(Duration::ZERO);
        let unknown = h
            .orchestrator
            .submit("00000000-0000-0000-0000-000000000000", json!({"code": "x"}))
            .await;
        assert!(matches!(unknown, Err(ExecutorError::NotFound(_))));

        let missing = h
            .orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "nope"}))
            .await;
        assert_eq!(
            missing,
            Err(ExecutorError::NotFound(
                "cell nope not found in nb.ipynb".to_string()
            ))
        );
        // The failed admission was cleaned up.
        assert_eq!(h.orchestrator.in_flight(), 0);
        assert_eq!(h.watcher.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_kernel_failure_still_cleans_up() {
        let h = harness(Duration::ZERO);
        let blocking = h
            .orchestrator
            .submit(KERNEL, json!({"code": "raise"}))
            .await;
        assert!(matches!(blocking, Err(ExecutorError::Kernel(_))));
        assert_eq!(h.orchestrator.in_flight(), 0);

        h.orchestrator
            .submit(
                KERNEL,
                json!({"path": "nb.ipynb", "cellId": "c1", "code": "raise"}),
            )
            .await
            .unwrap();
        wait_for(|| h.orchestrator.in_flight() == 0).await;
        assert_eq!(h.watcher.consumer_count(), 0);
        assert_eq!(h.store.saves(), 0);
    }

    #[tokio::test]
    async fn test_request_without_code_or_cell_is_rejected() {
        let h = harness(Duration::ZERO);
        let res = h
            .orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb"}))
            .await;
        assert!(matches!(res, Err(ExecutorError::Command(_))));
        assert_eq!(h.orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_executing_lists_in_flight_cells() {
        let h = harness(Duration::from_millis(200));
        h.orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c1"}))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.executing(KERNEL).await,
            vec![ExecutingCell {
                path: Some("nb.ipynb".to_string()),
                cell_id: Some("c1".to_string()),
            }]
        );
        assert!(h.orchestrator.executing("unknown").await.is_empty());
        wait_for(|| h.orchestrator.in_flight() == 0).await;
        assert!(h.orchestrator.executing(KERNEL).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_code_runs_the_cell_source() {
        let h = harness(Duration::ZERO);
        let response = h
            .orchestrator
            .submit(
                KERNEL,
                json!({"path": "nb.ipynb", "cellId": "c1", "code": "", "block": true}),
            )
            .await
            .unwrap();
        assert_eq!(
            response.body()["outputs"],
            json!([{"output_type": "stream", "name": "stdout", "text": "hi\n"}])
        );
        // The echoed body keeps the empty code as sent.
        assert_eq!(response.body()["code"], "");
    }

    #[tokio::test]
    async fn test_watch_interest_outlives_execution_until_written() {
        let h = harness_with_write_delay(Duration::ZERO, Duration::from_millis(300));
        h.orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c1"}))
            .await
            .unwrap();
        wait_for(|| h.orchestrator.in_flight() == 0).await;
        assert_eq!(h.orchestrator.writer().pending_count(), 1);
        assert_eq!(h.watcher.consumer_count(), 1);

        wait_for(|| h.orchestrator.writer().pending_count() == 0).await;
        assert_eq!(h.watcher.consumer_count(), 0);
        assert_eq!(h.store.cell("nb.ipynb", "c1").unwrap()["execution_count"], 1);
    }

    #[tokio::test]
    async fn test_states_track_running_executions() {
        let h = harness(Duration::from_millis(200));
        h.orchestrator
            .submit(KERNEL, json!({"path": "nb.ipynb", "cellId": "c1"}))
            .await
            .unwrap();
        let key = ExecutionKey {
            kernel_id: KERNEL.to_string(),
            document: Some(LogicalFileId::new("nb.ipynb")),
            cell_id: Some("c1".to_string()),
        };
        wait_for(|| h.orchestrator.states() == vec![(key.clone(), ExecutionState::Running)])
            .await;
        wait_for(|| h.orchestrator.states().is_empty()).await;
    }

    #[tokio::test]
    async fn test_path_outside_root_is_not_found() {
        let h = harness(Duration::ZERO);
        let res = h
            .orchestrator
            .submit(
                KERNEL,
                json!({"path": "../nb.ipynb", "cellId": "c1", "code": "print('x')"}),
            )
            .await;
        assert!(matches!(res, Err(ExecutorError::NotFound(_))));
        assert_eq!(h.kernel.executions(), 0);
        assert_eq!(h.orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_code_only_requests_are_never_duplicates() {
        let h = harness(Duration::from_millis(50));
        let orchestrator = h.orchestrator.clone();
        let first = tokio::spawn(async move {
            orchestrator
                .submit(KERNEL, json!({"code": "print('1')"}))
                .await
        });
        let second = h
            .orchestrator
            .submit(KERNEL, json!({"code": "print('1')"}))
            .await
            .unwrap();
        assert!(matches!(second, ExecuteResponse::Completed(_)));
        assert!(matches!(
            first.await.unwrap().unwrap(),
            ExecuteResponse::Completed(_)
        ));
        assert_eq!(h.kernel.executions(), 2);
    }
}
