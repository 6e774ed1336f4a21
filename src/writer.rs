//! Debounced write-back of execution results into documents.
//!
//! There is at most one pending write per document. Scheduling again cancels the pending timer
//! and folds the new result into the same entry (latest result per cell wins), so a burst of
//! streaming updates costs one document rewrite. The document path is resolved when the write
//! fires, not when it is scheduled, so a rename in between is followed. Once a timer has fired
//! and claimed its entry the write is irrevocable.
//!
//! A pending write can hold watch consumers handed over by finished executions. They are
//! detached only after the write has landed, so renames stay tracked until then.

use crate::{
    document::DocumentStore,
    error::ExecutorError,
    identity::{FileIdResolver, LogicalFileId},
    kernel::ExecutionResult,
    watch::{ConsumerId, WatchManager},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::sleep};

/// cell id -> latest result
type CellUpdates = BTreeMap<String, ExecutionResult>;

struct PendingWrite {
    generation: u64,
    updates: CellUpdates,
    consumers: Vec<ConsumerId>,
    handle: JoinHandle<()>,
}

/// What a claim takes out of the pending map.
type Claimed = (CellUpdates, Vec<ConsumerId>);

struct WriterInner {
    delay: Duration,
    resolver: FileIdResolver,
    documents: Arc<dyn DocumentStore>,
    watcher: Arc<WatchManager>,
    pending: Mutex<HashMap<LogicalFileId, PendingWrite>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct DebouncedWriter {
    inner: Arc<WriterInner>,
}

impl DebouncedWriter {
    pub fn new(
        delay: Duration,
        resolver: FileIdResolver,
        documents: Arc<dyn DocumentStore>,
        watcher: Arc<WatchManager>,
    ) -> Self {
        DebouncedWriter {
            inner: Arc::new(WriterInner {
                delay,
                resolver,
                documents,
                watcher,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// (Re)arm the write for `document`, superseding any write that has not fired yet.
    pub fn schedule(&self, document: LogicalFileId, cell_id: String, result: ExecutionResult) {
        self.schedule_inner(document, cell_id, result, None);
    }

    /// Like [`DebouncedWriter::schedule`], and keep `consumer` attached to the watch until the
    /// write has landed.
    pub fn schedule_holding(
        &self,
        document: LogicalFileId,
        cell_id: String,
        result: ExecutionResult,
        consumer: ConsumerId,
    ) {
        self.schedule_inner(document, cell_id, result, Some(consumer));
    }

    fn schedule_inner(
        &self,
        document: LogicalFileId,
        cell_id: String,
        result: ExecutionResult,
        consumer: Option<ConsumerId>,
    ) {
        let mut pending = self.inner.pending.lock();
        let (mut updates, mut consumers) = match pending.remove(&document) {
            Some(superseded) => {
                superseded.handle.abort();
                (superseded.updates, superseded.consumers)
            }
            None => (CellUpdates::new(), Vec::new()),
        };
        updates.insert(cell_id, result);
        consumers.extend(consumer);

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let task_document = document.clone();
        let handle = tokio::spawn(async move {
            sleep(inner.delay).await;
            let Some((updates, consumers)) = inner.claim(&task_document, Some(generation)) else {
                return;
            };
            if let Err(e) = inner.flush(&task_document, updates).await {
                tracing::error!(
                    "[DebouncedWriter] Failed to write output into document {}: {}",
                    task_document,
                    e
                );
            }
            inner.release(consumers);
        });
        tracing::debug!(
            "[DebouncedWriter] scheduled write #{} for {}",
            generation,
            document
        );
        pending.insert(
            document,
            PendingWrite {
                generation,
                updates,
                consumers,
                handle,
            },
        );
    }

    /// Persist `result` right away, together with anything still pending for the document so
    /// that no older pending state can land afterwards. Returns whether the document changed.
    pub async fn write_now(
        &self,
        document: LogicalFileId,
        cell_id: String,
        result: ExecutionResult,
    ) -> Result<bool, ExecutorError> {
        let (mut updates, consumers) = self.inner.claim(&document, None).unwrap_or_default();
        updates.insert(cell_id, result);
        let written = self.inner.flush(&document, updates).await;
        self.inner.release(consumers);
        written
    }

    /// Fire every pending write immediately. Used at shutdown.
    pub async fn flush_all(&self) {
        let drained = {
            let mut pending = self.inner.pending.lock();
            pending
                .drain()
                .map(|(document, write)| {
                    write.handle.abort();
                    (document, write.updates, write.consumers)
                })
                .collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            tracing::info!("[DebouncedWriter] flushing {} pending write(s)", drained.len());
        }
        for (document, updates, consumers) in drained {
            if let Err(e) = self.inner.flush(&document, updates).await {
                tracing::error!(
                    "[DebouncedWriter] Failed to flush pending write for {}: {}",
                    document,
                    e
                );
            }
            self.inner.release(consumers);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, document: &LogicalFileId) -> bool {
        self.inner.pending.lock().contains_key(document)
    }
}

impl WriterInner {
    /// Take the pending entry for `document`. With a generation, only if it is still that one.
    fn claim(&self, document: &LogicalFileId, generation: Option<u64>) -> Option<Claimed> {
        let mut pending = self.pending.lock();
        let current = pending.get(document)?;
        if generation.is_some_and(|generation| generation != current.generation) {
            return None;
        }
        let write = pending.remove(document)?;
        if generation.is_none() {
            write.handle.abort();
        }
        Some((write.updates, write.consumers))
    }

    fn release(&self, consumers: Vec<ConsumerId>) {
        for consumer in consumers {
            self.watcher.detach(consumer);
        }
    }

    async fn flush(
        &self,
        document: &LogicalFileId,
        updates: CellUpdates,
    ) -> Result<bool, ExecutorError> {
        let guard = self.resolver.document_lock().lock().await;
        let path = self.resolver.path_for_id_locked(document, &guard).await;
        let mut notebook = self.documents.get(&path).await?;

        let mut changed = false;
        for (cell_id, result) in updates.iter() {
            match notebook.apply_result(cell_id, result) {
                Ok(cell_changed) => changed |= cell_changed,
                Err(e) if updates.len() > 1 => {
                    tracing::warn!("[DebouncedWriter] Skipping update: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        if changed {
            self.documents.save(&notebook, &path).await?;
            self.resolver.save(Path::new(&path)).await?;
            tracing::info!(
                "[DebouncedWriter] wrote {} cell(s) into {}",
                updates.len(),
                path
            );
        } else {
            tracing::debug!("[DebouncedWriter] {} unchanged, not saving", path);
        }
        Ok(changed)
    }
}
