//! Shared test utilities: scripted kernel, in-memory document store, notebook fixtures

use crate::{
    document::{DocumentStore, Notebook},
    error::ExecutorError,
    kernel::{ExecutionResult, KernelChannel},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicI64, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// An nbformat 4 notebook with one code cell per `(id, source)`.
pub fn notebook_fixture(cells: &[(&str, &str)]) -> Value {
    let cells = cells
        .iter()
        .map(|(id, source)| {
            json!({
                "id": id,
                "cell_type": "code",
                "metadata": {},
                "source": source,
                "outputs": [],
                "execution_count": null,
            })
        })
        .collect::<Vec<_>>();
    json!({
        "cells": cells,
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5,
    })
}

/// Write a notebook fixture to `root/name` and return its path.
pub fn write_notebook(root: &Path, name: &str, cells: &[(&str, &str)]) -> PathBuf {
    let path = root.join(name);
    let bytes = crate::document::to_notebook_json(&notebook_fixture(cells)).unwrap();
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Understands one statement per line: `print('text')` (or double quotes) prints `text`, a line
/// starting with `raise` fails the execution. Everything else is ignored.
pub struct FakeKernel {
    delay: Duration,
    executions: AtomicUsize,
    execution_count: AtomicI64,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Sleep `delay` before producing any output.
    pub fn with_delay(delay: Duration) -> Self {
        FakeKernel {
            delay,
            executions: AtomicUsize::new(0),
            execution_count: AtomicI64::new(0),
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn printed(line: &str) -> Option<&str> {
    let inner = line.trim().strip_prefix("print(")?.strip_suffix(')')?;
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

#[async_trait]
impl KernelChannel for FakeKernel {
    async fn execute(
        &self,
        code: &str,
        updates: Option<UnboundedSender<ExecutionResult>>,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut result = ExecutionResult::new(Vec::new(), Some(count));
        for line in code.lines() {
            if line.trim_start().starts_with("raise") {
                return Err(ExecutorError::Kernel(format!("raised: {line}")));
            }
            if let Some(text) = printed(line) {
                result.push_stream("stdout", &format!("{text}\n"));
                if let Some(updates) = &updates {
                    let _ = updates.send(result.clone());
                }
            }
        }
        Ok(result)
    }
}

/// In-memory [`DocumentStore`] counting saves.
#[derive(Default)]
pub struct CountingDocumentStore {
    documents: Mutex<HashMap<String, Value>>,
    saves: AtomicUsize,
}

fn key(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl CountingDocumentStore {
    pub fn insert(&self, path: &str, document: Value) {
        self.documents.lock().insert(key(path), document);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.documents.lock().get(&key(path)).cloned()
    }

    pub fn cell(&self, path: &str, cell_id: &str) -> Option<Value> {
        let notebook = Notebook::from_value(path, self.document(path)?).ok()?;
        notebook.find_cell(cell_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for CountingDocumentStore {
    async fn get(&self, path: &str) -> Result<Notebook, ExecutorError> {
        let document = self
            .document(path)
            .ok_or_else(|| ExecutorError::NotFound(format!("No such document: {path}")))?;
        Notebook::from_value(path, document)
    }

    async fn save(&self, notebook: &Notebook, path: &str) -> Result<(), ExecutorError> {
        self.insert(path, notebook.clone().into_value());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_fake_kernel_parses_prints() {
    assert_eq!(printed("print('hi')"), Some("hi"));
    assert_eq!(printed("  print(\"hi\")"), Some("hi"));
    assert_eq!(printed("x = 1"), None);
}
