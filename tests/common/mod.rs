//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use kernel_executor::{config::ExecutorConfig, document::to_notebook_json, service::ExecutorService};
use serde_json::{json, Value};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Write an nbformat 4 notebook with one code cell per `(id, source)` to `root/name`.
#[allow(dead_code)]
pub fn write_notebook(root: &Path, name: &str, cells: &[(&str, &str)]) -> PathBuf {
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
    let notebook = json!({
        "cells": cells,
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5,
    });
    let path = root.join(name);
    std::fs::write(&path, to_notebook_json(&notebook).unwrap()).unwrap();
    path
}

/// The cell `cell_id` of the notebook at `path`, if both exist and parse.
#[allow(dead_code)]
pub fn read_cell(path: &Path, cell_id: &str) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    let notebook: Value = serde_json::from_str(&text).ok()?;
    notebook["cells"]
        .as_array()?
        .iter()
        .find(|cell| cell["id"] == cell_id)
        .cloned()
}

/// Poll `check` every 20ms until it holds, panicking with `what` after `timeout`.
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A service over `temp_dir` whose kernels run code with `sh -c`.
#[allow(dead_code)]
pub async fn shell_service(temp_dir: &TempDir, file_ids: bool) -> ExecutorService {
    ExecutorService::new(ExecutorConfig {
        root_dir: temp_dir.path().to_path_buf(),
        db_path: file_ids.then(|| PathBuf::from(".file_id.db")),
        write_debounce_ms: 50,
        watch_debounce_ms: 50,
        kernel_argv: vec!["sh".to_string(), "-c".to_string()],
        ..Default::default()
    })
    .await
    .unwrap()
}
