use crate::error::ExecutorError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    process::Stdio,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{mpsc::UnboundedSender, Mutex},
};

/// What an execution produced: nbformat output objects plus the execution count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
}

impl ExecutionResult {
    pub fn new(outputs: Vec<Value>, execution_count: Option<i64>) -> Self {
        ExecutionResult {
            outputs,
            execution_count,
        }
    }

    /// Append stream text, extending the previous output if it is the same stream.
    pub fn push_stream(&mut self, name: &str, text: &str) {
        if let Some(last) = self.outputs.last_mut() {
            let same_stream = last.get("output_type").and_then(Value::as_str) == Some("stream")
                && last.get("name").and_then(Value::as_str) == Some(name);
            if same_stream {
                if let Some(Value::String(existing)) = last.get_mut("text") {
                    existing.push_str(text);
                    return;
                }
            }
        }
        self.outputs.push(stream_output(name, text));
    }

    /// Serialized form `{outputs, execution_count}`, as merged into HTTP responses.
    pub fn to_json(&self) -> Value {
        json!({
            "outputs": self.outputs,
            "execution_count": self.execution_count,
        })
    }
}

pub fn stream_output(name: &str, text: &str) -> Value {
    json!({
        "output_type": "stream",
        "name": name,
        "text": text,
    })
}

pub fn error_output(ename: &str, evalue: &str, traceback: Vec<String>) -> Value {
    json!({
        "output_type": "error",
        "ename": ename,
        "evalue": evalue,
        "traceback": traceback,
    })
}

/// Opaque request/response channel to an interpreter session.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    /// Run `code` to completion. If `updates` is given, intermediate snapshots of the result are
    /// sent on it while the execution is still running.
    async fn execute(
        &self,
        code: &str,
        updates: Option<UnboundedSender<ExecutionResult>>,
    ) -> Result<ExecutionResult, ExecutorError>;
}

/// Runs each execution as a fresh interpreter process: `argv + [code]`.
///
/// Executions on one kernel are serialized. The execution count is per kernel and counts every
/// execution, failed ones included.
pub struct ProcessKernel {
    argv: Vec<String>,
    execution_count: AtomicI64,
    turn: Mutex<()>,
}

impl ProcessKernel {
    pub fn new(argv: Vec<String>) -> Result<Self, ExecutorError> {
        if argv.is_empty() {
            return Err(ExecutorError::Kernel(
                "kernel command line is empty".to_string(),
            ));
        }
        Ok(ProcessKernel {
            argv,
            execution_count: AtomicI64::new(0),
            turn: Mutex::new(()),
        })
    }
}

#[async_trait]
impl KernelChannel for ProcessKernel {
    #[tracing::instrument(skip_all)]
    async fn execute(
        &self,
        code: &str,
        updates: Option<UnboundedSender<ExecutionResult>>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let _turn = self.turn.lock().await;
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("[ProcessKernel] execution {} via {:?}", count, self.argv);

        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::Kernel(format!("could not start {:?}: {}", self.argv[0], e))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Kernel("interpreter stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Kernel("interpreter stderr unavailable".to_string()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        let mut result = ExecutionResult::new(Vec::new(), Some(count));
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            let chunk = tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => Some(("stdout", line)),
                    None => {
                        out_done = true;
                        None
                    }
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => Some(("stderr", line)),
                    None => {
                        err_done = true;
                        None
                    }
                },
            };
            if let Some((name, line)) = chunk {
                result.push_stream(name, &format!("{line}\n"));
                if let Some(updates) = &updates {
                    let _ = updates.send(result.clone());
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            result.outputs.push(error_output(
                "ProcessExit",
                &format!("interpreter exited with {status}"),
                Vec::new(),
            ));
            if let Some(updates) = &updates {
                let _ = updates.send(result.clone());
            }
        }
        Ok(result)
    }
}

/// Registry of live kernels by id.
pub struct KernelManager {
    argv: Vec<String>,
    kernels: RwLock<BTreeMap<String, Arc<dyn KernelChannel>>>,
}

impl KernelManager {
    /// `argv` is the interpreter command for kernels created by [`KernelManager::start`].
    pub fn new(argv: Vec<String>) -> Self {
        KernelManager {
            argv,
            kernels: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start a new [`ProcessKernel`] and return its id.
    pub fn start(&self) -> Result<String, ExecutorError> {
        let kernel = ProcessKernel::new(self.argv.clone())?;
        let id = uuid::Uuid::new_v4().to_string();
        self.register(id.clone(), Arc::new(kernel));
        tracing::info!("Started kernel {}", id);
        Ok(id)
    }

    pub fn register(&self, id: String, kernel: Arc<dyn KernelChannel>) {
        self.kernels.write().insert(id, kernel);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn KernelChannel>, ExecutorError> {
        self.kernels
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(format!("Kernel does not exist: {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.kernels.read().contains_key(id)
    }

    pub fn list(&self) -> Vec<String> {
        self.kernels.read().keys().cloned().collect()
    }

    /// Forget a kernel. Executions already holding it run to completion.
    pub fn shutdown(&self, id: &str) -> Result<(), ExecutorError> {
        match self.kernels.write().remove(id) {
            Some(_) => {
                tracing::info!("Shut down kernel {}", id);
                Ok(())
            }
            None => Err(ExecutorError::NotFound(format!(
                "Kernel does not exist: {id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_stream_merges_same_stream() {
        let mut result = ExecutionResult::default();
        result.push_stream("stdout", "a\n");
        result.push_stream("stdout", "b\n");
        result.push_stream("stderr", "oops\n");
        result.push_stream("stdout", "c\n");
        assert_eq!(
            result.outputs,
            vec![
                stream_output("stdout", "a\nb\n"),
                stream_output("stderr", "oops\n"),
                stream_output("stdout", "c\n"),
            ]
        );
    }

    #[test]
    fn test_manager_registry() {
        let manager = KernelManager::new(vec!["sh".to_string(), "-c".to_string()]);
        let id = manager.start().unwrap();
        assert!(manager.contains(&id));
        assert_eq!(manager.list(), vec![id.clone()]);
        assert!(manager.get(&id).is_ok());
        manager.shutdown(&id).unwrap();
        assert!(matches!(manager.get(&id), Err(ExecutorError::NotFound(_))));
        assert!(matches!(
            manager.shutdown(&id),
            Err(ExecutorError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let manager = KernelManager::new(Vec::new());
        assert!(matches!(manager.start(), Err(ExecutorError::Kernel(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_kernel_streams_and_counts() {
        let kernel = ProcessKernel::new(vec!["sh".to_string(), "-c".to_string()]).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let result = kernel.execute("echo hello; echo world", Some(tx)).await.unwrap();
        assert_eq!(result.outputs, vec![stream_output("stdout", "hello\nworld\n")]);
        assert_eq!(result.execution_count, Some(1));

        let mut snapshots = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            snapshots.push(snapshot);
        }
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.last(), Some(&result));

        let second = kernel.execute("true", None).await.unwrap();
        assert!(second.outputs.is_empty());
        assert_eq!(second.execution_count, Some(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_kernel_reports_failure() {
        let kernel = ProcessKernel::new(vec!["sh".to_string(), "-c".to_string()]).unwrap();
        let result = kernel.execute("echo bad 1>&2; exit 3", None).await.unwrap();
        assert!(result.outputs.contains(&stream_output("stderr", "bad\n")));
        let last = result.outputs.last().unwrap();
        assert_eq!(last["output_type"], "error");
        assert_eq!(last["ename"], "ProcessExit");
    }
}
