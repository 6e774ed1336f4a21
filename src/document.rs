use crate::{error::ExecutorError, kernel::ExecutionResult, paths::api_to_contained_os_path};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{ser::PrettyFormatter, Map, Value};
use std::path::PathBuf;

/// A notebook document. Only `cells[*].{id, source, outputs, execution_count}` are interpreted;
/// everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    path: String,
    content: Map<String, Value>,
}

impl Notebook {
    pub fn new(path: &str, content: Map<String, Value>) -> Self {
        Notebook {
            path: path.to_string(),
            content,
        }
    }

    pub fn from_value(path: &str, value: Value) -> Result<Self, ExecutorError> {
        match value {
            Value::Object(content) => Ok(Notebook::new(path, content)),
            _ => Err(ExecutorError::Serialization(format!(
                "{path} is not a JSON object"
            ))),
        }
    }

    /// The api path the document was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.content)
    }

    pub fn cells(&self) -> &[Value] {
        self.content
            .get("cells")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find_cell(&self, cell_id: &str) -> Option<&Value> {
        self.cells()
            .iter()
            .find(|cell| cell.get("id").and_then(Value::as_str) == Some(cell_id))
    }

    fn find_cell_mut(&mut self, cell_id: &str) -> Option<&mut Map<String, Value>> {
        self.content
            .get_mut("cells")
            .and_then(Value::as_array_mut)?
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|cell| cell.get("id").and_then(Value::as_str) == Some(cell_id))
    }

    fn missing_cell(&self, cell_id: &str) -> ExecutorError {
        ExecutorError::NotFound(format!("cell {} not found in {}", cell_id, self.path))
    }

    /// Source of a cell. Multi-line sources stored as a list of strings are joined.
    pub fn cell_source(&self, cell_id: &str) -> Result<String, ExecutorError> {
        let cell = self
            .find_cell(cell_id)
            .ok_or_else(|| self.missing_cell(cell_id))?;
        Ok(match cell.get("source") {
            Some(Value::String(source)) => source.clone(),
            Some(Value::Array(lines)) => lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
            _ => String::new(),
        })
    }

    /// Write a result into a cell. Returns whether the document changed.
    pub fn apply_result(
        &mut self,
        cell_id: &str,
        result: &ExecutionResult,
    ) -> Result<bool, ExecutorError> {
        let missing = self.missing_cell(cell_id);
        let cell = self.find_cell_mut(cell_id).ok_or(missing)?;
        let mut changed = false;

        let outputs = Value::Array(result.outputs.clone());
        if cell.get("outputs") != Some(&outputs) {
            cell.insert("outputs".to_string(), outputs);
            changed = true;
        }
        if let Some(count) = result.execution_count {
            let count = Value::from(count);
            if cell.get("execution_count") != Some(&count) {
                cell.insert("execution_count".to_string(), count);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Where documents come from and go to, addressed by api path.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Notebook, ExecutorError>;

    async fn save(&self, notebook: &Notebook, path: &str) -> Result<(), ExecutorError>;
}

/// `.ipynb` JSON files below a root directory.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root_dir: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root_dir: PathBuf) -> Self {
        FsDocumentStore { root_dir }
    }

    /// Location of `path` on disk. Paths that leave the root do not exist as far as the store
    /// is concerned.
    pub fn os_path(&self, path: &str) -> Result<PathBuf, ExecutorError> {
        api_to_contained_os_path(&self.root_dir, path.trim_start_matches('/'))
            .ok_or_else(|| ExecutorError::NotFound(format!("No such document: {path}")))
    }
}

/// nbformat on-disk layout: one-space indent, trailing newline.
pub fn to_notebook_json(value: &Value) -> Result<Vec<u8>, ExecutorError> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b" "));
    value.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, path: &str) -> Result<Notebook, ExecutorError> {
        let os_path = self.os_path(path)?;
        let text = tokio::fs::read_to_string(&os_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ExecutorError::NotFound(format!("No such document: {path}"))
            }
            _ => ExecutorError::from(e),
        })?;
        Notebook::from_value(path, serde_json::from_str(&text)?)
    }

    async fn save(&self, notebook: &Notebook, path: &str) -> Result<(), ExecutorError> {
        let os_path = self.os_path(path)?;
        let bytes = to_notebook_json(&Value::Object(notebook.content().clone()))?;
        // In place, so the inode (and with it the identity record) survives.
        tokio::fs::write(&os_path, bytes).await?;
        tracing::debug!("Saved document {:?}", os_path);
        Ok(())
    }
}
