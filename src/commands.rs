use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

use crate::kernel::ExecutionResult;

/// Body of `POST /api/kernels/{kernel_id}/execute`. Unknown fields are ignored and carried back
/// to the caller through the echoed body.
///
/// `cell_id`/`cellId` and `not_write`/`notWrite` are both accepted. When a body carries both
/// spellings the snake_case one wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawExecuteRequest")]
pub struct ExecuteRequest {
    /// Document path relative to the served root.
    pub path: Option<String>,
    pub cell_id: Option<String>,
    /// Code to run. Without it (or when empty) the source of the addressed cell is run.
    pub code: Option<String>,
    /// Wait for the result instead of acknowledging right away.
    pub block: bool,
    /// Do not write the result back into the document.
    pub not_write: bool,
}

#[derive(Deserialize)]
struct RawExecuteRequest {
    #[serde(default, deserialize_with = "empty_as_none")]
    path: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    cell_id: Option<String>,
    #[serde(default, rename = "cellId", deserialize_with = "empty_as_none")]
    cell_id_camel: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    code: Option<String>,
    #[serde(default)]
    block: Option<bool>,
    #[serde(default)]
    not_write: Option<bool>,
    #[serde(default, rename = "notWrite")]
    not_write_camel: Option<bool>,
}

impl From<RawExecuteRequest> for ExecuteRequest {
    fn from(raw: RawExecuteRequest) -> Self {
        ExecuteRequest {
            path: raw.path,
            cell_id: raw.cell_id.or(raw.cell_id_camel),
            code: raw.code,
            block: raw.block.unwrap_or(false),
            not_write: raw.not_write.or(raw.not_write_camel).unwrap_or(false),
        }
    }
}

fn empty_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

impl ExecuteRequest {
    /// Document and cell both present, so there is somewhere to write a result to.
    pub fn targets_cell(&self) -> bool {
        self.path.is_some() && self.cell_id.is_some()
    }
}

impl Display for ExecuteRequest {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match (&self.path, &self.cell_id) {
            (Some(path), Some(cell_id)) => write!(f, "Execute({path}#{cell_id})"),
            (Some(path), None) => write!(f, "Execute({path})"),
            _ => write!(f, "Execute(code)"),
        }
    }
}

/// Outcome of submitting an execution. Every variant carries the JSON body to send back.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResponse {
    /// The same (kernel, document, cell) is already in flight; the request body, unchanged.
    Duplicate(Value),
    /// Running in the background; the request body, unchanged.
    Accepted(Value),
    /// Ran to completion; the request body merged with `{outputs, execution_count}`.
    Completed(Value),
}

impl ExecuteResponse {
    pub fn completed(body: Value, result: &ExecutionResult) -> Self {
        let merged = match (body, result.to_json()) {
            (Value::Object(mut body), Value::Object(result)) => {
                body.extend(result);
                Value::Object(body)
            }
            (_, result) => result,
        };
        ExecuteResponse::Completed(merged)
    }

    pub fn body(&self) -> &Value {
        match self {
            ExecuteResponse::Duplicate(body)
            | ExecuteResponse::Accepted(body)
            | ExecuteResponse::Completed(body) => body,
        }
    }

    pub fn into_body(self) -> Value {
        match self {
            ExecuteResponse::Duplicate(body)
            | ExecuteResponse::Accepted(body)
            | ExecuteResponse::Completed(body) => body,
        }
    }
}

impl Display for ExecuteResponse {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ExecuteResponse::Duplicate(_) => write!(f, "Duplicate"),
            ExecuteResponse::Accepted(_) => write!(f, "Accepted"),
            ExecuteResponse::Completed(body) => write!(
                f,
                "Completed({} output(s))",
                body.get("outputs")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0)
            ),
        }
    }
}

/// One in-flight execution as listed by `GET /api/kernels/{kernel_id}/execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutingCell {
    pub path: Option<String>,
    pub cell_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: String,
}
