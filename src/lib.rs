//! # kernel-executor
//!
//! Execute notebook cells against running kernels and write the results back into the
//! notebook, even when the notebook is renamed or moved while the cell is still running.
//!
//! ## Overview
//!
//! A caller submits code, or a reference to a cell of a document, to a kernel. Blocking requests
//! get the result in the response. Non-blocking requests are acknowledged right away, and the
//! output streams into the document as it arrives.
//!
//! Two problems make this hard:
//!
//! - **Documents move.** A write-back that captured the document path when the request came in
//!   lands in the wrong place (or nowhere) if the file was renamed meanwhile. Documents are
//!   therefore tracked by a stable [`identity::LogicalFileId`] backed by an SQLite identity
//!   store, kept current by a filesystem watch whose delete/create pairs are correlated into
//!   moves ([`rename`]).
//! - **Executions overlap.** The same cell submitted twice must not run twice, streaming output
//!   must not rewrite the document on every chunk, and the watch must run exactly as long as
//!   someone needs it.
//!
//! ## Architecture
//!
//! - **[`identity`]** / **[`db`]**: path <-> id resolution and the SQLite identity store
//! - **[`event`]** / **[`rename`]**: raw change translation and per-batch rename correlation
//! - **[`watch`]**: the consumer-counted filesystem watch
//! - **[`executor`]**: admission, blocking/non-blocking execution, cleanup
//! - **[`writer`]**: debounced per-document write-back
//! - **[`kernel`]** / **[`document`]**: the kernel and document collaborators
//! - **[`service`]**: wires one shared instance of everything together
//! - **`server`** (feature `service`): the HTTP surface
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kernel_executor::{config::ExecutorConfig, service::ExecutorService};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ExecutorService::new(ExecutorConfig {
//!         root_dir: "./notebooks".into(),
//!         db_path: Some(".file_id.db".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     let kernel_id = service.kernels().start()?;
//!
//!     // No document: blocks and returns {code, outputs, execution_count}
//!     let response = service
//!         .orchestrator()
//!         .submit(&kernel_id, json!({"code": "print('hello')"}))
//!         .await?;
//!     println!("{}", response.body());
//!
//!     // Document and cell: acknowledged now, written back into nb.ipynb when done
//!     service
//!         .orchestrator()
//!         .submit(&kernel_id, json!({"path": "nb.ipynb", "cellId": "c1"}))
//!         .await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `service`: axum HTTP surface ([`server`] module)
//! - `bin` (default): the `kexec` command line tool, implies `service`

pub mod commands;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod event;
pub mod executor;
pub mod identity;
pub mod kernel;
pub mod paths;
pub mod rename;
#[cfg(feature = "service")]
pub mod server;
pub mod service;
#[cfg(test)]
mod tests;
pub mod watch;
pub mod writer;

pub use error::*;
