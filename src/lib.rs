//! # Awful Events (library root)
//!
//! A retrieval-augmented assistant for questions about local events:
//! - Event records and the listing APIs that supply them (`event`, `sources`).
//! - City and date-window extraction from a question (`query`).
//! - Sentence embeddings and a persisted HNSW index over events (`embedder`, `vector_index`,
//!   `indexer`).
//! - Ranked or unranked context selection and prompt assembly (`retriever`, `prompt`).
//! - Streaming generation with throttling backoff over the Anthropic Messages API
//!   (`generator`, `anthropic`).
//! - Per-question orchestration (`pipeline`).
//! - CLI parsing and configuration (`commands`, `config`).
//!
//! ## Files
//! Configuration lives in the per-platform config directory (see [`config_dir`]):
//!
//! ```text
//! <config_dir>/config.yaml
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! Index snapshots default to `<data_dir>/event_index` (see [`data_dir`]).

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;

pub mod anthropic;
pub mod commands;
pub mod config;
pub mod embedder;
pub mod event;
pub mod generator;
pub mod indexer;
pub mod pipeline;
pub mod prompt;
pub mod query;
pub mod retriever;
pub mod sources;
pub mod vector_index;

fn project_dirs() -> Result<ProjectDirs, Box<dyn Error>> {
    Ok(ProjectDirs::from("com", "awful-sec", "ae").ok_or("Unable to determine config directory")?)
}

/// Return the per-platform configuration directory.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "awful-sec", "ae")`, so you get the right place on each OS
/// (e.g., `~/Library/Application Support/com.awful-sec.ae` on macOS).
///
/// The directory is **not** created by this function.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```no_run
/// let cfg = awful_events::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Return the per-platform data directory, where index snapshots are kept by default.
pub fn data_dir() -> Result<PathBuf, Box<dyn Error>> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
