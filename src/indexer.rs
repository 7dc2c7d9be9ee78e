//! Offline index build.
//!
//! Fetches a batch of events for one city and window, embeds the usable ones
//! in parallel and writes an [`EventIndex`] snapshot that `ae ask` can load at
//! startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::embedder::Embedder;
use crate::query::{DateWindow, parse_date_range};
use crate::sources::EventSource;
use crate::vector_index::{EventIndex, IndexError};

/// Question used to pick the date window when none is given.
pub fn default_build_query(city: &str) -> String {
    format!("What's happening in {city} this weekend?")
}

/// What a build did.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub city: String,
    pub window: DateWindow,
    pub fetched: usize,
    pub indexed: usize,
    pub output: PathBuf,
}

/// Settings for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub city: String,
    pub query: Option<String>,
    pub output: PathBuf,
    pub show_progress: bool,
}

/// Fetch, embed, build and save.
///
/// Records without a title or start time are dropped before embedding.
///
/// # Errors
/// [`IndexError::EmptyInput`] if no usable records were fetched; otherwise any
/// embedding or snapshot error.
pub async fn build_index(
    source: &dyn EventSource,
    embedder: Arc<dyn Embedder>,
    options: &BuildOptions,
    now: DateTime<Utc>,
) -> Result<BuildReport, IndexError> {
    let query = options
        .query
        .clone()
        .unwrap_or_else(|| default_build_query(&options.city));
    let window = parse_date_range(&query, now);

    info!("Fetching events in {} from {}", options.city, window);
    let fetched = source.fetch_events(&options.city, &window).await;
    let fetched_count = fetched.len();

    let records: Vec<_> = fetched.into_iter().filter(|r| r.is_usable()).collect();
    if records.len() < fetched_count {
        warn!(
            "Dropped {} events without a title or start time",
            fetched_count - records.len()
        );
    }

    info!("Embedding {} events", records.len());
    let progress = if options.show_progress {
        let bar = ProgressBar::new(records.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{spinner} embedding [{bar:40}] {pos}/{len} {elapsed}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let output = options.output.clone();
    let (indexed, output) = tokio::task::spawn_blocking(move || -> Result<_, IndexError> {
        let mut index = EventIndex::build_with_progress(records, embedder.as_ref(), &progress)?;
        index.save(&output)?;
        Ok((index.len(), output))
    })
    .await??;

    info!("Saved index with {} events to {}", indexed, output.display());
    Ok(BuildReport {
        city: options.city.clone(),
        window,
        fetched: fetched_count,
        indexed,
        output,
    })
}

/// Default snapshot location when the config does not name one.
pub fn default_output(data_dir: &Path) -> PathBuf {
    data_dir.join("event_index")
}
