//! # Event records
//!
//! The normalized unit every other module passes around. Provider adapters in
//! [`crate::sources`] build [`EventRecord`]s from their raw JSON, the offline
//! indexer persists them next to the HNSW graph, and the retriever renders them
//! into prompt context.
//!
//! Fields that a provider did not supply stay `None`. Formatting never fails on
//! a partial record; missing fields render as fixed placeholders:
//!
//! | field      | placeholder          |
//! |------------|----------------------|
//! | `title`    | `Untitled`           |
//! | `start`    | `Unknown time`       |
//! | `location` | `Unknown location`   |
//! | `url`      | empty string         |
//!
//! ```rust
//! use awful_events::event::{EventRecord, EventSourceKind};
//!
//! let record = EventRecord {
//!     source: EventSourceKind::Ticketmaster,
//!     title: Some("Jazz Night".into()),
//!     description: "Live jazz".into(),
//!     start: Some("2024-06-01T20:00".into()),
//!     end: None,
//!     location: Some("Berlin".into()),
//!     url: Some("http://x".into()),
//! };
//! assert_eq!(
//!     record.display_doc(),
//!     "Jazz Night — 2024-06-01T20:00 @ Berlin\nLive jazz\nhttp://x"
//! );
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub const UNTITLED: &str = "Untitled";
pub const UNKNOWN_TIME: &str = "Unknown time";
pub const UNKNOWN_LOCATION: &str = "Unknown location";
pub const NO_DESCRIPTION: &str = "(no description)";

/// Which listing API produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSourceKind {
    Eventbrite,
    Ticketmaster,
}

impl fmt::Display for EventSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSourceKind::Eventbrite => f.write_str("eventbrite"),
            EventSourceKind::Ticketmaster => f.write_str("ticketmaster"),
        }
    }
}

/// One real-world event as normalized from a provider response.
///
/// `start` and `end` are kept as the provider's own timestamp text; nothing in
/// the pipeline needs them parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub source: EventSourceKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl EventRecord {
    /// A record can be ranked and shown only when it has a title and a start time.
    pub fn is_usable(&self) -> bool {
        non_blank(&self.title).is_some() && non_blank(&self.start).is_some()
    }

    pub fn title_or_placeholder(&self) -> &str {
        non_blank(&self.title).unwrap_or(UNTITLED)
    }

    pub fn start_or_placeholder(&self) -> &str {
        non_blank(&self.start).unwrap_or(UNKNOWN_TIME)
    }

    pub fn location_or_placeholder(&self) -> &str {
        non_blank(&self.location).unwrap_or(UNKNOWN_LOCATION)
    }

    pub fn url_or_empty(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    /// Text fed to the embedder when the record is indexed: `title + "\n\n" + description`.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}\n\n{}",
            self.title.as_deref().unwrap_or_default(),
            self.description
        )
    }

    /// Full rendering used for ranked results:
    /// `"{title} — {start} @ {location}\n{description}\n{url}"`.
    ///
    /// An empty (or whitespace-only) description renders as `(no description)`.
    pub fn display_doc(&self) -> String {
        let description = self.description.trim();
        let description = if description.is_empty() {
            NO_DESCRIPTION
        } else {
            description
        };

        format!(
            "{} — {} @ {}\n{}\n{}",
            self.title_or_placeholder(),
            self.start_or_placeholder(),
            self.location_or_placeholder(),
            description,
            self.url_or_empty()
        )
    }

    /// Compact rendering used when candidates are passed through unranked:
    /// `"{title} — {start} @ {location}\n{url}"`.
    pub fn context_line(&self) -> String {
        format!(
            "{} — {} @ {}\n{}",
            self.title_or_placeholder(),
            self.start_or_placeholder(),
            self.location_or_placeholder(),
            self.url_or_empty()
        )
    }
}

fn non_blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}
