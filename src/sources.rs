//! # Event sources
//!
//! Adapters for the listing APIs that supply live candidates, and the
//! [`EventFetcher`] that queries all of them for one question.
//!
//! A provider either returns its events or a [`FetchError`]. The fetcher never
//! propagates those errors: a failing provider is logged and contributes
//! nothing, so a question can always be answered (possibly ungrounded).
//!
//! Every provider request carries its own timeout, 10 seconds by default.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::{EventRecord, EventSourceKind};
use crate::query::DateWindow;

pub const DEFAULT_EVENTBRITE_BASE_URL: &str = "https://www.eventbriteapi.com";
pub const DEFAULT_TICKETMASTER_BASE_URL: &str = "https://app.ticketmaster.com";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no credentials configured for {0}")]
    MissingCredentials(EventSourceKind),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} answered with status {status}")]
    Status { provider: EventSourceKind, status: u16 },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// One listing API.
#[async_trait]
pub trait EventProvider: Send + Sync {
    fn kind(&self) -> EventSourceKind;

    async fn fetch(&self, location: &str, window: &DateWindow) -> Result<Vec<EventRecord>, FetchError>;
}

/// Where the assistant gets its live candidates from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Candidate events for `location` within `window`. Never fails; may be empty.
    async fn fetch_events(&self, location: &str, window: &DateWindow) -> Vec<EventRecord>;
}

/// Queries every provider concurrently and concatenates their results in
/// provider order.
#[derive(Clone, Default)]
pub struct EventFetcher {
    providers: Vec<Arc<dyn EventProvider>>,
}

impl EventFetcher {
    pub fn new(providers: Vec<Arc<dyn EventProvider>>) -> Self {
        Self { providers }
    }

    /// Eventbrite then Ticketmaster, sharing one HTTP client.
    pub fn with_default_providers(
        client: Client,
        eventbrite: (&str, Option<String>),
        ticketmaster: (&str, Option<String>),
        timeout: Duration,
    ) -> Self {
        Self::new(vec![
            Arc::new(
                EventbriteProvider::new(client.clone(), eventbrite.0, eventbrite.1).with_timeout(timeout),
            ),
            Arc::new(TicketmasterProvider::new(client, ticketmaster.0, ticketmaster.1).with_timeout(timeout)),
        ])
    }
}

#[async_trait]
impl EventSource for EventFetcher {
    async fn fetch_events(&self, location: &str, window: &DateWindow) -> Vec<EventRecord> {
        info!("Fetching events for {} ({})", location, window);

        let results = join_all(self.providers.iter().map(|p| p.fetch(location, window))).await;

        let mut events = Vec::new();
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(found) => {
                    debug!("{} returned {} events", provider.kind(), found.len());
                    events.extend(found);
                }
                Err(e) => warn!("{} fetch failed: {}", provider.kind(), e),
            }
        }
        events
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

// Eventbrite --------------------------------------------------------------

pub struct EventbriteProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl EventbriteProvider {
    pub fn new(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventbritePage {
    #[serde(default)]
    events: Vec<EventbriteEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct EventbriteEvent {
    name: Option<EventbriteText>,
    description: Option<EventbriteText>,
    start: Option<EventbriteTime>,
    end: Option<EventbriteTime>,
    venue: Option<EventbriteVenue>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventbriteText {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventbriteTime {
    local: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventbriteVenue {
    address: Option<EventbriteAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct EventbriteAddress {
    localized_address_display: Option<String>,
}

impl EventbriteEvent {
    fn into_record(self, location: &str) -> EventRecord {
        EventRecord {
            source: EventSourceKind::Eventbrite,
            title: self.name.and_then(|n| n.text),
            description: self.description.and_then(|d| d.text).unwrap_or_default(),
            start: self.start.and_then(|t| t.local),
            end: self.end.and_then(|t| t.local),
            location: Some(
                self.venue
                    .and_then(|v| v.address)
                    .and_then(|a| a.localized_address_display)
                    .unwrap_or_else(|| location.to_string()),
            ),
            url: self.url,
        }
    }
}

#[async_trait]
impl EventProvider for EventbriteProvider {
    fn kind(&self) -> EventSourceKind {
        EventSourceKind::Eventbrite
    }

    async fn fetch(&self, location: &str, window: &DateWindow) -> Result<Vec<EventRecord>, FetchError> {
        let token = self
            .token
            .as_deref()
            .ok_or(FetchError::MissingCredentials(self.kind()))?;

        let url = format!("{}/v3/events/search/", self.base_url.trim_end_matches('/'));
        let (start, end) = (window.start_iso(), window.end_iso());
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("location.address", location),
                ("start_date.range_start", start.as_str()),
                ("start_date.range_end", end.as_str()),
                ("expand", "venue"),
                ("sort_by", "date"),
                ("page", "1"),
            ])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                provider: self.kind(),
                status: response.status().as_u16(),
            });
        }

        let page: EventbritePage = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        Ok(page
            .events
            .into_iter()
            .map(|event| event.into_record(location))
            .collect())
    }
}

// Ticketmaster ------------------------------------------------------------

pub struct TicketmasterProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl TicketmasterProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterPage {
    #[serde(rename = "_embedded")]
    embedded: Option<TicketmasterEvents>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterEvents {
    #[serde(default)]
    events: Vec<TicketmasterEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterEvent {
    name: Option<String>,
    info: Option<String>,
    #[serde(rename = "pleaseNote")]
    please_note: Option<String>,
    dates: Option<TicketmasterDates>,
    #[serde(rename = "_embedded")]
    embedded: Option<TicketmasterVenues>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterDates {
    start: Option<TicketmasterStart>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterStart {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterVenues {
    #[serde(default)]
    venues: Vec<TicketmasterVenue>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterVenue {
    city: Option<TicketmasterCity>,
}

#[derive(Debug, Default, Deserialize)]
struct TicketmasterCity {
    name: Option<String>,
}

impl TicketmasterEvent {
    fn into_record(self, location: &str) -> EventRecord {
        let city = self
            .embedded
            .and_then(|e| e.venues.into_iter().next())
            .and_then(|v| v.city)
            .and_then(|c| c.name);

        EventRecord {
            source: EventSourceKind::Ticketmaster,
            title: self.name,
            description: non_empty(self.info)
                .or_else(|| non_empty(self.please_note))
                .unwrap_or_default(),
            start: self.dates.and_then(|d| d.start).and_then(|s| s.date_time),
            end: None,
            location: Some(city.unwrap_or_else(|| location.to_string())),
            url: self.url,
        }
    }
}

#[async_trait]
impl EventProvider for TicketmasterProvider {
    fn kind(&self) -> EventSourceKind {
        EventSourceKind::Ticketmaster
    }

    async fn fetch(&self, location: &str, window: &DateWindow) -> Result<Vec<EventRecord>, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(FetchError::MissingCredentials(self.kind()))?;

        let url = format!("{}/discovery/v2/events.json", self.base_url.trim_end_matches('/'));
        let (start, end) = (window.start_iso(), window.end_iso());
        let response = self
            .client
            .get(url)
            .query(&[
                ("apikey", api_key),
                ("locale", "*"),
                ("city", location),
                ("startDateTime", start.as_str()),
                ("endDateTime", end.as_str()),
                ("size", "50"),
                ("sort", "date,asc"),
            ])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                provider: self.kind(),
                status: response.status().as_u16(),
            });
        }

        let page: TicketmasterPage = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        Ok(page
            .embedded
            .map(|e| e.events)
            .unwrap_or_default()
            .into_iter()
            .map(|event| event.into_record(location))
            .collect())
    }
}
