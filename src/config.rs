//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`EventsConfig`] struct, which holds every tunable of the assistant, and a
//! [`load_config`] function to load it from a YAML file. Every field has a default, so a config
//! file only needs the values that differ:
//!
//! ```yaml
//! model: claude-sonnet-4-5
//! default_city: Hamburg
//! top_k: 3
//! ```
//!
//! Credentials left empty in the file are read from the environment:
//! `ANTHROPIC_API_KEY`, `EVENTBRITE_API_KEY` and `TICKETMASTER_API_KEY`.
//!
//! # Examples
//!
//! ```no_run
//! use awful_events::config::{EventsConfig, load_config};
//!
//! let config: EventsConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.retry_policy());
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::PathBuf, time::Duration};
use tracing::debug;

use crate::anthropic::{DEFAULT_ANTHROPIC_VERSION, DEFAULT_API_BASE};
use crate::embedder::DEFAULT_EMBEDDING_MODEL;
use crate::generator::{GenerationParams, RetryPolicy};
use crate::query::DEFAULT_CITY;
use crate::retriever::DEFAULT_TOP_K;
use crate::sources::{DEFAULT_EVENTBRITE_BASE_URL, DEFAULT_TICKETMASTER_BASE_URL};

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EventsConfig {
    /// Base URL of the Messages API.
    pub api_base: String,

    /// API key for the Messages API. Empty means "use `ANTHROPIC_API_KEY`".
    pub api_key: String,

    /// Value of the `anthropic-version` header.
    pub anthropic_version: String,

    /// The name of the model to be used for generating responses.
    pub model: String,

    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,

    /// Total attempts when the service keeps throttling.
    pub max_retries: u32,

    /// First backoff step in seconds; doubles per attempt.
    pub base_delay_secs: f64,

    /// Upper bound on waiting for response headers from the Messages API.
    pub request_timeout_secs: u64,

    /// Hugging Face id of the sentence embedding model.
    pub embedding_model: String,

    /// Upper bound on embedding and searching one query.
    pub embedding_timeout_secs: u64,

    /// Snapshot directory. Defaults to `<data_dir>/event_index`.
    pub index_dir: Option<PathBuf>,

    pub top_k: usize,

    /// City used when a question does not name one.
    pub default_city: String,

    /// Per-provider request timeout.
    pub fetch_timeout_secs: u64,

    pub eventbrite_token: Option<String>,
    pub ticketmaster_api_key: Option<String>,
    pub eventbrite_base_url: String,
    pub ticketmaster_base_url: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            model: params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            max_retries: 5,
            base_delay_secs: 2.0,
            request_timeout_secs: 60,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_timeout_secs: 30,
            index_dir: None,
            top_k: DEFAULT_TOP_K,
            default_city: DEFAULT_CITY.to_string(),
            fetch_timeout_secs: 10,
            eventbrite_token: None,
            ticketmaster_api_key: None,
            eventbrite_base_url: DEFAULT_EVENTBRITE_BASE_URL.to_string(),
            ticketmaster_base_url: DEFAULT_TICKETMASTER_BASE_URL.to_string(),
        }
    }
}

impl EventsConfig {
    /// Fill empty credentials from `lookup` (normally the process environment).
    pub fn with_env_credentials<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if self.api_key.trim().is_empty() {
            self.api_key = present(lookup("ANTHROPIC_API_KEY")).unwrap_or_default();
        }
        if present(self.eventbrite_token.clone()).is_none() {
            self.eventbrite_token = present(lookup("EVENTBRITE_API_KEY"));
        }
        if present(self.ticketmaster_api_key.clone()).is_none() {
            self.ticketmaster_api_key = present(lookup("TICKETMASTER_API_KEY"));
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay =
            Duration::try_from_secs_f64(self.base_delay_secs).unwrap_or(Duration::from_secs(2));
        RetryPolicy::new(self.max_retries, base_delay)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// The configured snapshot directory, or `<data_dir>/event_index`.
    pub fn index_path(&self) -> Result<PathBuf, Box<dyn Error>> {
        match &self.index_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::indexer::default_output(&crate::data_dir()?)),
        }
    }
}

/// Load the configuration from `file` and fill missing credentials from the environment.
///
/// ### Errors
/// Returns an error if the file cannot be read or is not valid YAML for [`EventsConfig`].
pub fn load_config(file: &str) -> Result<EventsConfig, Box<dyn Error>> {
    debug!("Loading config from: {}", file);
    let content = fs::read_to_string(file)?;
    let config: EventsConfig = serde_yaml::from_str(&content)?;
    Ok(config.with_env_credentials(|key| std::env::var(key).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
api_key: "example_api_key"
api_base: "http://example.com"
model: "example_model"
max_retries: 3
base_delay_secs: 0.5
default_city: "Hamburg"
index_dir: "/tmp/events"
eventbrite_token: "eb"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.api_key, "example_api_key");
        assert_eq!(config.api_base, "http://example.com");
        assert_eq!(config.model, "example_model");
        assert_eq!(config.default_city, "Hamburg");
        assert_eq!(config.index_path().unwrap(), PathBuf::from("/tmp/events"));
        assert_eq!(config.eventbrite_token.as_deref(), Some("eb"));
        assert_eq!(config.top_k, 5);
        assert_eq!(config.max_tokens, 512);

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.backoff_floor(1), Duration::from_secs(1));
    }

    #[test]
    fn test_load_config_invalid_file() {
        assert!(load_config("non/existent/path").is_err());
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();
        assert!(load_config(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_default_config_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&EventsConfig::default()).unwrap();
        let parsed: EventsConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, EventsConfig::default());
    }

    #[test]
    fn test_env_fills_only_missing_credentials() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "from-env"),
            ("EVENTBRITE_API_KEY", "eb-env"),
            ("TICKETMASTER_API_KEY", "  "),
        ]
        .into();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let config = EventsConfig {
            eventbrite_token: Some("eb-file".into()),
            ..EventsConfig::default()
        }
        .with_env_credentials(lookup);

        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.eventbrite_token.as_deref(), Some("eb-file"));
        assert_eq!(config.ticketmaster_api_key, None);
    }

    #[test]
    fn test_missing_model_uses_current_default() {
        let config: EventsConfig = serde_yaml::from_str("default_city: Hamburg\n").unwrap();
        assert_eq!(config.model, crate::generator::DEFAULT_MODEL);
        assert_eq!(config.generation_params().model, "claude-sonnet-4-5");
        assert!(!config.model.starts_with("claude-3"));
    }

    #[test]
    fn test_invalid_base_delay_falls_back() {
        let config = EventsConfig {
            base_delay_secs: -1.0,
            ..EventsConfig::default()
        };
        assert_eq!(config.retry_policy().backoff_floor(0), Duration::from_secs(2));
    }
}
