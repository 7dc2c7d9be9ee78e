//! Main module for the Awful Events CLI application (ae).
//!
//! Parses the command line, loads the configuration and runs one of:
//!
//! ```sh
//! ae ask "Any jazz in Berlin this weekend?"   # stream an answer to stdout
//! ae build-index --city Berlin                 # fetch + embed + save a snapshot
//! ae init                                      # write default config and template
//! ```
//!
//! The answer is the only thing written to stdout; logs go to stderr.

use awful_events::anthropic::{self, AnthropicBackend};
use awful_events::commands::{Cli, Commands};
use awful_events::config::{self, EventsConfig};
use awful_events::embedder::{Embedder, SentenceEmbeddingsModel};
use awful_events::generator::{FragmentStream, StreamingGenerator};
use awful_events::indexer::{self, BuildOptions};
use awful_events::pipeline::{ChatRequest, EventsAssistant};
use awful_events::prompt::{self, PromptBuilder, PromptTemplate};
use awful_events::query::QueryResolver;
use awful_events::retriever::Retriever;
use awful_events::sources::EventFetcher;
use awful_events::vector_index::EventIndex;

use chrono::Utc;
use clap::Parser;
use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, SetAttribute, SetForegroundColor},
};
use futures::StreamExt;
use once_cell::sync::OnceCell;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{error::Error, fs};
use tracing::{Level, debug, error, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

fn init_tracing(verbose: u8) {
    TRACING.get_or_init(|| {
        let level = match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    });
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

/// Main asynchronous function of the CLI: resolve the config path and dispatch.
async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config_path = match cli.config {
        Some(path) => path,
        None => awful_events::config_dir()?.join("config.yaml"),
    };

    match cli.command {
        Commands::Ask {
            query,
            template,
            no_index,
        } => {
            let config = load_or_default(&config_path)?;
            ask(&config, query, template, no_index).await
        }
        Commands::BuildIndex { city, query, out } => {
            let config = load_or_default(&config_path)?;
            build_index(&config, city, query, out).await
        }
        Commands::Init => init(&config_path),
    }
}

fn load_or_default(path: &Path) -> Result<EventsConfig, Box<dyn Error>> {
    if !path.exists() {
        warn!("No config at {}, using defaults (run `ae init` to create one)", path.display());
        return Ok(EventsConfig::default().with_env_credentials(|key| std::env::var(key).ok()));
    }
    let path = path.to_str().ok_or("config path is not valid UTF-8")?;
    let config = config::load_config(path)?;
    debug!("Config loaded: model={} city={}", config.model, config.default_city);
    Ok(config)
}

fn event_fetcher(config: &EventsConfig, client: reqwest::Client) -> EventFetcher {
    EventFetcher::with_default_providers(
        client,
        (config.eventbrite_base_url.as_str(), config.eventbrite_token.clone()),
        (config.ticketmaster_base_url.as_str(), config.ticketmaster_api_key.clone()),
        config.fetch_timeout(),
    )
}

async fn ask(
    config: &EventsConfig,
    query: String,
    template: Option<String>,
    no_index: bool,
) -> Result<(), Box<dyn Error>> {
    if config.api_key.trim().is_empty() {
        return Err("no API key: set api_key in config.yaml or ANTHROPIC_API_KEY".into());
    }

    let prompts = match template {
        Some(name) => PromptBuilder::new(prompt::load_template(&name)?),
        None => PromptBuilder::default(),
    };

    let retriever = if no_index {
        Retriever::unindexed(config.top_k)
    } else {
        load_retriever(config).await
    };

    let client = anthropic::create_client()?;
    let backend = AnthropicBackend::new(client.clone(), &config.api_base, &config.api_key)
        .with_version(&config.anthropic_version)
        .with_response_timeout(config.request_timeout());
    let generator = StreamingGenerator::new(Arc::new(backend), config.retry_policy(), config.generation_params());

    let assistant = EventsAssistant::new(
        Arc::new(event_fetcher(config, client)),
        QueryResolver::new(&config.default_city),
        retriever,
        prompts,
        generator,
    );

    let stream = assistant.answer(&ChatRequest::new(query)).await?;
    print_stream(stream).await
}

/// Load the snapshot and the embedding model it was built with.
///
/// Any failure leaves the assistant in unranked mode.
async fn load_retriever(config: &EventsConfig) -> Retriever {
    let unindexed = Retriever::unindexed(config.top_k);
    let path = match config.index_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("No index directory ({}), candidates will be passed through unranked", e);
            return unindexed;
        }
    };

    let model_id = config.embedding_model.clone();
    let loaded = tokio::task::spawn_blocking(
        move || -> Result<(EventIndex, SentenceEmbeddingsModel), Box<dyn Error + Send + Sync>> {
            let index = EventIndex::load(&path)?;
            if index.embedding_model() != model_id {
                return Err(format!(
                    "index was built with {} but {} is configured",
                    index.embedding_model(),
                    model_id
                )
                .into());
            }
            let embedder = SentenceEmbeddingsModel::load(&model_id)?;
            if embedder.dimension() != index.dimension() {
                return Err(format!(
                    "index has {} dimensions, model produces {}",
                    index.dimension(),
                    embedder.dimension()
                )
                .into());
            }
            Ok((index, embedder))
        },
    )
    .await;

    match loaded {
        Ok(Ok((index, embedder))) => {
            info!("Loaded index with {} events (built {})", index.len(), index.built_at());
            Retriever::indexed(Arc::new(index), Arc::new(embedder), config.top_k)
                .with_embed_timeout(config.embedding_timeout())
        }
        Ok(Err(e)) => {
            warn!("Index unavailable ({}), candidates will be passed through unranked", e);
            unindexed
        }
        Err(e) => {
            warn!("Index loading task failed ({}), candidates will be passed through unranked", e);
            unindexed
        }
    }
}

/// Write fragments to stdout as they arrive.
async fn print_stream(mut stream: FragmentStream) -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    let colored = stdout.is_terminal();
    if colored {
        stdout.execute(SetForegroundColor(Color::Blue))?;
        stdout.execute(SetAttribute(Attribute::Bold))?;
    }

    let mut outcome = Ok(());
    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            Err(e) => {
                error!("Received error: {}", e);
                outcome = Err(e.into());
                break;
            }
        }
    }

    if colored {
        stdout.execute(SetAttribute(Attribute::Reset))?;
        stdout.execute(SetForegroundColor(Color::Reset))?;
    }
    writeln!(stdout)?;
    outcome
}

async fn build_index(
    config: &EventsConfig,
    city: Option<String>,
    query: Option<String>,
    out: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let output = match out {
        Some(path) => path,
        None => config.index_path()?,
    };
    let options = BuildOptions {
        city: city.unwrap_or_else(|| config.default_city.clone()),
        query,
        output,
        show_progress: std::io::stderr().is_terminal(),
    };

    let model_id = config.embedding_model.clone();
    let embedder = tokio::task::spawn_blocking(move || SentenceEmbeddingsModel::load(&model_id)).await??;

    let client = reqwest::Client::builder().build()?;
    let fetcher = event_fetcher(config, client);
    let report = indexer::build_index(&fetcher, Arc::new(embedder), &options, Utc::now()).await?;

    eprintln!(
        "Indexed {} of {} fetched events for {} ({}) into {}",
        report.indexed,
        report.fetched,
        report.city,
        report.window,
        report.output.display()
    );
    Ok(())
}

/// Initializes the application's configuration and default prompt template.
///
/// Existing files are left alone.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let templates = awful_events::config_dir()?.join("templates");
    info!("Creating template config directory: {}", templates.display());
    fs::create_dir_all(&templates)?;

    let template_path = templates.join("default.yaml");
    if template_path.exists() {
        info!("Keeping existing template: {}", template_path.display());
    } else {
        info!("Creating template file: {}", template_path.display());
        fs::write(&template_path, serde_yaml::to_string(&PromptTemplate::default())?)?;
    }

    if config_path.exists() {
        info!("Keeping existing config: {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Creating config file: {}", config_path.display());
        fs::write(config_path, serde_yaml::to_string(&EventsConfig::default())?)?;
    }

    eprintln!("Config: {}", config_path.display());
    eprintln!("Template: {}", template_path.display());
    Ok(())
}
