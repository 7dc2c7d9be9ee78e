//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum with the available subcommands and their options.
//!
//! ```sh
//! ae ask "Any jazz in Berlin this weekend?"
//! ae build-index --city Hamburg
//! ae init
//! ```

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Path to the config file. Defaults to `<config_dir>/config.yaml`.
    #[arg(long, global = true, env = "AWFUL_EVENTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). Logs go to stderr.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question about local events and stream the answer to stdout.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question, e.g. "What's on in Berlin tomorrow?"
        query: String,

        /// Prompt template name under `<config_dir>/templates/`.
        #[arg(short = 't', long)]
        template: Option<String>,

        /// Skip loading the index snapshot and pass candidates through unranked.
        #[arg(long)]
        no_index: bool,
    },

    /// Fetch events and build the index snapshot used by `ask`.
    #[clap(name = "build-index", alias = "b")]
    BuildIndex {
        /// City to fetch events for. Defaults to the configured default city.
        #[arg(long)]
        city: Option<String>,

        /// Question that selects the date window.
        #[arg(long)]
        query: Option<String>,

        /// Snapshot directory. Defaults to the configured index directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Write a default config file and prompt template.
    Init,
}
