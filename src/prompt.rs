//! # Prompt templates
//!
//! Pure string formatting for the two prompt shapes the assistant sends:
//!
//! - **grounded**: an instruction, the context block built from retrieved
//!   documents, then the question;
//! - **fallback**: an instruction and the question, used when no event
//!   candidates were found.
//!
//! The wording lives in a [`PromptTemplate`]. The defaults are built in; users
//! can override any field with a YAML file under the configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! ```yaml
//! grounded_instruction: "You are a concise local guide. Use these listings:"
//! fallback_instruction: "You are a helpful events assistant. Answer this:"
//! context_separator: "\n---\n"
//! ```
//!
//! Whatever the template says, both builders return non-empty text that
//! contains the question verbatim.
//!
//! ```rust
//! use awful_events::prompt::PromptBuilder;
//!
//! let prompts = PromptBuilder::default();
//! let prompt = prompts.build_fallback("Any concerts tonight?");
//! assert!(prompt.ends_with("Any concerts tonight?"));
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::Path};

use crate::retriever::Document;

pub const DEFAULT_GROUNDED_INSTRUCTION: &str = "You are an event assistant. Use this info to answer:";
pub const DEFAULT_FALLBACK_INSTRUCTION: &str = "You are a helpful events assistant. Answer this:";
pub const DEFAULT_CONTEXT_SEPARATOR: &str = "\n---\n";

/// Wording used by [`PromptBuilder`]. Missing YAML fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    /// Placed before the context block of a grounded prompt.
    pub grounded_instruction: String,

    /// Placed before the question when there is no context.
    pub fallback_instruction: String,

    /// Joins rendered documents into one context block.
    pub context_separator: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            grounded_instruction: DEFAULT_GROUNDED_INSTRUCTION.to_string(),
            fallback_instruction: DEFAULT_FALLBACK_INSTRUCTION.to_string(),
            context_separator: DEFAULT_CONTEXT_SEPARATOR.to_string(),
        }
    }
}

/// Load a prompt template by name from `<config_dir>/templates/<name>.yaml`.
///
/// ### Errors
/// Returns an error if the config directory cannot be determined, the file
/// cannot be read, or the YAML does not describe a `PromptTemplate`.
pub fn load_template(name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    load_template_from(&crate::config_dir()?.join("templates"), name)
}

/// Load `<dir>/<name>.yaml`.
pub fn load_template_from(dir: &Path, name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let path = dir.join(format!("{name}.yaml"));
    tracing::info!("Loading template: {}", path.display());

    let content = fs::read_to_string(path)?;
    parse_template(&content)
}

/// Parse template YAML. Missing fields take the defaults.
pub fn parse_template(yaml: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let template: PromptTemplate = serde_yaml::from_str(yaml)?;
    Ok(template)
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    template: PromptTemplate,
}

impl PromptBuilder {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    /// Render each document and join them with the template's separator.
    pub fn join_context(&self, documents: &[Document]) -> String {
        documents
            .iter()
            .map(|doc| doc.render())
            .collect::<Vec<_>>()
            .join(self.template.context_separator.as_str())
    }

    /// `"{instruction}\n\n{context}\n\nQuestion: {question}"`
    pub fn build_grounded(&self, context: &str, question: &str) -> String {
        format!(
            "{}\n\n{}\n\nQuestion: {}",
            self.template.grounded_instruction, context, question
        )
    }

    /// `"{instruction}\n\n{question}"`
    pub fn build_fallback(&self, question: &str) -> String {
        format!("{}\n\n{}", self.template.fallback_instruction, question)
    }
}
