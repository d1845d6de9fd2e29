//! Semantic Scribe: intent extraction for the CPQ engine
//!
//! The Scribe LLM is the primary extractor; regex runs as fallback only.
//!
//! Pipeline: `[Scribe LLM] → repair → parse → resolve derived actions →
//! merge regex gaps`. A Scribe failure is never user-visible: the extractor
//! degrades to the regex tables from tenant config and records the
//! degradation for the reasoning trace.

pub mod backend;
pub mod extractor;
pub mod fallback;
pub mod parse;
pub mod repair;

pub use backend::{ChatConfig, ChatMessage, LlmBackend, OpenAiChatBackend, Role};
pub use extractor::{ScribeExtraction, ScribeExtractor};
pub use fallback::FallbackExtractor;
pub use parse::{parse_intent, resolve_derived_actions};
pub use repair::repair_json;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for ScribeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScribeError::Timeout
        } else {
            ScribeError::Network(err.to_string())
        }
    }
}

impl From<ScribeError> for cpq_core::Error {
    fn from(err: ScribeError) -> Self {
        cpq_core::Error::Scribe(err.to_string())
    }
}
