//! Error types.
//!
//! Configuration problems and backend failures are kept apart so a caller can tell a bad request
//! from a bad backend.

use thiserror::Error;

/// Invalid session settings, raised before the decode loop starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("min_reasoning_units ({min}) exceeds max_reasoning_units ({max})")]
    InvalidBounds { min: usize, max: usize },

    #[error("{field} must be at least 1")]
    ZeroBound { field: &'static str },

    #[error("replacement_phrases must contain at least one phrase")]
    EmptyReplacements,

    #[error("{field} contains a blank phrase at index {index}")]
    BlankPhrase { field: &'static str, index: usize },

    #[error("{which} marker is empty")]
    EmptyMarker { which: &'static str },

    #[error("start and end markers resolve to the same unit: {marker:?}")]
    MarkerCollision { marker: String },

    #[error("marker {marker:?} is not in the vocabulary")]
    UnresolvableMarker { marker: String },

    #[error("marker {marker:?} spans {pieces} units; it must resolve to exactly one")]
    AmbiguousMarker { marker: String, pieces: usize },

    #[error("invalid options: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Failure inside a token source. Generation state cannot be resumed after one of these.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model forward pass failed: {0}")]
    Model(#[from] candle_core::Error),

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    #[error("prompt encodes to zero tokens")]
    EmptyPrompt,

    #[error("context overflow: {needed} positions needed, model supports {limit}")]
    ContextOverflow { needed: usize, limit: usize },

    #[error("unexpected logits shape {0:?}")]
    UnexpectedLogits(Vec<usize>),
}

impl BackendError {
    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

/// Result of a controller run that did not produce text.
#[derive(Debug, Error)]
pub enum ThinkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl ThinkError {
    /// True when the request itself was invalid (as opposed to the backend failing).
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_and_backend_errors_are_distinguishable() {
        let cfg: ThinkError = ConfigError::EmptyReplacements.into();
        let backend: ThinkError = BackendError::EmptyPrompt.into();
        assert!(cfg.is_config());
        assert!(!backend.is_config());
    }

    #[test]
    fn test_messages_name_the_offending_values() {
        let msg = ConfigError::InvalidBounds { min: 10, max: 5 }.to_string();
        assert!(msg.contains("10") && msg.contains('5'), "{msg}");

        let msg = ConfigError::AmbiguousMarker {
            marker: "</think>".into(),
            pieces: 3,
        }
        .to_string();
        assert!(msg.contains("</think>") && msg.contains('3'), "{msg}");
    }

    #[test]
    fn test_json_errors_become_parse_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        assert!(matches!(ConfigError::from(err), ConfigError::Parse(_)));
    }
}
