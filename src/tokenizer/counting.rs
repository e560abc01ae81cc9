//! Reasoning-unit counting rules.
//!
//! A "reasoning unit" is whatever the backend counts: tokens for a real tokenizer, words or
//! characters for the simulator. Forced continuations are measured with the same rule as
//! generated content.

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::BackendError;

/// Counts reasoning units in a piece of text.
pub trait UnitCounter {
    /// # Errors
    /// Returns an error if the text cannot be measured (e.g. tokenizer failure).
    fn count_units(&self, text: &str) -> Result<usize, BackendError>;
}

/// Approximate counting rules that need no tokenizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counting {
    /// Whitespace-separated words.
    #[default]
    Words,
    /// Unicode scalar values.
    Chars,
}

impl UnitCounter for Counting {
    fn count_units(&self, text: &str) -> Result<usize, BackendError> {
        Ok(match self {
            Self::Words => text.split_whitespace().count(),
            Self::Chars => text.chars().count(),
        })
    }
}

impl UnitCounter for Tokenizer {
    fn count_units(&self, text: &str) -> Result<usize, BackendError> {
        let encoding = self.encode(text, false).map_err(BackendError::tokenizer)?;
        Ok(encoding.get_ids().len())
    }
}
