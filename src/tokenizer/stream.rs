//! Incremental detokenization.
//!
//! Decoding tokens one at a time loses inter-token spacing for most subword vocabularies, so the
//! stream decodes a small window and emits only the text the newest token added. Text that ends
//! inside an incomplete UTF-8 sequence is held back until a later token completes it.

use tokenizers::Tokenizer;

use crate::error::BackendError;

#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Text `token` would add if committed next. Does not change the stream.
    ///
    /// # Errors
    /// Returns an error if the tokenizer cannot decode the window.
    pub fn preview(&self, tokenizer: &Tokenizer, token: u32) -> Result<String, BackendError> {
        let prev_text = self.decode(tokenizer, &self.tokens[self.prev_index..self.current_index])?;
        let mut window = self.tokens[self.prev_index..].to_vec();
        window.push(token);
        let text = self.decode(tokenizer, &window)?;
        Ok(fresh_suffix(&prev_text, &text).unwrap_or_default().to_string())
    }

    /// Commit a generated token, returning the text it completed (possibly empty).
    ///
    /// # Errors
    /// Returns an error if the tokenizer cannot decode the window.
    pub fn push(&mut self, tokenizer: &Tokenizer, token: u32) -> Result<String, BackendError> {
        let prev_text = self.decode(tokenizer, &self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.decode(tokenizer, &self.tokens[self.prev_index..])?;
        match fresh_suffix(&prev_text, &text) {
            Some(added) => {
                let added = added.to_string();
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                Ok(added)
            }
            None => Ok(String::new()),
        }
    }

    /// Record tokens whose text the caller already placed in the transcript.
    ///
    /// Any held-back partial text is dropped. The last forced token stays in the window so the
    /// next generated token decodes with correct leading spacing.
    pub fn skip(&mut self, tokens: &[u32]) {
        if tokens.is_empty() {
            return;
        }
        self.tokens.extend_from_slice(tokens);
        self.current_index = self.tokens.len();
        self.prev_index = self.current_index - 1;
    }

    /// Total tokens seen, generated and forced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[allow(clippy::unused_self)]
    fn decode(&self, tokenizer: &Tokenizer, tokens: &[u32]) -> Result<String, BackendError> {
        if tokens.is_empty() {
            return Ok(String::new());
        }
        tokenizer
            .decode(tokens, false)
            .map_err(BackendError::tokenizer)
    }
}

fn fresh_suffix<'a>(prev_text: &str, text: &'a str) -> Option<&'a str> {
    if text.len() <= prev_text.len() || text.ends_with('\u{fffd}') {
        return None;
    }
    if !text.is_char_boundary(prev_text.len()) {
        return None;
    }
    Some(&text[prev_text.len()..])
}
