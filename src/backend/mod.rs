//! Token sources the decode controller can drive.
//!
//! A source proposes one unit at a time. Proposals are never committed on their own: the
//! controller either accepts a proposal or injects replacement text in its place, and the source
//! feeds whichever it was told into its next step.

pub mod llama;
pub mod loader;
pub mod simulated;

use crate::error::BackendError;
use crate::tokenizer::markers::Vocabulary;

pub use llama::{LlamaModel, LlamaSource};
pub use simulated::{Drive, SimulatedSource};

/// One unit proposed by a token source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission<Id> {
    pub id: Id,
    /// Text the unit adds to the transcript if accepted.
    pub text: String,
    /// Reasoning units the unit is worth under the source's counting rule.
    pub units: usize,
}

/// Next-unit provider for the decode controller.
pub trait TokenSource: Vocabulary {
    /// Per-run state threaded through successive calls (KV cache, pending token, ...).
    type Context;

    /// Measure text with the source's unit-counting rule.
    ///
    /// # Errors
    /// Returns an error if the text cannot be measured.
    fn count_units(&self, text: &str) -> Result<usize, BackendError>;

    /// Start a run from the fully formatted context text.
    ///
    /// # Errors
    /// Returns an error if the context cannot be encoded.
    fn open(&mut self, context: &str) -> Result<Self::Context, BackendError>;

    /// Propose the next unit.
    ///
    /// # Errors
    /// Returns an error if the backend fails to produce a unit.
    fn propose(&mut self, ctx: &mut Self::Context) -> Result<Emission<Self::Id>, BackendError>;

    /// Commit the most recent proposal to the context.
    ///
    /// # Errors
    /// Returns an error if the backend cannot record the unit.
    fn accept(
        &mut self,
        ctx: &mut Self::Context,
        emission: &Emission<Self::Id>,
    ) -> Result<(), BackendError>;

    /// Discard the most recent proposal and feed `text` instead. Also called without a proposal
    /// (force-close), in which case `text` follows whatever was accepted last.
    ///
    /// Returns the units `text` is worth.
    ///
    /// # Errors
    /// Returns an error if the text cannot be encoded.
    fn inject(&mut self, ctx: &mut Self::Context, text: &str) -> Result<usize, BackendError>;
}
