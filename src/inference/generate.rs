//! Reasoning-length enforcing decode loop.
//!
//! Drives a [`TokenSource`] one unit at a time. Close attempts that come too early (the end
//! marker before the minimum, or end of sequence before the span was ever closed) are replaced
//! with a randomly chosen continuation phrase. Once a cap is hit the controller closes the span
//! itself, and after that no more substitutions happen, so every run terminates within
//! [`SessionConfig::step_bound`] requests.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::backend::{Emission, TokenSource};
use crate::config::{ForceClosePolicy, SessionConfig};
use crate::error::{ConfigError, ThinkError};
use crate::inference::constraints::{Closure, DecodeState};
use crate::tokenizer::markers::{MarkerSet, UnitClass};

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// End of sequence after the span was closed.
    EndOfSequence,
    /// A cap was reached and the force-close policy is `halt`.
    ForceClosed,
    /// The answer budget after the span closed was spent.
    AnswerBudget,
}

/// Why a replacement phrase was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionCause {
    /// End marker proposed before the minimum was met.
    PrematureClose,
    /// End of sequence proposed while the span was still open.
    UnterminatedReasoning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Substitution {
    pub phrase: String,
    pub cause: SubstitutionCause,
    /// Reasoning units counted before the injection.
    pub at_units: usize,
}

/// Finished run.
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    /// Generated text: start marker, prefill, reasoning, end marker, answer. No prompt.
    pub text: String,
    /// `text` measured with the source's counting rule.
    pub units_consumed: usize,
    pub reasoning_units: usize,
    pub answer_units: usize,
    pub thought_switches: usize,
    /// Requests made to the token source.
    pub steps: usize,
    pub forced_close: bool,
    pub stop: StopReason,
    pub substitutions: Vec<Substitution>,
}

/// Ordered transcript with the prompt prefix recorded so it can be cut off at the end.
#[derive(Debug)]
struct Transcript {
    text: String,
    prompt_len: usize,
}

impl Transcript {
    fn new(prompt: &str) -> Self {
        Self {
            text: prompt.to_string(),
            prompt_len: prompt.len(),
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    /// Generated text seen so far, limited to roughly the last `bytes`.
    fn tail(&self, bytes: usize) -> &str {
        let generated = &self.text[self.prompt_len..];
        let mut start = generated.len().saturating_sub(bytes);
        while !generated.is_char_boundary(start) {
            start -= 1;
        }
        &generated[start..]
    }

    fn into_generated(mut self) -> String {
        self.text.split_off(self.prompt_len)
    }
}

/// Decode controller bound to one token source and one session config.
pub struct ReasoningController<S: TokenSource> {
    source: S,
    config: SessionConfig,
    markers: MarkerSet<S::Id>,
}

impl<S: TokenSource> std::fmt::Debug for ReasoningController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningController")
            .field("config", &self.config)
            .field("markers", &self.markers)
            .finish_non_exhaustive()
    }
}

impl<S: TokenSource> ReasoningController<S> {
    /// Validate `config` and resolve its markers against the source.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] before any generation happens.
    pub fn new(source: S, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let markers = MarkerSet::resolve(&source, &config)?;
        Ok(Self {
            source,
            config,
            markers,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Generate from an already formatted prompt.
    ///
    /// `rng` picks replacement phrases; pass a seeded or mock generator for reproducible runs.
    ///
    /// # Errors
    /// Returns [`ThinkError::Backend`] if the source fails. No partial text is returned.
    pub fn run<R: Rng + ?Sized>(&mut self, prompt: &str, rng: &mut R) -> Result<Generation, ThinkError> {
        let seed = self.config.seed_text();
        let mut transcript = Transcript::new(prompt);
        transcript.push(&seed);
        let mut ctx = self.source.open(&format!("{prompt}{seed}"))?;

        let mut state = DecodeState::new(&self.config);
        let mut substitutions = Vec::new();
        let window = self.markers.switch_window();

        let stop = loop {
            if state.should_force_close() {
                tracing::debug!(
                    units = state.reasoning_units(),
                    switches = state.thought_switches(),
                    "force-closing thinking span"
                );
                let marker = self.markers.end_text().to_string();
                self.source.inject(&mut ctx, &marker)?;
                transcript.push(&marker);
                state.close(Closure::Forced);
                if self.config.force_close == ForceClosePolicy::Halt {
                    break StopReason::ForceClosed;
                }
                continue;
            }
            if state.answer_exhausted() {
                break StopReason::AnswerBudget;
            }

            state.begin_step();
            let emission = self.source.propose(&mut ctx)?;
            let class = self
                .markers
                .classify(emission.id, &emission.text, transcript.tail(window));

            match class {
                UnitClass::EndOfSequence if state.seen_end_marker() => {
                    break StopReason::EndOfSequence;
                }
                UnitClass::EndOfSequence => {
                    let sub = self.substitute(
                        &mut ctx,
                        &mut state,
                        &mut transcript,
                        SubstitutionCause::UnterminatedReasoning,
                        rng,
                    )?;
                    substitutions.push(sub);
                }
                UnitClass::EndMarker if !state.seen_end_marker() && state.is_premature() => {
                    let sub = self.substitute(
                        &mut ctx,
                        &mut state,
                        &mut transcript,
                        SubstitutionCause::PrematureClose,
                        rng,
                    )?;
                    substitutions.push(sub);
                }
                UnitClass::EndMarker => {
                    let first = !state.seen_end_marker();
                    self.accept(&mut ctx, &mut transcript, &emission)?;
                    if first {
                        tracing::debug!(units = state.reasoning_units(), "thinking span closed");
                        state.close(Closure::Natural);
                    } else {
                        state.record_content(emission.units, false);
                    }
                }
                UnitClass::ThoughtSwitch | UnitClass::Content => {
                    self.accept(&mut ctx, &mut transcript, &emission)?;
                    state.record_content(emission.units, class == UnitClass::ThoughtSwitch);
                }
            }
        };

        let text = transcript.into_generated();
        let units_consumed = self.source.count_units(&text)?;
        tracing::info!(
            reasoning_units = state.reasoning_units(),
            answer_units = state.answer_units(),
            thought_switches = state.thought_switches(),
            steps = state.steps(),
            substitutions = substitutions.len(),
            ?stop,
            "reasoning run finished"
        );

        Ok(Generation {
            text,
            units_consumed,
            reasoning_units: state.reasoning_units(),
            answer_units: state.answer_units(),
            thought_switches: state.thought_switches(),
            steps: state.steps(),
            forced_close: state.closure() == Some(Closure::Forced),
            stop,
            substitutions,
        })
    }

    fn accept(
        &mut self,
        ctx: &mut S::Context,
        transcript: &mut Transcript,
        emission: &Emission<S::Id>,
    ) -> Result<(), ThinkError> {
        self.source.accept(ctx, emission)?;
        transcript.push(&emission.text);
        Ok(())
    }

    fn substitute<R: Rng + ?Sized>(
        &mut self,
        ctx: &mut S::Context,
        state: &mut DecodeState,
        transcript: &mut Transcript,
        cause: SubstitutionCause,
        rng: &mut R,
    ) -> Result<Substitution, ThinkError> {
        let phrase = self
            .config
            .replacement_phrases
            .choose(rng)
            .cloned()
            .ok_or(ConfigError::EmptyReplacements)?;
        let at_units = state.reasoning_units();
        let units = self.source.inject(ctx, &phrase)?;
        transcript.push(&phrase);
        state.record_injection(units);
        tracing::debug!(?cause, phrase = %phrase.escape_debug(), units, at_units, "injected replacement");
        Ok(Substitution {
            phrase,
            cause,
            at_units,
        })
    }
}

/// Build a controller for `source` and run it once.
///
/// # Errors
/// [`ThinkError::Config`] for invalid settings or unresolvable markers, [`ThinkError::Backend`]
/// if the source fails mid-run.
pub fn reasoning_effort<S, R>(
    source: S,
    prompt: &str,
    config: &SessionConfig,
    rng: &mut R,
) -> Result<Generation, ThinkError>
where
    S: TokenSource,
    R: Rng + ?Sized,
{
    let mut controller = ReasoningController::new(source, config.clone())?;
    controller.run(prompt, rng)
}
