//! Decode state for one reasoning run.
//!
//! Tracks the reasoning and answer budgets and answers the questions the controller asks at each
//! step: is this close premature, must the span be force-closed, is the answer budget spent.
//! Counters only ever grow.

use crate::config::SessionConfig;

/// How the thinking span was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The model proposed the end marker after the minimum was met.
    Natural,
    /// The controller appended the end marker on reaching a cap.
    Forced,
}

/// Mutable counters owned by the controller for the duration of one run.
#[derive(Debug, Clone)]
pub struct DecodeState {
    min_reasoning_units: usize,
    max_reasoning_units: usize,
    max_thought_switches: usize,
    max_answer_units: usize,

    reasoning_units: usize,
    answer_units: usize,
    thought_switches: usize,
    steps: usize,
    closure: Option<Closure>,
}

impl DecodeState {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            min_reasoning_units: config.min_reasoning_units,
            max_reasoning_units: config.max_reasoning_units,
            max_thought_switches: config.max_thought_switches,
            max_answer_units: config.max_answer_units,
            reasoning_units: 0,
            answer_units: 0,
            thought_switches: 0,
            steps: 0,
            closure: None,
        }
    }

    #[must_use]
    pub fn reasoning_units(&self) -> usize {
        self.reasoning_units
    }

    #[must_use]
    pub fn answer_units(&self) -> usize {
        self.answer_units
    }

    #[must_use]
    pub fn thought_switches(&self) -> usize {
        self.thought_switches
    }

    /// Units requested from the token source so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    #[must_use]
    pub fn seen_end_marker(&self) -> bool {
        self.closure.is_some()
    }

    #[must_use]
    pub fn closure(&self) -> Option<Closure> {
        self.closure
    }

    /// A close attempt now would come before the minimum is met.
    #[must_use]
    pub fn is_premature(&self) -> bool {
        self.reasoning_units < self.min_reasoning_units
    }

    /// Hard cap reached while the span is still open.
    #[must_use]
    pub fn should_force_close(&self) -> bool {
        !self.seen_end_marker()
            && (self.reasoning_units >= self.max_reasoning_units
                || self.thought_switches >= self.max_thought_switches)
    }

    /// Span closed and the answer budget is spent.
    #[must_use]
    pub fn answer_exhausted(&self) -> bool {
        self.seen_end_marker() && self.answer_units >= self.max_answer_units
    }

    /// Count one request to the token source.
    pub fn begin_step(&mut self) {
        self.steps += 1;
    }

    /// Record accepted content. Every unit is worth at least one so empty pieces cannot stall
    /// the loop.
    pub fn record_content(&mut self, units: usize, thought_switch: bool) {
        let units = units.max(1);
        if self.seen_end_marker() {
            self.answer_units += units;
        } else {
            self.reasoning_units += units;
            if thought_switch {
                self.thought_switches += 1;
            }
        }
    }

    /// Record a replacement phrase injected in place of a close attempt.
    pub fn record_injection(&mut self, units: usize) {
        self.reasoning_units += units.max(1);
        self.thought_switches += 1;
    }

    /// Mark the span closed. Later calls keep the first closure.
    pub fn close(&mut self, how: Closure) {
        if self.closure.is_none() {
            self.closure = Some(how);
        }
    }
}
