//! Simulated token source.
//!
//! Emits whole phrases from a string vocabulary instead of running a model. `Drive::Script`
//! replays a fixed list of proposals (then signals end of sequence forever), which is what the
//! controller tests use. `Drive::Ramble` produces pseudo-random reasoning sentences, closes the
//! span now and then, and occasionally tries to stop without closing it at all.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::backend::{Emission, TokenSource};
use crate::config::{DEFAULT_END_MARKER, DEFAULT_START_MARKER};
use crate::error::{BackendError, ConfigError};
use crate::tokenizer::counting::{Counting, UnitCounter};
use crate::tokenizer::markers::Vocabulary;

/// Vocabulary entry for end of sequence. It contributes no text.
pub const EOS_TEXT: &str = "<|endoftext|>";

const OPENERS: &[&str] = &[
    "Let’s consider",
    "This means",
    "So,",
    "Therefore,",
    "If we think about it,",
    "The next step is",
    "That leads to",
    "Alternatively,",
];
const OBJECTS: &[&str] = &["this", "that", "the issue"];
const ANSWERS: &[&str] = &[
    "The answer follows from the steps above.",
    "In short, it works out.",
    "That settles it.",
];

/// Pseudo-random phrase generator settings.
#[derive(Debug, Clone)]
pub struct Ramble {
    rng: StdRng,
    /// Chance per step of proposing the end marker while the span is open.
    pub close_probability: f64,
    /// Chance per step of proposing end of sequence while the span is open.
    pub bare_eos_probability: f64,
    /// Answer sentences written after the span closes, before end of sequence.
    pub answer_sentences: usize,
}

impl Ramble {
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            close_probability: 0.1,
            bare_eos_probability: 0.02,
            answer_sentences: 2,
        }
    }
}

/// What the simulator proposes.
#[derive(Debug, Clone)]
pub enum Drive {
    Script(VecDeque<String>),
    Ramble(Ramble),
}

impl Drive {
    /// Scripted drive from any list of strings.
    pub fn script<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Script(items.into_iter().map(Into::into).collect())
    }
}

/// Per-run state of the simulator.
#[derive(Debug, Clone, Default)]
pub struct SimContext {
    closed: bool,
    answers: usize,
    proposals: usize,
}

impl SimContext {
    #[must_use]
    pub fn proposals(&self) -> usize {
        self.proposals
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSource {
    vocab: Vec<String>,
    index: HashMap<String, u32>,
    eos: u32,
    end_marker: String,
    counting: Counting,
    drive: Drive,
}

impl SimulatedSource {
    #[must_use]
    pub fn new(drive: Drive) -> Self {
        let mut source = Self {
            vocab: Vec::new(),
            index: HashMap::new(),
            eos: 0,
            end_marker: DEFAULT_END_MARKER.to_string(),
            counting: Counting::default(),
            drive,
        };
        source.eos = source.intern(EOS_TEXT);
        source.intern(DEFAULT_START_MARKER);
        source.intern(DEFAULT_END_MARKER);
        source
    }

    /// Use custom think markers instead of `<think>` / `</think>`.
    #[must_use]
    pub fn with_markers(mut self, start: &str, end: &str) -> Self {
        self.intern(start);
        self.intern(end);
        self.end_marker = end.to_string();
        self
    }

    #[must_use]
    pub fn with_counting(mut self, counting: Counting) -> Self {
        self.counting = counting;
        self
    }

    /// Text of a vocabulary entry.
    #[must_use]
    pub fn text_of(&self, id: u32) -> Option<&str> {
        self.vocab.get(id as usize).map(String::as_str)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn intern(&mut self, piece: &str) -> u32 {
        if let Some(&id) = self.index.get(piece) {
            return id;
        }
        let id = self.vocab.len() as u32;
        self.vocab.push(piece.to_string());
        self.index.insert(piece.to_string(), id);
        id
    }

    fn next_piece(&mut self, ctx: &SimContext) -> String {
        match &mut self.drive {
            Drive::Script(queue) => queue.pop_front().unwrap_or_else(|| EOS_TEXT.to_string()),
            Drive::Ramble(ramble) => {
                if ctx.closed {
                    if ctx.answers >= ramble.answer_sentences {
                        return EOS_TEXT.to_string();
                    }
                    let sentence = ANSWERS.choose(&mut ramble.rng).copied().unwrap_or_default();
                    return format!(" {sentence}");
                }
                let roll: f64 = ramble.rng.r#gen();
                if roll < ramble.bare_eos_probability {
                    EOS_TEXT.to_string()
                } else if roll < ramble.bare_eos_probability + ramble.close_probability {
                    self.end_marker.clone()
                } else {
                    let opener = OPENERS.choose(&mut ramble.rng).copied().unwrap_or_default();
                    let object = OBJECTS.choose(&mut ramble.rng).copied().unwrap_or_default();
                    format!(" {opener} {object}.")
                }
            }
        }
    }
}

impl Vocabulary for SimulatedSource {
    type Id = u32;

    fn resolve_marker(&self, marker: &str) -> Result<u32, ConfigError> {
        if let Some(&id) = self.index.get(marker) {
            return Ok(id);
        }
        let partial = self
            .vocab
            .iter()
            .filter(|entry| entry.contains(marker) || marker.contains(entry.as_str()))
            .count();
        if partial > 0 {
            return Err(ConfigError::AmbiguousMarker {
                marker: marker.to_string(),
                pieces: partial,
            });
        }
        Err(ConfigError::UnresolvableMarker {
            marker: marker.to_string(),
        })
    }

    fn end_of_sequence(&self) -> Vec<u32> {
        vec![self.eos]
    }
}

impl TokenSource for SimulatedSource {
    type Context = SimContext;

    fn count_units(&self, text: &str) -> Result<usize, BackendError> {
        self.counting.count_units(text)
    }

    fn open(&mut self, _context: &str) -> Result<SimContext, BackendError> {
        Ok(SimContext::default())
    }

    fn propose(&mut self, ctx: &mut SimContext) -> Result<Emission<u32>, BackendError> {
        ctx.proposals += 1;
        let piece = self.next_piece(ctx);
        // a chunk carrying the end marker is a close attempt as a whole
        let id = match self.index.get(&self.end_marker) {
            Some(&end) if piece.contains(&self.end_marker) => end,
            _ => self.intern(&piece),
        };
        let text = if id == self.eos { String::new() } else { piece };
        let units = self.counting.count_units(&text)?;
        Ok(Emission { id, text, units })
    }

    fn accept(&mut self, ctx: &mut SimContext, emission: &Emission<u32>) -> Result<(), BackendError> {
        if emission.text.contains(&self.end_marker) {
            ctx.closed = true;
        } else if ctx.closed {
            ctx.answers += 1;
        }
        Ok(())
    }

    fn inject(&mut self, ctx: &mut SimContext, text: &str) -> Result<usize, BackendError> {
        if text.contains(&self.end_marker) {
            ctx.closed = true;
        }
        self.counting.count_units(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_then_eos_forever() {
        let mut sim = SimulatedSource::new(Drive::script(["one", "two"]));
        let mut ctx = sim.open("prompt").unwrap();
        let eos = sim.end_of_sequence()[0];

        assert_eq!(sim.propose(&mut ctx).unwrap().text, "one");
        assert_eq!(sim.propose(&mut ctx).unwrap().text, "two");
        for _ in 0..3 {
            let e = sim.propose(&mut ctx).unwrap();
            assert_eq!(e.id, eos);
            assert_eq!(e.text, "");
            assert_eq!(e.units, 0);
        }
        assert_eq!(ctx.proposals(), 5);
    }

    #[test]
    fn test_same_piece_same_id() {
        let mut sim = SimulatedSource::new(Drive::script(["hm", "hm"]));
        let mut ctx = sim.open("").unwrap();
        let a = sim.propose(&mut ctx).unwrap();
        let b = sim.propose(&mut ctx).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(sim.text_of(a.id), Some("hm"));
    }

    #[test]
    fn test_marker_resolution() {
        let sim = SimulatedSource::new(Drive::script(Vec::<String>::new()));
        assert!(sim.resolve_marker("</think>").is_ok());
        assert!(matches!(
            sim.resolve_marker("</reason>"),
            Err(ConfigError::UnresolvableMarker { .. })
        ));
        // a fragment of a known marker is ambiguous rather than unknown
        assert!(matches!(
            sim.resolve_marker("think>"),
            Err(ConfigError::AmbiguousMarker { .. })
        ));
    }

    #[test]
    fn test_chunk_containing_end_marker_carries_its_id() {
        let mut sim = SimulatedSource::new(Drive::script(["done.</think> So"]));
        let end = sim.resolve_marker("</think>").unwrap();
        let mut ctx = sim.open("").unwrap();
        let e = sim.propose(&mut ctx).unwrap();
        assert_eq!(e.id, end);
        assert_eq!(e.text, "done.</think> So");
    }

    #[test]
    fn test_custom_markers() {
        let sim = SimulatedSource::new(Drive::script(Vec::<String>::new()))
            .with_markers("<reason>", "</reason>");
        assert!(sim.resolve_marker("<reason>").is_ok());
        assert!(sim.resolve_marker("</reason>").is_ok());
    }

    #[test]
    fn test_counting_rules() {
        let sim = SimulatedSource::new(Drive::script(["Let us see"]));
        assert_eq!(sim.count_units("\nWait, but").unwrap(), 2);
        let sim = sim.with_counting(Counting::Chars);
        assert_eq!(sim.count_units("abc").unwrap(), 3);
    }

    #[test]
    fn test_ramble_answers_then_stops_after_close() {
        let mut ramble = Ramble::new(Some(7));
        ramble.close_probability = 0.0;
        ramble.bare_eos_probability = 0.0;
        ramble.answer_sentences = 2;
        let mut sim = SimulatedSource::new(Drive::Ramble(ramble));
        let eos = sim.end_of_sequence()[0];
        let mut ctx = sim.open("").unwrap();

        let thought = sim.propose(&mut ctx).unwrap();
        assert!(thought.text.ends_with('.'));
        assert!(thought.units >= 2);
        sim.accept(&mut ctx, &thought).unwrap();

        sim.inject(&mut ctx, "</think>").unwrap();
        for _ in 0..2 {
            let answer = sim.propose(&mut ctx).unwrap();
            assert_ne!(answer.id, eos);
            sim.accept(&mut ctx, &answer).unwrap();
        }
        assert_eq!(sim.propose(&mut ctx).unwrap().id, eos);
    }

    #[test]
    fn test_ramble_is_reproducible() {
        let run = |seed| {
            let mut sim = SimulatedSource::new(Drive::Ramble(Ramble::new(Some(seed))));
            let mut ctx = sim.open("").unwrap();
            (0..20)
                .map(|_| sim.propose(&mut ctx).unwrap().text)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
    }
}
