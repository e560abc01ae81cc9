//! Marker resolution and unit classification.
//!
//! Maps the configured markers onto whatever identity a token source emits (token ids for a real
//! tokenizer, vocabulary slots for the simulator) so the decode loop can compare units cheaply.

use std::fmt::Debug;

use crate::config::SessionConfig;
use crate::error::ConfigError;

/// Vocabulary side of a token source.
pub trait Vocabulary {
    /// Identity of one emitted unit.
    type Id: Copy + Eq + Debug;

    /// Resolve a marker string to exactly one unit.
    ///
    /// # Errors
    /// [`ConfigError::UnresolvableMarker`] if the marker is unknown, or
    /// [`ConfigError::AmbiguousMarker`] if it spans several units.
    fn resolve_marker(&self, marker: &str) -> Result<Self::Id, ConfigError>;

    /// Identities that signal end of sequence.
    fn end_of_sequence(&self) -> Vec<Self::Id>;
}

/// What a proposed unit means to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitClass {
    EndMarker,
    EndOfSequence,
    /// Ordinary content that completes one of the configured thought-switch phrases.
    ThoughtSwitch,
    Content,
}

/// Resolved markers for one session.
#[derive(Debug, Clone)]
pub struct MarkerSet<Id> {
    start: Id,
    end: Id,
    eos: Vec<Id>,
    end_text: String,
    switch_phrases: Vec<String>,
}

impl<Id: Copy + Eq + Debug> MarkerSet<Id> {
    /// Resolve the configured markers against a vocabulary.
    ///
    /// # Errors
    /// Fails if a marker is unknown, spans several units, or collides with another marker or an
    /// end-of-sequence unit.
    pub fn resolve<V>(vocab: &V, config: &SessionConfig) -> Result<Self, ConfigError>
    where
        V: Vocabulary<Id = Id> + ?Sized,
    {
        let start = vocab.resolve_marker(&config.start_marker)?;
        let end = vocab.resolve_marker(&config.end_marker)?;
        if start == end {
            return Err(ConfigError::MarkerCollision {
                marker: config.end_marker.clone(),
            });
        }

        let eos = vocab.end_of_sequence();
        for (id, marker) in [(start, &config.start_marker), (end, &config.end_marker)] {
            if eos.contains(&id) {
                return Err(ConfigError::MarkerCollision {
                    marker: marker.clone(),
                });
            }
        }

        tracing::debug!(?start, ?end, ?eos, "resolved think markers");
        Ok(Self {
            start,
            end,
            eos,
            end_text: config.end_marker.clone(),
            switch_phrases: config.thought_switch_phrases.clone(),
        })
    }

    #[must_use]
    pub fn start(&self) -> Id {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Id {
        self.end
    }

    #[must_use]
    pub fn end_text(&self) -> &str {
        &self.end_text
    }

    #[must_use]
    pub fn is_end_of_sequence(&self, id: Id) -> bool {
        self.eos.contains(&id)
    }

    /// Classify a proposed unit.
    ///
    /// `tail` is the recent transcript text preceding the unit; it lets a switch phrase split
    /// across several units still be recognized once, on the unit that completes it.
    #[must_use]
    pub fn classify(&self, id: Id, text: &str, tail: &str) -> UnitClass {
        if id == self.end {
            UnitClass::EndMarker
        } else if self.is_end_of_sequence(id) {
            UnitClass::EndOfSequence
        } else if self.completes_switch(text, tail) {
            UnitClass::ThoughtSwitch
        } else {
            UnitClass::Content
        }
    }

    /// Longest switch phrase in bytes; callers keep at least this much tail.
    #[must_use]
    pub fn switch_window(&self) -> usize {
        self.switch_phrases.iter().map(String::len).max().unwrap_or(0)
    }

    fn completes_switch(&self, text: &str, tail: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let joined = format!("{tail}{text}");
        self.switch_phrases.iter().any(|phrase| {
            joined
                .rfind(phrase.as_str())
                .is_some_and(|pos| pos + phrase.len() > tail.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vocabulary where every word is its own unit.
    struct Words(Vec<&'static str>);

    impl Vocabulary for Words {
        type Id = usize;

        fn resolve_marker(&self, marker: &str) -> Result<usize, ConfigError> {
            let pieces = marker.split_whitespace().count();
            if pieces != 1 {
                return Err(ConfigError::AmbiguousMarker {
                    marker: marker.to_string(),
                    pieces,
                });
            }
            self.0
                .iter()
                .position(|w| *w == marker)
                .ok_or_else(|| ConfigError::UnresolvableMarker {
                    marker: marker.to_string(),
                })
        }

        fn end_of_sequence(&self) -> Vec<usize> {
            vec![0]
        }
    }

    fn vocab() -> Words {
        Words(vec!["<eos>", "<think>", "</think>", "Wait,", "so"])
    }

    #[test]
    fn test_resolves_default_markers() {
        let set = MarkerSet::resolve(&vocab(), &SessionConfig::default()).unwrap();
        assert_eq!(set.start(), 1);
        assert_eq!(set.end(), 2);
        assert_eq!(set.end_text(), "</think>");
    }

    #[test]
    fn test_unknown_and_multi_unit_markers_fail() {
        let cfg = SessionConfig {
            end_marker: "</reason>".into(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            MarkerSet::resolve(&vocab(), &cfg),
            Err(ConfigError::UnresolvableMarker { .. })
        ));

        let cfg = SessionConfig {
            end_marker: "</think> now".into(),
            ..SessionConfig::default()
        };
        assert_eq!(
            MarkerSet::resolve(&vocab(), &cfg).unwrap_err(),
            ConfigError::AmbiguousMarker {
                marker: "</think> now".into(),
                pieces: 2
            }
        );
    }

    #[test]
    fn test_marker_equal_to_eos_fails() {
        let cfg = SessionConfig {
            end_marker: "<eos>".into(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            MarkerSet::resolve(&vocab(), &cfg),
            Err(ConfigError::MarkerCollision { .. })
        ));
    }

    #[test]
    fn test_classify_sentinels() {
        let set = MarkerSet::resolve(&vocab(), &SessionConfig::default()).unwrap();
        assert_eq!(set.classify(2, "</think>", ""), UnitClass::EndMarker);
        assert_eq!(set.classify(0, "", ""), UnitClass::EndOfSequence);
        assert_eq!(set.classify(4, "so", ""), UnitClass::Content);
    }

    #[test]
    fn test_switch_phrase_detected_once_across_units() {
        let set = MarkerSet::resolve(&vocab(), &SessionConfig::default()).unwrap();
        // "Wa" + "it," completes the phrase on the second unit.
        assert_eq!(set.classify(4, "Wa", "thinking. "), UnitClass::Content);
        assert_eq!(
            set.classify(4, "it,", "thinking. Wa"),
            UnitClass::ThoughtSwitch
        );
        // The phrase already sits in the tail: later units are plain content.
        assert_eq!(set.classify(4, " no", "thinking. Wait,"), UnitClass::Content);
        assert!(set.switch_window() >= "Alternatively,".len());
    }
}
