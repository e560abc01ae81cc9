use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MIN_REASONING_UNITS: usize = 128;
pub const DEFAULT_MAX_REASONING_UNITS: usize = 4196;
pub const DEFAULT_MAX_THOUGHT_SWITCHES: usize = 64;
pub const DEFAULT_MAX_ANSWER_UNITS: usize = 2048;
pub const DEFAULT_START_MARKER: &str = "<think>";
pub const DEFAULT_END_MARKER: &str = "</think>";
pub const DEFAULT_REPLACEMENT_PHRASES: &[&str] = &["\nWait, but", "\nHmm", "\nSo"];
pub const DEFAULT_THOUGHT_SWITCH_PHRASES: &[&str] = &["Wait,", "Alternatively,"];

/// Key under which request payloads nest the controller options.
pub const REQUEST_OPTIONS_KEY: &str = "thinkdeeper_config";

/// What happens after the controller appends the end marker on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceClosePolicy {
    /// Stop immediately after the forced marker.
    Halt,
    /// Let the model write its answer (bounded by `max_answer_units`).
    #[default]
    Answer,
}

/// Partial options as they arrive with a request. Missing fields take defaults.
///
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkDeeperOptions {
    #[serde(default, alias = "min_thinking_tokens", skip_serializing_if = "Option::is_none")]
    pub min_reasoning_units: Option<usize>,
    #[serde(default, alias = "max_thinking_tokens", skip_serializing_if = "Option::is_none")]
    pub max_reasoning_units: Option<usize>,
    #[serde(default, alias = "max_thoughts", skip_serializing_if = "Option::is_none")]
    pub max_thought_switches: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_answer_units: Option<usize>,
    #[serde(default, alias = "replacements", skip_serializing_if = "Option::is_none")]
    pub replacement_phrases: Option<Vec<String>>,
    #[serde(default, alias = "thought_switch_tokens", skip_serializing_if = "Option::is_none")]
    pub thought_switch_phrases: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<String>,
    #[serde(default, alias = "start_think_token", skip_serializing_if = "Option::is_none")]
    pub start_marker: Option<String>,
    #[serde(default, alias = "end_think_token", skip_serializing_if = "Option::is_none")]
    pub end_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_close: Option<ForceClosePolicy>,
}

impl ThinkDeeperOptions {
    /// Parse options from a JSON string.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if a recognized key carries the wrong type.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read options from a request payload: the nested `thinkdeeper_config` object when present,
    /// otherwise the payload itself. A payload that is not a JSON object yields no options.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if a recognized key carries the wrong type.
    pub fn from_request(request: &serde_json::Value) -> Result<Self, ConfigError> {
        let section = request.get(REQUEST_OPTIONS_KEY).unwrap_or(request);
        if section.is_object() {
            Ok(Self::deserialize(section)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    #[must_use]
    pub fn merged(self, other: Self) -> Self {
        Self {
            min_reasoning_units: other.min_reasoning_units.or(self.min_reasoning_units),
            max_reasoning_units: other.max_reasoning_units.or(self.max_reasoning_units),
            max_thought_switches: other.max_thought_switches.or(self.max_thought_switches),
            max_answer_units: other.max_answer_units.or(self.max_answer_units),
            replacement_phrases: other.replacement_phrases.or(self.replacement_phrases),
            thought_switch_phrases: other.thought_switch_phrases.or(self.thought_switch_phrases),
            prefill: other.prefill.or(self.prefill),
            start_marker: other.start_marker.or(self.start_marker),
            end_marker: other.end_marker.or(self.end_marker),
            force_close: other.force_close.or(self.force_close),
        }
    }
}

/// Immutable per-request settings for one controller run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Units that must be produced inside the thinking span before a close is honored.
    pub min_reasoning_units: usize,
    /// Units after which the span is force-closed.
    pub max_reasoning_units: usize,
    /// Cap on thought switches (injections plus switch phrases the model writes itself).
    pub max_thought_switches: usize,
    /// Cap on content accepted after the span closes.
    pub max_answer_units: usize,
    /// Phrases injected in place of a premature close. Picked uniformly at random.
    pub replacement_phrases: Vec<String>,
    /// Phrases recognized in generated content as a thought switch.
    pub thought_switch_phrases: Vec<String>,
    /// Text seeded right after the start marker.
    pub prefill: String,
    pub start_marker: String,
    pub end_marker: String,
    pub force_close: ForceClosePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_reasoning_units: DEFAULT_MIN_REASONING_UNITS,
            max_reasoning_units: DEFAULT_MAX_REASONING_UNITS,
            max_thought_switches: DEFAULT_MAX_THOUGHT_SWITCHES,
            max_answer_units: DEFAULT_MAX_ANSWER_UNITS,
            replacement_phrases: owned(DEFAULT_REPLACEMENT_PHRASES),
            thought_switch_phrases: owned(DEFAULT_THOUGHT_SWITCH_PHRASES),
            prefill: String::new(),
            start_marker: DEFAULT_START_MARKER.to_string(),
            end_marker: DEFAULT_END_MARKER.to_string(),
            force_close: ForceClosePolicy::default(),
        }
    }
}

fn owned(phrases: &[&str]) -> Vec<String> {
    phrases.iter().map(ToString::to_string).collect()
}

impl SessionConfig {
    /// Apply defaults for every missing option, then validate.
    ///
    /// # Errors
    /// Returns the first invariant the resolved config violates.
    pub fn resolve(options: &ThinkDeeperOptions) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let options = options.clone();
        let config = Self {
            min_reasoning_units: options
                .min_reasoning_units
                .unwrap_or(defaults.min_reasoning_units),
            max_reasoning_units: options
                .max_reasoning_units
                .unwrap_or(defaults.max_reasoning_units),
            max_thought_switches: options
                .max_thought_switches
                .unwrap_or(defaults.max_thought_switches),
            max_answer_units: options.max_answer_units.unwrap_or(defaults.max_answer_units),
            replacement_phrases: options
                .replacement_phrases
                .unwrap_or(defaults.replacement_phrases),
            thought_switch_phrases: options
                .thought_switch_phrases
                .unwrap_or(defaults.thought_switch_phrases),
            prefill: options.prefill.unwrap_or(defaults.prefill),
            start_marker: options.start_marker.unwrap_or(defaults.start_marker),
            end_marker: options.end_marker.unwrap_or(defaults.end_marker),
            force_close: options.force_close.unwrap_or(defaults.force_close),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve from a request payload. See [`ThinkDeeperOptions::from_request`].
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for mistyped keys and any validation failure.
    pub fn from_request(request: &serde_json::Value) -> Result<Self, ConfigError> {
        Self::resolve(&ThinkDeeperOptions::from_request(request)?)
    }

    /// Check the invariants the controller relies on.
    ///
    /// # Errors
    /// Returns a descriptive [`ConfigError`] for the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reasoning_units == 0 {
            return Err(ConfigError::ZeroBound {
                field: "max_reasoning_units",
            });
        }
        if self.max_thought_switches == 0 {
            return Err(ConfigError::ZeroBound {
                field: "max_thought_switches",
            });
        }
        if self.max_answer_units == 0 {
            return Err(ConfigError::ZeroBound {
                field: "max_answer_units",
            });
        }
        if self.min_reasoning_units > self.max_reasoning_units {
            return Err(ConfigError::InvalidBounds {
                min: self.min_reasoning_units,
                max: self.max_reasoning_units,
            });
        }
        if self.replacement_phrases.is_empty() {
            return Err(ConfigError::EmptyReplacements);
        }
        check_phrases("replacement_phrases", &self.replacement_phrases)?;
        check_phrases("thought_switch_phrases", &self.thought_switch_phrases)?;
        if self.start_marker.is_empty() {
            return Err(ConfigError::EmptyMarker { which: "start" });
        }
        if self.end_marker.is_empty() {
            return Err(ConfigError::EmptyMarker { which: "end" });
        }
        if self.start_marker == self.end_marker {
            return Err(ConfigError::MarkerCollision {
                marker: self.end_marker.clone(),
            });
        }
        Ok(())
    }

    /// Upper bound on token-source requests in one run.
    ///
    /// Every request either adds a reasoning unit, adds an answer unit, triggers an injection
    /// (which counts as a thought switch), or ends the run.
    #[must_use]
    pub fn step_bound(&self) -> usize {
        self.max_reasoning_units
            .saturating_add(self.max_thought_switches)
            .saturating_add(self.max_answer_units)
            .saturating_add(2)
    }

    /// Text placed in the transcript before generation starts.
    #[must_use]
    pub fn seed_text(&self) -> String {
        format!("{}\n{}", self.start_marker, self.prefill)
    }
}

fn check_phrases(field: &'static str, phrases: &[String]) -> Result<(), ConfigError> {
    match phrases.iter().position(|p| p.trim().is_empty()) {
        Some(index) => Err(ConfigError::BlankPhrase { field, index }),
        None => Ok(()),
    }
}

impl From<&SessionConfig> for ThinkDeeperOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            min_reasoning_units: Some(config.min_reasoning_units),
            max_reasoning_units: Some(config.max_reasoning_units),
            max_thought_switches: Some(config.max_thought_switches),
            max_answer_units: Some(config.max_answer_units),
            replacement_phrases: Some(config.replacement_phrases.clone()),
            thought_switch_phrases: Some(config.thought_switch_phrases.clone()),
            prefill: Some(config.prefill.clone()),
            start_marker: Some(config.start_marker.clone()),
            end_marker: Some(config.end_marker.clone()),
            force_close: Some(config.force_close),
        }
    }
}
