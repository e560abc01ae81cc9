//! Reasoning-length enforcing decode controller.
//!
//! Wraps a token source (a real model or a simulator) and keeps its thinking span open until a
//! minimum amount of reasoning has been produced, force-closing it once a cap is reached.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod inference;
pub mod tokenizer;

pub use backend::{Emission, TokenSource};
pub use config::{ForceClosePolicy, SessionConfig, ThinkDeeperOptions};
pub use error::{BackendError, ConfigError, ThinkError};
pub use inference::{
    Generation, ReasoningController, StopReason, Substitution, SubstitutionCause,
    reasoning_effort,
};
