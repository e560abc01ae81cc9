pub mod constraints;
pub mod generate;
pub mod sampling;

pub use constraints::{Closure, DecodeState};
pub use generate::{
    Generation, ReasoningController, StopReason, Substitution, SubstitutionCause,
    reasoning_effort,
};
pub use sampling::Sampler;
