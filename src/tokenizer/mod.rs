pub mod counting;
pub mod markers;
pub mod stream;

// Re-exports for convenience
pub use counting::{Counting, UnitCounter};
pub use markers::{MarkerSet, UnitClass, Vocabulary};
pub use stream::TokenStream;
