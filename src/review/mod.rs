//! Tag collection and review state aggregation.

pub mod state;
pub mod tags;

pub use state::{ReviewStateEngine, ReviewSummary, obsoletes};
pub use tags::{BASED_ON, REVIEWED_BY, TagMatcher};
