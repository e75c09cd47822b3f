//! Query DSL: compilation to a predicate tree and execution against a store.

pub mod error;
pub mod executor;
pub mod predicate;
pub mod query;

pub use error::SearchError;
pub use executor::QueryExecutor;
pub use predicate::{Candidate, Predicate, SeriesFlag, StatusFilter};
pub use query::{CompiledQuery, compile, compile_at};
