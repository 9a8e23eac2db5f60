pub mod dsl;
pub mod engine;
pub mod rank;

pub use dsl::{QueryRequest, QueryResponse, QueryScope, RankedPassage, ResultSource};
pub use engine::{QueryError, RetrievalEngine};
