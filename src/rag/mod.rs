//! Natural-language questions about the database schema.
//!
//! Two retrieval modes feed the answering model: a keyword match over table
//! and column names, and a cosine ranking against a flat embedding index
//! persisted as JSON.

mod index;
mod query;
mod schema;
mod similarity;

pub use index::now_rfc3339;
pub use query::{IndexSummary, QueryAnswer, RagMode, answer_question, build_index};
