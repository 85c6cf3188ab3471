use regex::Regex;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::sync::LazyLock;

use crate::db::Store;
use crate::error::AppResult;

/// Sample rows embedded in each indexed table document.
const DOC_SAMPLE_ROWS: usize = 3;
/// Sample rows attached to a keyword-mode match.
const KEYWORD_SAMPLE_ROWS: usize = 2;

static NON_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9áéíóúâêîôûãõç\s_]").expect("valid regex"));

/// Text describing one table, the unit of retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDoc {
    pub id: String,
    pub source: String,
    pub text: String,
}

/// Lowercase words of a question; punctuation splits words.
pub fn tokenize(text: &str) -> Vec<String> {
    NON_TOKEN
        .replace_all(&text.to_lowercase(), " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn render_samples(rows: &[Map<String, Value>]) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(rows)?)
}

/// One document per user table: columns with type and nullability, plus
/// a few sample rows.
pub fn schema_docs(store: &Store) -> AppResult<Vec<SchemaDoc>> {
    let mut docs = Vec::new();
    for table in store.table_names()? {
        let mut text = format!("Table: {table}\nColumns:\n");
        for column in store.columns(&table)? {
            let nullable = if column.nullable { "YES" } else { "NO" };
            let _ = writeln!(
                text,
                "- {} ({}, nullable: {nullable})",
                column.name, column.data_type
            );
        }
        let samples = store.sample_rows(&table, DOC_SAMPLE_ROWS)?;
        if samples.is_empty() {
            text.push_str("No samples (empty table).");
        } else {
            let _ = write!(
                text,
                "Samples (up to {DOC_SAMPLE_ROWS} rows):\n{}",
                render_samples(&samples)?
            );
        }
        docs.push(SchemaDoc {
            id: format!("table:{table}"),
            source: table,
            text,
        });
    }
    Ok(docs)
}

/// Context blocks for every table whose name or column names contain one
/// of the question's tokens.
pub fn keyword_context(store: &Store, question: &str) -> AppResult<Vec<String>> {
    let tokens = tokenize(question);
    let mut parts = Vec::new();
    if tokens.is_empty() {
        return Ok(parts);
    }

    for table in store.table_names()? {
        let columns = store.columns(&table)?;
        let haystack = std::iter::once(table.as_str())
            .chain(columns.iter().map(|c| c.name.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if !tokens.iter().any(|t| haystack.contains(t.as_str())) {
            continue;
        }

        let column_list = columns
            .iter()
            .map(|c| format!("{}({})", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        let samples = store.sample_rows(&table, KEYWORD_SAMPLE_ROWS)?;
        let samples = if samples.is_empty() {
            "no samples".to_string()
        } else {
            render_samples(&samples)?
        };
        parts.push(format!("Table {table}\nColumns: {column_list}\nSamples: {samples}"));
    }
    Ok(parts)
}
