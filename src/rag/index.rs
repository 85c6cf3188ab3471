use serde::{Deserialize, Serialize};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use super::schema::SchemaDoc;
use super::similarity::{Similarity, cosine_similarity};
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDoc {
    pub id: String,
    pub source: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl IndexedDoc {
    pub fn new(doc: SchemaDoc, embedding: Vec<f32>) -> Self {
        Self {
            id: doc.id,
            source: doc.source,
            text: doc.text,
            embedding,
        }
    }
}

/// Flat list of embedded documents. Queries scan every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingIndex {
    pub created_at: String,
    pub count: usize,
    pub docs: Vec<IndexedDoc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredDoc<'a> {
    pub doc: &'a IndexedDoc,
    pub score: f32,
}

/// Current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

impl EmbeddingIndex {
    pub fn new(docs: Vec<IndexedDoc>) -> Self {
        Self {
            created_at: now_rfc3339(),
            count: docs.len(),
            docs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Read the index file. A missing or unreadable file yields `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Could not read embedding index");
                }
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Embedding index is corrupt, ignoring it");
                None
            }
        }
    }

    /// Write the index as pretty JSON, creating the parent directory.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), count = self.count, "Embedding index saved");
        Ok(())
    }

    /// The `k` best entries for `query` under `similarity`, best first.
    pub fn top_k_by(&self, query: &[f32], k: usize, similarity: Similarity) -> Vec<ScoredDoc<'_>> {
        let mut scored: Vec<ScoredDoc<'_>> = self
            .docs
            .iter()
            .map(|doc| ScoredDoc {
                doc,
                score: similarity(query, &doc.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        scored
    }

    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<ScoredDoc<'_>> {
        self.top_k_by(query, k, cosine_similarity)
    }
}
