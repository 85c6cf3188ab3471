use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, info_span, Instrument};

use super::index::{EmbeddingIndex, IndexedDoc};
use super::schema::{keyword_context, schema_docs};
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::llm_client::{ChatModel, EmbeddingModel};

/// Index entries handed to the model in embeddings mode.
const TOP_K: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagMode {
    /// Keyword match over table and column names.
    #[default]
    Simple,
    /// Cosine ranking against the persisted embedding index.
    Embeddings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub mode: RagMode,
    pub answer: String,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub count: usize,
    pub docs_processed: Vec<String>,
}

/// Embed one document per table and persist the result at `path`.
pub async fn build_index(
    store: &Store,
    embedder: &dyn EmbeddingModel,
    path: &Path,
) -> AppResult<IndexSummary> {
    let docs = schema_docs(store)?;
    info!(tables = docs.len(), "Building embedding index");

    let mut indexed = Vec::with_capacity(docs.len());
    for doc in docs {
        let span = info_span!("embed_doc", source = %doc.source);
        let embedding = embedder.embed(&doc.text).instrument(span).await?;
        indexed.push(IndexedDoc::new(doc, embedding));
    }

    let index = EmbeddingIndex::new(indexed);
    index.save(path)?;
    Ok(IndexSummary {
        count: index.count,
        docs_processed: index.docs.iter().map(|d| d.source.clone()).collect(),
    })
}

/// Retrieve context for `question` in the requested mode and ask the chat
/// model to answer from it.
pub async fn answer_question(
    store: &Store,
    chat: &dyn ChatModel,
    embedder: &dyn EmbeddingModel,
    index_path: &Path,
    question: &str,
    mode: RagMode,
) -> AppResult<QueryAnswer> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AppError::Validation("Field 'question' is required".into()));
    }

    let context = match mode {
        RagMode::Simple => keyword_context(store, question)?,
        RagMode::Embeddings => embedding_context(embedder, index_path, question).await?,
    };
    info!(mode = ?mode, blocks = context.len(), "Answering schema question");

    let answer = chat
        .complete(None, &answer_prompt(&context.join("\n\n"), question))
        .await?;
    Ok(QueryAnswer {
        mode,
        answer,
        context,
    })
}

async fn embedding_context(
    embedder: &dyn EmbeddingModel,
    index_path: &Path,
    question: &str,
) -> AppResult<Vec<String>> {
    let index = EmbeddingIndex::load(index_path)
        .filter(|index| !index.is_empty())
        .ok_or(AppError::IndexMissing)?;
    let query = embedder.embed(question).await?;
    Ok(index
        .top_k(&query, TOP_K)
        .iter()
        .map(|hit| {
            format!(
                "Source: {}\n{}\n(score: {:.4})",
                hit.doc.source, hit.doc.text, hit.score
            )
        })
        .collect())
}

pub fn answer_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an assistant specialised in answering questions about a SQLite database.\n\
         Use ONLY the context provided to answer clearly and objectively.\n\
         If the context is not enough, explain what is missing and suggest how to obtain it.\n\n\
         Question:\n{question}\n\n\
         Context (tables, columns, samples):\n{context}\n\n\
         Answer format:\n\
         - Explain the reasoning based on the context.\n\
         - When applicable, propose example SQL queries (SQLite dialect).\n\
         - Do not invent data that is not in the context."
    )
}
