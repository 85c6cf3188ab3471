use axum::Json;
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::AppState;
use crate::db::{
    Classification, ClassificationKind, ClassificationUpdate, InstallmentRow, ListFilter,
    Movement, MovementKind, MovementUpdate, NewClassification, NewParty, Party, PartyKind,
    PartyUpdate,
};
use crate::error::{AppError, AppResult};
use crate::invoice::InvoiceData;
use crate::ledger::{self, InvoiceAnalysis};
use crate::llm_extract::extract_invoice;
use crate::llm_key::token_matches;
use crate::pdf_extract;
use crate::rag::{self, RagMode};

const UPLOAD_FIELD: &str = "pdfFile";
const SETUP_TOKEN_HEADER: &str = "x-setup-token";

/// `{success: true, ...body}`
#[derive(Debug, Serialize)]
pub struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

fn done() -> Json<Value> {
    Json(json!({ "success": true }))
}

#[derive(Debug, Serialize)]
pub struct Listing<T> {
    data: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct Created {
    id: i64,
}

// -- Health --------------------------------------------------------------

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "message": "Server is running",
        "timestamp": rag::now_rfc3339(),
    }))
}

// -- Invoice intake ------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProcessedInvoice {
    #[serde(flatten)]
    invoice: InvoiceData,
    analise: InvoiceAnalysis,
}

fn upload_error(err: MultipartError, max_bytes: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge {
            max_mb: max_bytes / (1024 * 1024),
        }
    } else {
        AppError::Validation(format!("Failed to read upload: {}", err.body_text()))
    }
}

pub async fn process_pdf(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<ProcessedInvoice>> {
    let max_bytes = state.config.server.max_upload_bytes;
    let mut multipart =
        multipart.map_err(|_| AppError::Validation("No PDF file uploaded".into()))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, max_bytes))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("invoice.pdf").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| upload_error(e, max_bytes))?;
        upload = Some((file_name, content_type, bytes));
    }

    let Some((file_name, content_type, bytes)) = upload else {
        return Err(AppError::Validation("No PDF file uploaded".into()));
    };
    if content_type != "application/pdf" {
        warn!(file = %file_name, content_type = %content_type, "Rejected non-PDF upload");
        return Err(AppError::Validation("Only PDF files are allowed".into()));
    }
    if bytes.len() > max_bytes {
        return Err(AppError::PayloadTooLarge {
            max_mb: max_bytes / (1024 * 1024),
        });
    }
    info!(file = %file_name, bytes = bytes.len(), "Processing PDF");

    let text = pdf_extract::invoice_text_blocking(bytes).await?;
    let invoice = extract_invoice(state.chat.as_ref(), &text).await?;
    let analise = ledger::analyze_invoice(&state.store, &invoice)?;
    Ok(Json(ProcessedInvoice { invoice, analise }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    #[serde(default)]
    invoice_data: Option<InvoiceData>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    message: &'static str,
    dados: ledger::SavedInvoice,
}

pub async fn save_invoice(
    State(state): State<AppState>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> AppResult<Json<Success<SaveResponse>>> {
    let Json(request) = payload?;
    let invoice = request
        .invoice_data
        .ok_or_else(|| AppError::Validation("Incomplete data: invoiceData is required".into()))?;
    let dados = ledger::save_invoice(&state.store, &invoice)?;
    Ok(success(SaveResponse {
        message: "Record saved successfully!",
        dados,
    }))
}

// -- Schema Q&A ----------------------------------------------------------

pub async fn rag_index(
    State(state): State<AppState>,
) -> AppResult<Json<Success<rag::IndexSummary>>> {
    let summary = rag::build_index(
        &state.store,
        state.embedder.as_ref(),
        &state.config.rag.index_path,
    )
    .await?;
    Ok(success(summary))
}

#[derive(Debug, Deserialize)]
pub struct RagQueryRequest {
    #[serde(default)]
    question: String,
    #[serde(default)]
    mode: RagMode,
}

pub async fn rag_query(
    State(state): State<AppState>,
    payload: Result<Json<RagQueryRequest>, JsonRejection>,
) -> AppResult<Json<Success<rag::QueryAnswer>>> {
    let Json(request) = payload?;
    let answer = rag::answer_question(
        &state.store,
        state.chat.as_ref(),
        state.embedder.as_ref(),
        &state.config.rag.index_path,
        &request.question,
        request.mode,
    )
    .await?;
    Ok(success(answer))
}

// -- Pessoas -------------------------------------------------------------

pub async fn list_parties(
    State(state): State<AppState>,
    filter: Result<Query<ListFilter<PartyKind>>, QueryRejection>,
) -> AppResult<Json<Success<Listing<Party>>>> {
    let Query(filter) = filter?;
    let data = state.store.list_parties(&filter)?;
    Ok(success(Listing { data }))
}

pub async fn create_party(
    State(state): State<AppState>,
    payload: Result<Json<NewParty>, JsonRejection>,
) -> AppResult<Json<Success<Created>>> {
    let Json(input) = payload?;
    let id = state.store.create_party(&input)?;
    Ok(success(Created { id }))
}

pub async fn update_party(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<PartyUpdate>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let (Path(id), Json(input)) = (id?, payload?);
    state.store.update_party(id, &input)?;
    Ok(done())
}

pub async fn delete_party(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<Value>> {
    let Path(id) = id?;
    state.store.deactivate_party(id)?;
    Ok(done())
}

// -- Classificacao -------------------------------------------------------

pub async fn list_classifications(
    State(state): State<AppState>,
    filter: Result<Query<ListFilter<ClassificationKind>>, QueryRejection>,
) -> AppResult<Json<Success<Listing<Classification>>>> {
    let Query(filter) = filter?;
    let data = state.store.list_classifications(&filter)?;
    Ok(success(Listing { data }))
}

pub async fn create_classification(
    State(state): State<AppState>,
    payload: Result<Json<NewClassification>, JsonRejection>,
) -> AppResult<Json<Success<Created>>> {
    let Json(input) = payload?;
    let id = state.store.create_classification(&input)?;
    Ok(success(Created { id }))
}

pub async fn update_classification(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ClassificationUpdate>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let (Path(id), Json(input)) = (id?, payload?);
    state.store.update_classification(id, &input)?;
    Ok(done())
}

pub async fn delete_classification(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<Value>> {
    let Path(id) = id?;
    state.store.deactivate_classification(id)?;
    Ok(done())
}

// -- MovimentoContas -----------------------------------------------------

pub async fn list_movements(
    State(state): State<AppState>,
    filter: Result<Query<ListFilter<MovementKind>>, QueryRejection>,
) -> AppResult<Json<Success<Listing<Movement>>>> {
    let Query(filter) = filter?;
    let data = state.store.list_movements(&filter)?;
    Ok(success(Listing { data }))
}

pub async fn update_movement(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<MovementUpdate>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let (Path(id), Json(input)) = (id?, payload?);
    state.store.update_movement(id, &input)?;
    Ok(done())
}

pub async fn delete_movement(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<Value>> {
    let Path(id) = id?;
    state.store.deactivate_movement(id)?;
    Ok(done())
}

pub async fn list_installments(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<Success<Listing<InstallmentRow>>>> {
    let Path(id) = id?;
    let data = state.store.installments_for_movement(id)?;
    Ok(success(Listing { data }))
}

// -- Admin ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LlmKeyRequest {
    #[serde(default)]
    key: String,
}

/// Replace the LLM key for this process. Requires `ADMIN_SETUP_TOKEN` to be
/// configured and presented in the `X-Setup-Token` header.
pub async fn set_llm_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LlmKeyRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Some(expected) = state.config.admin_setup_token.as_deref() else {
        return Err(AppError::Forbidden(
            "Admin setup is disabled: ADMIN_SETUP_TOKEN is not set".into(),
        ));
    };
    let presented = headers
        .get(SETUP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !token_matches(expected, presented) {
        warn!("Rejected LLM key update with an invalid setup token");
        return Err(AppError::Unauthorized);
    }

    let Json(request) = payload?;
    state.llm_key.set(&request.key)?;
    info!("LLM API key replaced at runtime");
    Ok(done())
}
