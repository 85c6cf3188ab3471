//! JSON HTTP surface.

mod handlers;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post, put};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Store;
use crate::error::AppResult;
use crate::llm_client::{ChatModel, EmbeddingModel};
use crate::llm_key::LlmKey;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub chat: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub llm_key: Arc<LlmKey>,
    pub config: Arc<Config>,
}

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match frontend_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid FRONTEND_URL, allowing any origin");
            cors.allow_origin(Any)
        }
        None => cors.allow_origin(Any),
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes + MULTIPART_OVERHEAD;
    let cors = cors_layer(state.config.server.frontend_url.as_deref());

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/process-pdf", post(handlers::process_pdf))
        .route("/api/salvar-dados", post(handlers::save_invoice))
        .route("/api/rag/index", post(handlers::rag_index))
        .route("/api/rag/query", post(handlers::rag_query))
        .route(
            "/api/pessoas",
            get(handlers::list_parties).post(handlers::create_party),
        )
        .route(
            "/api/pessoas/{id}",
            put(handlers::update_party).delete(handlers::delete_party),
        )
        .route(
            "/api/classificacao",
            get(handlers::list_classifications).post(handlers::create_classification),
        )
        .route(
            "/api/classificacao/{id}",
            put(handlers::update_classification).delete(handlers::delete_classification),
        )
        .route("/api/contas", get(handlers::list_movements))
        .route(
            "/api/contas/{id}",
            put(handlers::update_movement).delete(handlers::delete_movement),
        )
        .route("/api/contas/{id}/parcelas", get(handlers::list_installments))
        .route("/api/admin/llm-key", post(handlers::set_llm_key))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `0.0.0.0:<port>` and serve until the process is stopped.
pub async fn serve(state: AppState) -> AppResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");
    info!("Health check available at http://{addr}/api/health");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::fakes::{KeywordEmbedder, ScriptedChat};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct Harness {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn harness(replies: &[&str], admin_token: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.rag.index_path = dir.path().join("rag_index.json");
        config.admin_setup_token = admin_token.map(str::to_string);
        let state = AppState {
            store: Arc::new(Store::open_in_memory().unwrap()),
            chat: Arc::new(ScriptedChat::new(replies)),
            embedder: Arc::new(KeywordEmbedder {
                keywords: vec!["pessoas", "parcelas", "classificacao"],
            }),
            llm_key: Arc::new(LlmKey::new(None)),
            config: Arc::new(config),
        };
        Harness { state, _dir: dir }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(&[], None);
        let (status, body) = send(&h.state, get_request("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_classification_create_then_search() {
        let h = harness(&[], None);
        let (status, body) = send(
            &h.state,
            json_request(
                "POST",
                "/api/classificacao",
                json!({"tipo": "DESPESA", "descricao": "Combustível"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let id = body["id"].as_i64().unwrap();

        let (status, body) =
            send(&h.state, get_request("/api/classificacao?tipo=DESPESA&q=Combust")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["idClassificacao"], id);
        assert_eq!(body["data"][0]["descricao"], "Combustível");
    }

    #[tokio::test]
    async fn test_party_lifecycle() {
        let h = harness(&[], None);
        let (_, body) = send(
            &h.state,
            json_request(
                "POST",
                "/api/pessoas",
                json!({"tipo": "FATURADO", "razaosocial": "ANA SOUZA", "documento": "111"}),
            ),
        )
        .await;
        let id = body["id"].as_i64().unwrap();

        let (status, _) = send(
            &h.state,
            json_request(
                "PUT",
                &format!("/api/pessoas/{id}"),
                json!({"razaosocial": "ANA S. SOUZA", "documento": "111"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/pessoas/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.state, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = send(&h.state, get_request("/api/pessoas?tipo=FATURADO")).await;
        assert!(body["data"].as_array().unwrap().is_empty());
        let (_, body) = send(&h.state, get_request("/api/pessoas?status=INATIVO")).await;
        assert_eq!(body["data"][0]["razaosocial"], "ANA S. SOUZA");
    }

    #[tokio::test]
    async fn test_unknown_id_and_bad_input() {
        let h = harness(&[], None);
        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/contas/999")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.state, delete).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, body) = send(&h.state, get_request("/api/pessoas?status=ARCHIVED")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&h.state, get_request("/api/contas/abc/parcelas")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_save_requires_invoice_data() {
        let h = harness(&[], None);
        let (status, body) = send(&h.state, json_request("POST", "/api/salvar-dados", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invoiceData"));
    }

    #[tokio::test]
    async fn test_save_then_list_installments() {
        let h = harness(&[], None);
        let invoice = json!({
            "fornecedor": {"razaoSocial": "AGRO LTDA", "cnpj": "11"},
            "faturado": {"nomeCompleto": "ANA", "cpf": "22"},
            "notaFiscal": {
                "numero": "1",
                "valorTotal": 300,
                "parcelas": [
                    {"numero": 1, "dataVencimento": "2025-01-10", "valor": 100},
                    {"numero": 2, "dataVencimento": "2025-02-10", "valor": 100},
                    {"numero": 3, "dataVencimento": "2025-03-10", "valor": 100}
                ],
                "classificacoesDespesa": [{"codigo": "2", "descricao": "MANUTENÇÃO E OPERAÇÃO"}]
            }
        });
        let (status, body) = send(
            &h.state,
            json_request("POST", "/api/salvar-dados", json!({ "invoiceData": invoice })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let movimento = body["dados"]["movimentoId"].as_i64().unwrap();
        assert_eq!(body["dados"]["classificacoesIds"].as_array().unwrap().len(), 1);

        let (status, body) =
            send(&h.state, get_request(&format!("/api/contas/{movimento}/parcelas"))).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r["valorpago"] == 0.0 && r["valorsaldo"] == 100.0));
    }

    #[tokio::test]
    async fn test_embeddings_query_before_index_build() {
        let h = harness(&[], None);
        let (status, body) = send(
            &h.state,
            json_request(
                "POST",
                "/api/rag/query",
                json!({"question": "Quais tabelas existem?", "mode": "embeddings"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("/api/rag/index"));
    }

    #[tokio::test]
    async fn test_index_then_query() {
        let h = harness(&["Pessoas holds the parties."], None);
        let (status, body) = send(&h.state, json_request("POST", "/api/rag/index", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 5);
        assert!(body["docsProcessed"].as_array().unwrap().contains(&json!("Pessoas")));

        let (status, body) = send(
            &h.state,
            json_request(
                "POST",
                "/api/rag/query",
                json!({"question": "pessoas", "mode": "embeddings"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "embeddings");
        assert_eq!(body["answer"], "Pessoas holds the parties.");
    }

    #[tokio::test]
    async fn test_process_pdf_without_file() {
        let h = harness(&[], None);
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--{boundary}--\r\n"
        );
        let req = Request::builder()
            .method("POST")
            .uri("/api/process-pdf")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(&h.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No PDF file uploaded");

        let (status, _) = send(&h.state, json_request("POST", "/api/process-pdf", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_process_pdf_rejects_other_content_types() {
        let h = harness(&[], None);
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"pdfFile\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        let req = Request::builder()
            .method("POST")
            .uri("/api/process-pdf")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(&h.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Only PDF files are allowed");
    }

    fn pdf_upload(pdf: &[u8]) -> Request<Body> {
        let boundary = "XBOUNDARY";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"pdfFile\"; filename=\"nf.pdf\"\r\n\
             Content-Type: application/pdf\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(pdf);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/process-pdf")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_pdf_extracts_and_analyses() {
        let reply = r#"```json
{"fornecedor": {"razaoSocial": "POSTO BOA VISTA LTDA", "cnpj": "12.345.678/0001-90"},
 "faturado": {"nomeCompleto": "JOAO DA SILVA", "cpf": ""},
 "notaFiscal": {"numero": "000123", "valorTotal": "R$ 1.500",
                "parcelas": [{"numero": "1/1", "dataVencimento": "2025-03-01", "valor": "1.500,00"}],
                "classificacoesDespesa": [{"codigo": "2", "descricao": ""}]}}
```"#;
        let mut h = harness(&[], None);
        let chat = Arc::new(ScriptedChat::new(&[reply, reply]));
        h.state.chat = chat.clone();
        let pdf = crate::pdf_extract::fixtures::text_pdf(&[
            "NOTA FISCAL ELETRONICA 000123",
            "POSTO BOA VISTA LTDA CNPJ 12.345.678/0001-90",
            "VALOR TOTAL R$ 1.500,00",
        ]);

        let (status, body) = send(&h.state, pdf_upload(&pdf)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(chat.last_prompt().unwrap().contains("POSTO BOA VISTA LTDA"));
        assert_eq!(body["fornecedor"]["razaoSocial"], "POSTO BOA VISTA LTDA");
        assert!(body["faturado"].is_object());
        assert_eq!(body["notaFiscal"]["valorTotal"], 1500.0);
        assert_eq!(body["notaFiscal"]["parcelas"][0]["numero"], 1);
        assert_eq!(body["analise"]["fornecedor"]["exists"], false);
        assert!(body["analise"]["faturado"].is_null());
        assert_eq!(
            body["analise"]["classificacoes"][0]["resultado"]["exists"],
            false
        );

        send(
            &h.state,
            json_request(
                "POST",
                "/api/pessoas",
                json!({
                    "tipo": "CLIENTE-FORNECEDOR",
                    "razaosocial": "POSTO BOA VISTA LTDA",
                    "documento": "12.345.678/0001-90"
                }),
            ),
        )
        .await;
        let (status, body) = send(&h.state, pdf_upload(&pdf)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["analise"]["fornecedor"]["exists"], true);
        assert!(body["analise"]["fornecedor"]["id"].is_i64());
    }

    #[tokio::test]
    async fn test_process_pdf_rejects_unreadable_pdf() {
        let h = harness(&[], None);
        let (status, body) = send(&h.state, pdf_upload(b"not a pdf at all")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("failed to parse PDF"));

        let image = crate::pdf_extract::fixtures::image_pdf();
        let (status, body) = send(&h.state, pdf_upload(&image)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("scanned"));
    }

    #[tokio::test]
    async fn test_admin_key_endpoint() {
        let disabled = harness(&[], None);
        let (status, _) = send(
            &disabled.state,
            json_request("POST", "/api/admin/llm-key", json!({"key": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let h = harness(&[], Some("s3cret"));
        let (status, _) = send(
            &h.state,
            json_request("POST", "/api/admin/llm-key", json!({"key": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!h.state.llm_key.is_set());

        let mut req = json_request("POST", "/api/admin/llm-key", json!({"key": "abc"}));
        req.headers_mut()
            .insert("x-setup-token", HeaderValue::from_static("s3cret"));
        let (status, body) = send(&h.state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(h.state.llm_key.get().unwrap(), "abc");
    }
}
