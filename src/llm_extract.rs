// src/llm_extract.rs

use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::invoice::{EXPENSE_CATEGORIES, InvoiceData};
use crate::llm_client::ChatModel;

/// Invoice text beyond this many characters is cut before prompting.
const MAX_TEXT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are an invoice data extraction assistant for Brazilian \
fiscal documents (notas fiscais). Return ONLY valid JSON.";

const OUTPUT_TEMPLATE: &str = r#"{
  "fornecedor": {
    "razaoSocial": "",
    "fantasia": "",
    "cnpj": ""
  },
  "faturado": {
    "nomeCompleto": "",
    "cpf": ""
  },
  "notaFiscal": {
    "numero": "",
    "dataEmissao": "",
    "descricaoProdutos": "",
    "parcelas": [
      {
        "numero": 1,
        "dataVencimento": "",
        "valor": 0
      }
    ],
    "valorTotal": 0,
    "classificacoesDespesa": [
      {
        "codigo": "",
        "descricao": ""
      }
    ]
  }
}"#;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").expect("valid regex"));

/// Build the extraction prompt: field list, taxonomy, template, and the text.
pub fn build_prompt(invoice_text: &str) -> String {
    let mut prompt = String::from(
        "Extract the following information from this invoice and return it as JSON.\n\n\
         Supplier (fornecedor): legal name (razaoSocial), trade name (fantasia), CNPJ.\n\
         Billed party (faturado): full name (nomeCompleto), CPF.\n\
         Invoice (notaFiscal): number, issue date (YYYY-MM-DD), product description, \
         installments with due date (YYYY-MM-DD) and amount, total amount (number).\n\n\
         Expense classification:\n\
         - Analyse the products/services on the invoice and classify the expense by the nature of the spend.\n\
         - Every invoice must have at least one expense classification.\n\
         - Main expense categories:\n",
    );
    for category in &EXPENSE_CATEGORIES {
        let _ = writeln!(
            prompt,
            "  * Code: \"{}\", Description: \"{}\" ({})",
            category.code, category.description, category.examples
        );
    }
    prompt.push_str(
        "- Examples:\n\
         \x20 * Purchase of diesel oil -> \"MANUTENÇÃO E OPERAÇÃO\" (code \"2\")\n\
         \x20 * Purchase of hydraulic material -> \"INFRAESTRUTURA E UTILIDADES\" (code \"5\")\n\
         - Base the classification on the product/service description.\n\
         - If it cannot be determined precisely, use \"10 - OUTROS\".\n\
         - Use the category description verbatim in \"descricao\".\n\n",
    );
    let _ = write!(
        prompt,
        "Invoice text:\n{}\n\nReturn only JSON with this structure:\n{OUTPUT_TEMPLATE}\n\n\
         Important: fill every field you can. When a piece of information is not available, \
         leave the field empty or at its default value.",
        truncate_chars(invoice_text, MAX_TEXT_CHARS)
    );
    prompt
}

/// Cut `s` to at most `max` characters without splitting a code point.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Send invoice text to the model and parse its reply into `InvoiceData`.
pub async fn extract_invoice(chat: &dyn ChatModel, invoice_text: &str) -> AppResult<InvoiceData> {
    let prompt = build_prompt(invoice_text);
    let reply = chat.complete(Some(SYSTEM_PROMPT), &prompt).await?;
    let invoice = parse_invoice_response(&reply)?;

    let (filled, total) = invoice.coverage();
    info!(
        filled,
        total,
        numero = %invoice.nota_fiscal.numero,
        fornecedor = %invoice.fornecedor.razao_social,
        valor_total = invoice.nota_fiscal.valor_total,
        parcelas = invoice.nota_fiscal.parcelas.len(),
        classificacoes = invoice.nota_fiscal.classificacoes_despesa.len(),
        "LLM extraction result"
    );
    Ok(invoice)
}

/// Locate the JSON payload in a model reply: a ```json fence first, then
/// the outermost bare object. On a parse failure, strip every fence from
/// the whole reply and try once more.
pub fn parse_invoice_response(reply: &str) -> AppResult<InvoiceData> {
    let candidate = FENCED_JSON
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| extract_json_object(reply))
        .ok_or_else(|| AppError::Extraction("could not find JSON in the model response".into()))?;

    match serde_json::from_str::<InvoiceData>(candidate) {
        Ok(invoice) => Ok(invoice),
        Err(first) => {
            warn!(error = %first, "Failed to parse model JSON, retrying after cleanup");
            let cleaned = reply.replace("```json", "").replace("```", "");
            serde_json::from_str(cleaned.trim())
                .map_err(|e| AppError::Extraction(format!("invalid JSON in model response: {e}")))
        }
    }
}

/// Outermost `{ ... }` span of a string that may carry surrounding prose
/// (e.g. reasoning tokens).
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::fakes::ScriptedChat;

    const REPLY_BODY: &str = r#"{
        "fornecedor": {"razaoSocial": "POSTO BOA VISTA LTDA", "fantasia": "POSTO BV", "cnpj": "12.345.678/0001-90"},
        "faturado": {"nomeCompleto": "JOÃO DA SILVA", "cpf": "123.456.789-00"},
        "notaFiscal": {
            "numero": "000123",
            "dataEmissao": "2025-02-01",
            "descricaoProdutos": "ÓLEO DIESEL S10",
            "parcelas": [{"numero": 1, "dataVencimento": "2025-03-01", "valor": 500.0}],
            "valorTotal": 500.0,
            "classificacoesDespesa": [{"codigo": "2", "descricao": "MANUTENÇÃO E OPERAÇÃO"}]
        }
    }"#;

    #[test]
    fn test_fenced_reply() {
        let reply = format!("Here you go:\n```json\n{REPLY_BODY}\n```\nAnything else?");
        let invoice = parse_invoice_response(&reply).unwrap();
        assert_eq!(invoice.fornecedor.cnpj, "12.345.678/0001-90");
        assert_eq!(invoice.nota_fiscal.parcelas.len(), 1);
    }

    #[test]
    fn test_bare_reply_with_prose() {
        let reply = format!("<think>the supplier is a gas station</think>\n{REPLY_BODY}");
        let invoice = parse_invoice_response(&reply).unwrap();
        assert_eq!(invoice.faturado.nome_completo, "JOÃO DA SILVA");
        assert_eq!(invoice.nota_fiscal.classificacoes_despesa[0].codigo, "2");
    }

    #[test]
    fn test_unterminated_fence_falls_back_to_bare_object() {
        let reply = "```json\n{\"notaFiscal\": {\"numero\": \"9\"}}";
        let invoice = parse_invoice_response(reply).unwrap();
        assert_eq!(invoice.nota_fiscal.numero, "9");
    }

    #[test]
    fn test_cleanup_pass_after_bad_fence_capture() {
        // Closing brace landed after the fence: the fenced capture is
        // incomplete, the fence-stripped reply is valid.
        let reply = "```json\n{\"notaFiscal\": {\"numero\": \"9\"}\n```}";
        let invoice = parse_invoice_response(reply).unwrap();
        assert_eq!(invoice.nota_fiscal.numero, "9");
    }

    #[test]
    fn test_no_json_is_extraction_error() {
        let err = parse_invoice_response("I could not read this invoice.").unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[test]
    fn test_broken_json_is_extraction_error() {
        let err = parse_invoice_response("{\"fornecedor\": {\"cnpj\": }").unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[test]
    fn test_prompt_embeds_taxonomy_and_text() {
        let prompt = build_prompt("NOTA FISCAL 123");
        for category in &EXPENSE_CATEGORIES {
            assert!(prompt.contains(category.description));
        }
        assert!(prompt.contains("NOTA FISCAL 123"));
        assert!(prompt.contains("\"classificacoesDespesa\""));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ação", 2), "aç");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_extract_invoice_with_scripted_model() {
        let chat = ScriptedChat::new(&[REPLY_BODY]);
        let invoice = extract_invoice(&chat, "texto da nota").await.unwrap();
        assert_eq!(invoice.nota_fiscal.numero, "000123");
        assert!(chat.last_prompt().unwrap().contains("texto da nota"));
    }

    #[tokio::test]
    async fn test_sections_present_even_when_model_omits_them() {
        let chat = ScriptedChat::new(&["{\"notaFiscal\": {}}"]);
        let invoice = extract_invoice(&chat, "x").await.unwrap();
        let json = serde_json::to_value(&invoice).unwrap();
        assert!(!json["fornecedor"].is_null());
        assert!(!json["faturado"].is_null());
        assert!(!json["notaFiscal"].is_null());
    }
}
