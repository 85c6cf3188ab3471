// src/ledger.rs
//
// Turns an extracted invoice into accounts-payable records.

use rusqlite::{Transaction, params};
use serde::Serialize;
use tracing::{info, info_span};

use crate::db::{
    Classification, ClassificationKind, Party, PartyKind, Resolution, Store,
    upsert_classification, upsert_party,
};
use crate::error::AppResult;
use crate::invoice::{ExpenseClassification, InvoiceData};

/// What already exists in the database for the parties and
/// classifications named on an invoice.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceAnalysis {
    pub fornecedor: Option<Resolution<Party>>,
    pub faturado: Option<Resolution<Party>>,
    pub classificacoes: Vec<ClassificationMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationMatch {
    pub classificacao: ExpenseClassification,
    pub resultado: Resolution<Classification>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedInvoice {
    pub movimento_id: i64,
    pub fornecedor_id: Option<i64>,
    pub faturado_id: Option<i64>,
    pub classificacoes_ids: Vec<i64>,
    pub parcelas_ids: Vec<i64>,
}

fn non_blank(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Look up the supplier (by CNPJ), the billed party (by CPF) and each
/// expense classification (by description). Sections without a key are
/// `None`; classifications with neither a description nor a known code
/// are skipped.
pub fn analyze_invoice(store: &Store, invoice: &InvoiceData) -> AppResult<InvoiceAnalysis> {
    let fornecedor = non_blank(&invoice.fornecedor.cnpj)
        .map(|cnpj| store.resolve_supplier(cnpj))
        .transpose()?;
    let faturado = non_blank(&invoice.faturado.cpf)
        .map(|cpf| store.resolve_billed(cpf))
        .transpose()?;

    let mut classificacoes = Vec::new();
    for classificacao in &invoice.nota_fiscal.classificacoes_despesa {
        let Some(descricao) = classificacao.resolved_description() else {
            continue;
        };
        classificacoes.push(ClassificationMatch {
            classificacao: classificacao.clone(),
            resultado: store.resolve_expense_classification(descricao)?,
        });
    }

    info!(
        supplier_known = fornecedor.as_ref().is_some_and(|r| r.exists),
        billed_known = faturado.as_ref().is_some_and(|r| r.exists),
        classifications = classificacoes.len(),
        "Invoice analysed against database"
    );
    Ok(InvoiceAnalysis {
        fornecedor,
        faturado,
        classificacoes,
    })
}

/// Persist an invoice as a payable movement with its installments and
/// classification links. Parties and classifications are reused when
/// their natural key already exists. Everything runs in one transaction.
pub fn save_invoice(store: &Store, invoice: &InvoiceData) -> AppResult<SavedInvoice> {
    let span = info_span!("save_invoice", numero = %invoice.nota_fiscal.numero);
    let _enter = span.enter();

    let saved = store.with_transaction(|tx| save_in(tx, invoice))?;
    info!(
        movimento_id = saved.movimento_id,
        parcelas = saved.parcelas_ids.len(),
        classificacoes = saved.classificacoes_ids.len(),
        "Invoice saved"
    );
    Ok(saved)
}

fn save_in(tx: &Transaction<'_>, invoice: &InvoiceData) -> AppResult<SavedInvoice> {
    let supplier = &invoice.fornecedor;
    let fornecedor_id = match non_blank(&supplier.cnpj) {
        Some(cnpj) => {
            let razao = supplier.razao_social.trim();
            let fantasia = non_blank(&supplier.fantasia).unwrap_or(razao);
            Some(upsert_party(tx, PartyKind::Supplier, razao, Some(fantasia), cnpj)?)
        }
        None => None,
    };

    let billed = &invoice.faturado;
    let faturado_id = match non_blank(&billed.cpf) {
        Some(cpf) => Some(upsert_party(
            tx,
            PartyKind::Billed,
            billed.nome_completo.trim(),
            None,
            cpf,
        )?),
        None => None,
    };

    let mut classificacoes_ids = Vec::new();
    for classificacao in &invoice.nota_fiscal.classificacoes_despesa {
        let Some(descricao) = classificacao.resolved_description() else {
            continue;
        };
        let id = upsert_classification(tx, ClassificationKind::Expense, descricao)?;
        if !classificacoes_ids.contains(&id) {
            classificacoes_ids.push(id);
        }
    }

    let nota = &invoice.nota_fiscal;
    tx.execute(
        "INSERT INTO MovimentoContas
            (tipo, numeronotafiscal, dataemissao, descricao, status, valortotal,
             Pessoas_idfornecedorCliente, Pessoas_idFaturado)
         VALUES ('APAGAR', ?1, ?2, ?3, 'PENDENTE', ?4, ?5, ?6)",
        params![
            non_blank(&nota.numero),
            non_blank(&nota.data_emissao),
            non_blank(&nota.descricao_produtos),
            nota.valor_total,
            fornecedor_id,
            faturado_id,
        ],
    )?;
    let movimento_id = tx.last_insert_rowid();

    let mut parcelas_ids = Vec::with_capacity(nota.parcelas.len());
    for parcela in &nota.parcelas {
        tx.execute(
            "INSERT INTO ParcelasContas
                (Identificacao, datavencimento, valorparcela, valorpago, valorsaldo,
                 statusparcela, MovimentoContas_idMovimentoContas)
             VALUES (?1, ?2, ?3, 0, ?3, 'PENDENTE', ?4)",
            params![
                format!("Parcela {}", parcela.numero),
                non_blank(&parcela.data_vencimento),
                parcela.valor,
                movimento_id,
            ],
        )?;
        parcelas_ids.push(tx.last_insert_rowid());
    }

    for classificacao_id in &classificacoes_ids {
        tx.execute(
            "INSERT INTO MovimentoContas_has_Classificacao
                (MovimentoContas_idMovimentoContas, Classificacao_idClassificacao)
             VALUES (?1, ?2)",
            params![movimento_id, classificacao_id],
        )?;
    }

    Ok(SavedInvoice {
        movimento_id,
        fornecedor_id,
        faturado_id,
        classificacoes_ids,
        parcelas_ids,
    })
}
