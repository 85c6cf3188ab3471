use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::Store;
use super::models::{Classification, ClassificationKind, Party, PartyKind, Resolution};
use crate::error::AppResult;

pub(crate) const PARTY_COLUMNS: &str = "idPessoas, tipo, razaosocial, fantasia, documento, status";
pub(crate) const CLASSIFICATION_COLUMNS: &str = "idClassificacao, tipo, descricao, status";

/// Map a row with the `PARTY_COLUMNS` projection.
pub(crate) fn row_to_party(row: &Row<'_>) -> rusqlite::Result<Party> {
    Ok(Party {
        id: row.get(0)?,
        tipo: row.get(1)?,
        razaosocial: row.get(2)?,
        fantasia: row.get(3)?,
        documento: row.get(4)?,
        status: row.get(5)?,
    })
}

/// Map a row with the `CLASSIFICATION_COLUMNS` projection.
pub(crate) fn row_to_classification(row: &Row<'_>) -> rusqlite::Result<Classification> {
    Ok(Classification {
        id: row.get(0)?,
        tipo: row.get(1)?,
        descricao: row.get(2)?,
        status: row.get(3)?,
    })
}

/// Exact lookup of a party by document number within one kind.
pub fn find_party(conn: &Connection, kind: PartyKind, documento: &str) -> AppResult<Option<Party>> {
    let party = conn
        .query_row(
            &format!("SELECT {PARTY_COLUMNS} FROM Pessoas WHERE documento = ?1 AND tipo = ?2"),
            params![documento, kind],
            row_to_party,
        )
        .optional()?;
    Ok(party)
}

/// Exact lookup of a classification by description within one kind.
pub fn find_classification(
    conn: &Connection,
    kind: ClassificationKind,
    descricao: &str,
) -> AppResult<Option<Classification>> {
    let classification = conn
        .query_row(
            &format!(
                "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao WHERE descricao = ?1 AND tipo = ?2"
            ),
            params![descricao, kind],
            row_to_classification,
        )
        .optional()?;
    Ok(classification)
}

/// Id of the party with this natural key, inserting it as `ATIVO` when absent.
/// An existing row is returned untouched.
pub fn upsert_party(
    conn: &Connection,
    kind: PartyKind,
    razaosocial: &str,
    fantasia: Option<&str>,
    documento: &str,
) -> AppResult<i64> {
    // The no-op update makes RETURNING yield the existing id on conflict.
    let id: i64 = conn.query_row(
        "INSERT INTO Pessoas (tipo, razaosocial, fantasia, documento, status)
         VALUES (?1, ?2, ?3, ?4, 'ATIVO')
         ON CONFLICT(documento, tipo) DO UPDATE SET documento = excluded.documento
         RETURNING idPessoas",
        params![kind, razaosocial, fantasia, documento],
        |row| row.get(0),
    )?;
    debug!(id, tipo = %kind, "Party upserted");
    Ok(id)
}

/// Id of the classification with this natural key, inserting it when absent.
pub fn upsert_classification(
    conn: &Connection,
    kind: ClassificationKind,
    descricao: &str,
) -> AppResult<i64> {
    let id: i64 = conn.query_row(
        "INSERT INTO Classificacao (tipo, descricao, status)
         VALUES (?1, ?2, 'ATIVO')
         ON CONFLICT(descricao, tipo) DO UPDATE SET descricao = excluded.descricao
         RETURNING idClassificacao",
        params![kind, descricao],
        |row| row.get(0),
    )?;
    debug!(id, tipo = %kind, "Classification upserted");
    Ok(id)
}

impl Store {
    pub fn resolve_supplier(&self, cnpj: &str) -> AppResult<Resolution<Party>> {
        Ok(find_party(&self.conn(), PartyKind::Supplier, cnpj)?.into())
    }

    pub fn resolve_billed(&self, cpf: &str) -> AppResult<Resolution<Party>> {
        Ok(find_party(&self.conn(), PartyKind::Billed, cpf)?.into())
    }

    pub fn resolve_expense_classification(
        &self,
        descricao: &str,
    ) -> AppResult<Resolution<Classification>> {
        Ok(find_classification(&self.conn(), ClassificationKind::Expense, descricao)?.into())
    }
}
