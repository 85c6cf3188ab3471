use rusqlite::types::Value;
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;
use tracing::info;

use super::Store;
use super::models::{
    Classification, ClassificationKind, ClassificationUpdate, InstallmentRow, Movement,
    MovementKind, MovementUpdate, NewClassification, NewParty, Party, PartyKind, PartyUpdate,
    Status,
};
use super::resolve::{CLASSIFICATION_COLUMNS, PARTY_COLUMNS, row_to_classification, row_to_party};
use crate::error::{AppError, AppResult, is_unique_violation};

const MOVEMENT_COLUMNS: &str = "idMovimentoContas, tipo, numeronotafiscal, dataemissao, descricao, \
     status, valortotal, Pessoas_idfornecedorCliente, Pessoas_idFaturado";

const INSTALLMENT_COLUMNS: &str = "idParcelasContas, Identificacao, datavencimento, valorparcela, \
     valorpago, valorsaldo, statusparcela, MovimentoContas_idMovimentoContas";

/// Query-string filter shared by every listing.
///
/// With no `status`, no `q` and no `all`, only active rows are returned.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "K: FromStr, K::Err: Display"))]
pub struct ListFilter<K> {
    #[serde(default, deserialize_with = "blank_as_none")]
    pub tipo: Option<K>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub status: Option<Status>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub all: bool,
}

impl<K> Default for ListFilter<K> {
    fn default() -> Self {
        Self {
            tipo: None,
            status: None,
            q: None,
            all: false,
        }
    }
}

impl<K> ListFilter<K> {
    fn search_term(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    /// Status the listing is restricted to, if any.
    pub fn effective_status(&self) -> Option<Status> {
        match self.status {
            Some(status) => Some(status),
            None if self.all || self.search_term().is_some() => None,
            None => Some(Status::Active),
        }
    }
}

/// Select boxes send `tipo=` for "any".
fn blank_as_none<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<String>::deserialize(d)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// `WHERE` clause assembled from optional filters, with positional
/// parameters in clause order.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Conditions {
    fn raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn eq(&mut self, column: &str, value: &str) {
        self.clauses.push(format!("{column} = ?"));
        self.values.push(Value::Text(value.to_string()));
    }

    /// Case-insensitive substring match over any of `columns`.
    fn search(&mut self, columns: &[&str], term: &str) {
        let pattern = format!("%{}%", escape_like(term));
        let ors: Vec<String> = columns
            .iter()
            .map(|c| format!("{c} LIKE ? ESCAPE '\\'"))
            .collect();
        self.clauses.push(format!("({})", ors.join(" OR ")));
        for _ in columns {
            self.values.push(Value::Text(pattern.clone()));
        }
    }

    fn render(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values), map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
}

fn required<'a>(value: &'a str, field: &str) -> AppResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("Field '{field}' is required")));
    }
    Ok(value)
}

fn optional_text(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn conflict_or(err: rusqlite::Error, message: impl FnOnce() -> String) -> AppError {
    if is_unique_violation(&err) {
        AppError::Conflict(message())
    } else {
        AppError::Database(err)
    }
}

fn ensure_affected(affected: usize, what: &str, id: i64) -> AppResult<()> {
    if affected == 0 {
        return Err(AppError::NotFound(format!("{what} {id} not found")));
    }
    Ok(())
}

fn row_to_movement(row: &Row<'_>) -> rusqlite::Result<Movement> {
    Ok(Movement {
        id: row.get(0)?,
        tipo: row.get(1)?,
        numeronotafiscal: row.get(2)?,
        dataemissao: row.get(3)?,
        descricao: row.get(4)?,
        status: row.get(5)?,
        valortotal: row.get(6)?,
        supplier_id: row.get(7)?,
        billed_id: row.get(8)?,
    })
}

fn row_to_installment(row: &Row<'_>) -> rusqlite::Result<InstallmentRow> {
    Ok(InstallmentRow {
        id: row.get(0)?,
        label: row.get(1)?,
        datavencimento: row.get(2)?,
        valorparcela: row.get(3)?,
        valorpago: row.get(4)?,
        valorsaldo: row.get(5)?,
        statusparcela: row.get(6)?,
        movement_id: row.get(7)?,
    })
}

impl Store {
    // -- Pessoas -------------------------------------------------------------

    pub fn list_parties(&self, filter: &ListFilter<PartyKind>) -> AppResult<Vec<Party>> {
        let mut cond = Conditions::default();
        if let Some(kind) = filter.tipo {
            cond.eq("tipo", kind.as_str());
        }
        if let Some(status) = filter.effective_status() {
            cond.eq("status", status.as_str());
        }
        if let Some(term) = filter.search_term() {
            cond.search(&["razaosocial", "fantasia", "documento"], term);
        }
        let sql = format!(
            "SELECT {PARTY_COLUMNS} FROM Pessoas{} ORDER BY razaosocial, idPessoas",
            cond.render()
        );
        query_all(&self.conn(), &sql, cond.values, row_to_party)
    }

    pub fn create_party(&self, input: &NewParty) -> AppResult<i64> {
        let razaosocial = required(&input.razaosocial, "razaosocial")?;
        let documento = required(&input.documento, "documento")?;
        let fantasia = optional_text(input.fantasia.as_deref()).unwrap_or(razaosocial);

        let conn = self.conn();
        conn.execute(
            "INSERT INTO Pessoas (tipo, razaosocial, fantasia, documento, status)
             VALUES (?1, ?2, ?3, ?4, 'ATIVO')",
            params![input.tipo, razaosocial, fantasia, documento],
        )
        .map_err(|e| {
            conflict_or(e, || {
                format!("A {} with document {documento} already exists", input.tipo)
            })
        })?;
        let id = conn.last_insert_rowid();
        info!(id, tipo = %input.tipo, "Party created");
        Ok(id)
    }

    pub fn update_party(&self, id: i64, input: &PartyUpdate) -> AppResult<()> {
        let razaosocial = required(&input.razaosocial, "razaosocial")?;
        let documento = required(&input.documento, "documento")?;
        let fantasia = optional_text(input.fantasia.as_deref()).unwrap_or(razaosocial);

        let affected = self
            .conn()
            .execute(
                "UPDATE Pessoas SET razaosocial = ?1, fantasia = ?2, documento = ?3
                 WHERE idPessoas = ?4",
                params![razaosocial, fantasia, documento, id],
            )
            .map_err(|e| {
                conflict_or(e, || format!("Another party already uses document {documento}"))
            })?;
        ensure_affected(affected, "Party", id)?;
        info!(id, "Party updated");
        Ok(())
    }

    pub fn deactivate_party(&self, id: i64) -> AppResult<()> {
        let affected = self.conn().execute(
            "UPDATE Pessoas SET status = 'INATIVO' WHERE idPessoas = ?1",
            params![id],
        )?;
        ensure_affected(affected, "Party", id)?;
        info!(id, "Party deactivated");
        Ok(())
    }

    // -- Classificacao -------------------------------------------------------

    pub fn list_classifications(
        &self,
        filter: &ListFilter<ClassificationKind>,
    ) -> AppResult<Vec<Classification>> {
        let mut cond = Conditions::default();
        if let Some(kind) = filter.tipo {
            cond.eq("tipo", kind.as_str());
        }
        if let Some(status) = filter.effective_status() {
            cond.eq("status", status.as_str());
        }
        if let Some(term) = filter.search_term() {
            cond.search(&["descricao"], term);
        }
        let sql = format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao{} ORDER BY descricao, idClassificacao",
            cond.render()
        );
        query_all(&self.conn(), &sql, cond.values, row_to_classification)
    }

    pub fn create_classification(&self, input: &NewClassification) -> AppResult<i64> {
        let descricao = required(&input.descricao, "descricao")?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO Classificacao (tipo, descricao, status) VALUES (?1, ?2, 'ATIVO')",
            params![input.tipo, descricao],
        )
        .map_err(|e| {
            conflict_or(e, || {
                format!("Classification '{descricao}' already exists for {}", input.tipo)
            })
        })?;
        let id = conn.last_insert_rowid();
        info!(id, tipo = %input.tipo, "Classification created");
        Ok(id)
    }

    pub fn update_classification(&self, id: i64, input: &ClassificationUpdate) -> AppResult<()> {
        let descricao = required(&input.descricao, "descricao")?;
        let affected = self
            .conn()
            .execute(
                "UPDATE Classificacao SET descricao = ?1 WHERE idClassificacao = ?2",
                params![descricao, id],
            )
            .map_err(|e| conflict_or(e, || format!("Classification '{descricao}' already exists")))?;
        ensure_affected(affected, "Classification", id)?;
        info!(id, "Classification updated");
        Ok(())
    }

    pub fn deactivate_classification(&self, id: i64) -> AppResult<()> {
        let affected = self.conn().execute(
            "UPDATE Classificacao SET status = 'INATIVO' WHERE idClassificacao = ?1",
            params![id],
        )?;
        ensure_affected(affected, "Classification", id)?;
        info!(id, "Classification deactivated");
        Ok(())
    }

    // -- MovimentoContas -----------------------------------------------------

    /// Movements are born `PENDENTE`, so "active" here means not `INATIVO`.
    pub fn list_movements(&self, filter: &ListFilter<MovementKind>) -> AppResult<Vec<Movement>> {
        let mut cond = Conditions::default();
        if let Some(kind) = filter.tipo {
            cond.eq("tipo", kind.as_str());
        }
        match filter.effective_status() {
            Some(Status::Active) => cond.raw("status <> 'INATIVO'"),
            Some(status) => cond.eq("status", status.as_str()),
            None => {}
        }
        if let Some(term) = filter.search_term() {
            cond.search(&["descricao", "numeronotafiscal"], term);
        }
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM MovimentoContas{} ORDER BY idMovimentoContas DESC",
            cond.render()
        );
        query_all(&self.conn(), &sql, cond.values, row_to_movement)
    }

    pub fn update_movement(&self, id: i64, input: &MovementUpdate) -> AppResult<()> {
        let affected = self.conn().execute(
            "UPDATE MovimentoContas
             SET tipo = ?1, numeronotafiscal = ?2, dataemissao = ?3, descricao = ?4, valortotal = ?5
             WHERE idMovimentoContas = ?6",
            params![
                input.tipo,
                optional_text(input.numeronotafiscal.as_deref()),
                optional_text(input.dataemissao.as_deref()),
                optional_text(input.descricao.as_deref()),
                input.valortotal,
                id,
            ],
        )?;
        ensure_affected(affected, "Movement", id)?;
        info!(id, "Movement updated");
        Ok(())
    }

    pub fn deactivate_movement(&self, id: i64) -> AppResult<()> {
        let affected = self.conn().execute(
            "UPDATE MovimentoContas SET status = 'INATIVO' WHERE idMovimentoContas = ?1",
            params![id],
        )?;
        ensure_affected(affected, "Movement", id)?;
        info!(id, "Movement deactivated");
        Ok(())
    }

    pub fn installments_for_movement(&self, movement_id: i64) -> AppResult<Vec<InstallmentRow>> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM MovimentoContas WHERE idMovimentoContas = ?1)",
            params![movement_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(AppError::NotFound(format!("Movement {movement_id} not found")));
        }
        query_all(
            &conn,
            &format!(
                "SELECT {INSTALLMENT_COLUMNS} FROM ParcelasContas
                 WHERE MovimentoContas_idMovimentoContas = ?
                 ORDER BY idParcelasContas"
            ),
            vec![Value::Integer(movement_id)],
            row_to_installment,
        )
    }
}
