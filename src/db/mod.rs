mod crud;
mod introspect;
mod models;
mod resolve;

pub use crud::ListFilter;
pub use models::*;
pub use resolve::{upsert_classification, upsert_party};

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::AppResult;

/// The single SQLite connection shared by every request.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS Pessoas (
        idPessoas INTEGER PRIMARY KEY AUTOINCREMENT,
        tipo TEXT NOT NULL CHECK (tipo IN ('CLIENTE-FORNECEDOR', 'FATURADO')),
        razaosocial TEXT NOT NULL,
        fantasia TEXT,
        documento TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'ATIVO' CHECK (status IN ('ATIVO', 'INATIVO', 'PENDENTE')),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS Classificacao (
        idClassificacao INTEGER PRIMARY KEY AUTOINCREMENT,
        tipo TEXT NOT NULL CHECK (tipo IN ('DESPESA', 'RECEITA')),
        descricao TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'ATIVO' CHECK (status IN ('ATIVO', 'INATIVO', 'PENDENTE')),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS MovimentoContas (
        idMovimentoContas INTEGER PRIMARY KEY AUTOINCREMENT,
        tipo TEXT NOT NULL CHECK (tipo IN ('APAGAR', 'ARECEBER')),
        numeronotafiscal TEXT,
        dataemissao TEXT,
        descricao TEXT,
        status TEXT NOT NULL DEFAULT 'PENDENTE' CHECK (status IN ('ATIVO', 'INATIVO', 'PENDENTE')),
        valortotal REAL NOT NULL DEFAULT 0,
        Pessoas_idfornecedorCliente INTEGER REFERENCES Pessoas(idPessoas),
        Pessoas_idFaturado INTEGER REFERENCES Pessoas(idPessoas),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS ParcelasContas (
        idParcelasContas INTEGER PRIMARY KEY AUTOINCREMENT,
        Identificacao TEXT NOT NULL,
        datavencimento TEXT,
        valorparcela REAL NOT NULL DEFAULT 0,
        valorpago REAL NOT NULL DEFAULT 0,
        valorsaldo REAL NOT NULL DEFAULT 0,
        statusparcela TEXT NOT NULL DEFAULT 'PENDENTE' CHECK (statusparcela IN ('ATIVO', 'INATIVO', 'PENDENTE')),
        MovimentoContas_idMovimentoContas INTEGER NOT NULL
            REFERENCES MovimentoContas(idMovimentoContas)
    );

    CREATE TABLE IF NOT EXISTS MovimentoContas_has_Classificacao (
        MovimentoContas_idMovimentoContas INTEGER NOT NULL
            REFERENCES MovimentoContas(idMovimentoContas),
        Classificacao_idClassificacao INTEGER NOT NULL
            REFERENCES Classificacao(idClassificacao),
        PRIMARY KEY (MovimentoContas_idMovimentoContas, Classificacao_idClassificacao)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS ux_pessoas_documento_tipo
        ON Pessoas(documento, tipo);
    CREATE UNIQUE INDEX IF NOT EXISTS ux_classificacao_descricao_tipo
        ON Classificacao(descricao, tipo);
    CREATE INDEX IF NOT EXISTS idx_pessoas_status ON Pessoas(status);
    CREATE INDEX IF NOT EXISTS idx_classificacao_status ON Classificacao(status);
    CREATE INDEX IF NOT EXISTS idx_movimento_status ON MovimentoContas(status);
    CREATE INDEX IF NOT EXISTS idx_parcelas_movimento
        ON ParcelasContas(MovimentoContas_idMovimentoContas);
";

impl Store {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> AppResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        info!(path = %db_path.display(), "Opened SQLite database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Database initialized successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering it from a poisoned mutex.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> AppResult<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Row counts per entity table, for startup logging.
    pub fn get_counts(&self) -> AppResult<(usize, usize, usize, usize)> {
        let conn = self.conn();
        let count = |table: &str| -> rusqlite::Result<usize> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok((
            count("Pessoas")?,
            count("Classificacao")?,
            count("MovimentoContas")?,
            count("ParcelasContas")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_counts().unwrap(), (0, 0, 0, 0));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: AppResult<()> = store.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO Classificacao (tipo, descricao) VALUES ('DESPESA', 'OUTROS')",
                [],
            )?;
            tx.execute("INSERT INTO Classificacao (tipo, descricao) VALUES ('BOGUS', 'X')", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get_counts().unwrap().1, 0);
    }
}
