use rusqlite::types::ValueRef;
use serde::Serialize;
use serde_json::{Map, Value};

use super::Store;
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

impl Store {
    /// User tables, ordered by name.
    pub fn table_names(&self) -> AppResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt.query_map([], |row| row.get(0))?;
        Ok(names.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn columns(&self, table: &str) -> AppResult<Vec<ColumnInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        // table_info: cid, name, type, notnull, dflt_value, pk
        let columns = stmt.query_map([], |row| {
            let not_null: bool = row.get(3)?;
            let primary_key: i64 = row.get(5)?;
            Ok(ColumnInfo {
                name: row.get(1)?,
                data_type: row.get(2)?,
                nullable: !not_null && primary_key == 0,
            })
        })?;
        Ok(columns.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Up to `limit` rows of `table` as JSON objects keyed by column name.
    pub fn sample_rows(&self, table: &str, limit: usize) -> AppResult<Vec<Map<String, Value>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT ?1", quote_ident(table)))?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let mut rows = stmt.query([limit as i64])?;
        let mut samples = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (idx, name) in names.iter().enumerate() {
                object.insert(name.clone(), to_json(row.get_ref(idx)?));
            }
            samples.push(object);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_entity_tables() {
        let store = Store::open_in_memory().unwrap();
        let names = store.table_names().unwrap();
        assert_eq!(
            names,
            vec![
                "Classificacao",
                "MovimentoContas",
                "MovimentoContas_has_Classificacao",
                "ParcelasContas",
                "Pessoas",
            ]
        );
    }

    #[test]
    fn test_columns_and_samples() {
        let store = Store::open_in_memory().unwrap();
        let columns = store.columns("Classificacao").unwrap();
        let descricao = columns.iter().find(|c| c.name == "descricao").unwrap();
        assert_eq!(descricao.data_type, "TEXT");
        assert!(!descricao.nullable);
        assert!(!columns[0].nullable);

        assert!(store.sample_rows("Classificacao", 3).unwrap().is_empty());
        store
            .conn()
            .execute_batch(
                "INSERT INTO Classificacao (tipo, descricao) VALUES
                 ('DESPESA', 'A'), ('DESPESA', 'B'), ('DESPESA', 'C'), ('RECEITA', 'D');",
            )
            .unwrap();
        let samples = store.sample_rows("Classificacao", 3).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0]["tipo"], "DESPESA");
        assert!(samples[0]["idClassificacao"].is_i64());
    }

    #[test]
    fn test_unknown_table_has_no_columns() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.columns("Nope\"; DROP TABLE Pessoas; --").unwrap().is_empty());
        assert_eq!(store.table_names().unwrap().len(), 5);
    }
}
