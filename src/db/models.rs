use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Declares a string-backed enum stored as TEXT and sent over the wire with
/// the same spelling.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Lifecycle state shared by every entity. Soft delete is `Inactive`.
    Status {
        Active => "ATIVO",
        Inactive => "INATIVO",
        Pending => "PENDENTE",
    }
}

text_enum! {
    PartyKind {
        Supplier => "CLIENTE-FORNECEDOR",
        Billed => "FATURADO",
    }
}

text_enum! {
    ClassificationKind {
        Expense => "DESPESA",
        Revenue => "RECEITA",
    }
}

text_enum! {
    MovementKind {
        Payable => "APAGAR",
        Receivable => "ARECEBER",
    }
}

/// A supplier or billed customer (`Pessoas`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Party {
    #[serde(rename = "idPessoas")]
    pub id: i64,
    pub tipo: PartyKind,
    pub razaosocial: String,
    pub fantasia: Option<String>,
    pub documento: String,
    pub status: Status,
}

/// An expense or revenue category (`Classificacao`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    #[serde(rename = "idClassificacao")]
    pub id: i64,
    pub tipo: ClassificationKind,
    pub descricao: String,
    pub status: Status,
}

/// Accounts payable/receivable header (`MovimentoContas`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movement {
    #[serde(rename = "idMovimentoContas")]
    pub id: i64,
    pub tipo: MovementKind,
    pub numeronotafiscal: Option<String>,
    pub dataemissao: Option<String>,
    pub descricao: Option<String>,
    pub status: Status,
    pub valortotal: f64,
    #[serde(rename = "Pessoas_idfornecedorCliente")]
    pub supplier_id: Option<i64>,
    #[serde(rename = "Pessoas_idFaturado")]
    pub billed_id: Option<i64>,
}

/// One payment tranche of a movement (`ParcelasContas`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallmentRow {
    #[serde(rename = "idParcelasContas")]
    pub id: i64,
    #[serde(rename = "Identificacao")]
    pub label: String,
    pub datavencimento: Option<String>,
    pub valorparcela: f64,
    pub valorpago: f64,
    pub valorsaldo: f64,
    pub statusparcela: Status,
    #[serde(rename = "MovimentoContas_idMovimentoContas")]
    pub movement_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewParty {
    pub tipo: PartyKind,
    #[serde(default)]
    pub razaosocial: String,
    #[serde(default)]
    pub fantasia: Option<String>,
    #[serde(default)]
    pub documento: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartyUpdate {
    #[serde(default)]
    pub razaosocial: String,
    #[serde(default)]
    pub fantasia: Option<String>,
    #[serde(default)]
    pub documento: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClassification {
    pub tipo: ClassificationKind,
    #[serde(default)]
    pub descricao: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationUpdate {
    #[serde(default)]
    pub descricao: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MovementUpdate {
    pub tipo: MovementKind,
    #[serde(default)]
    pub numeronotafiscal: Option<String>,
    #[serde(default)]
    pub dataemissao: Option<String>,
    #[serde(default)]
    pub descricao: Option<String>,
    #[serde(default, deserialize_with = "crate::invoice::lenient_amount")]
    pub valortotal: f64,
}

/// Outcome of a natural-key lookup: `{exists: false}` or
/// `{exists: true, id, record}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution<T> {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<T>,
}

impl<T> Resolution<T> {
    pub fn missing() -> Self {
        Self {
            exists: false,
            id: None,
            record: None,
        }
    }

    pub fn found(id: i64, record: T) -> Self {
        Self {
            exists: true,
            id: Some(id),
            record: Some(record),
        }
    }
}

impl From<Option<Party>> for Resolution<Party> {
    fn from(party: Option<Party>) -> Self {
        party.map_or_else(Self::missing, |p| Self::found(p.id, p))
    }
}

impl From<Option<Classification>> for Resolution<Classification> {
    fn from(c: Option<Classification>) -> Self {
        c.map_or_else(Self::missing, |c| Self::found(c.id, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_spelling() {
        assert_eq!(serde_json::to_string(&Status::Inactive).unwrap(), "\"INATIVO\"");
        assert_eq!(
            serde_json::from_str::<PartyKind>("\"CLIENTE-FORNECEDOR\"").unwrap(),
            PartyKind::Supplier
        );
        assert_eq!("DESPESA".parse::<ClassificationKind>().unwrap(), ClassificationKind::Expense);
        assert!("despesa".parse::<ClassificationKind>().is_err());
    }

    #[test]
    fn test_resolution_shape() {
        let missing = serde_json::to_value(Resolution::<Party>::missing()).unwrap();
        assert_eq!(missing, serde_json::json!({"exists": false}));

        let c = Classification {
            id: 7,
            tipo: ClassificationKind::Expense,
            descricao: "OUTROS".into(),
            status: Status::Active,
        };
        let found = serde_json::to_value(Resolution::from(Some(c))).unwrap();
        assert_eq!(found["exists"], true);
        assert_eq!(found["id"], 7);
        assert_eq!(found["record"]["idClassificacao"], 7);
        assert_eq!(found["record"]["tipo"], "DESPESA");
    }

    #[test]
    fn test_enum_sql_roundtrip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let back: MovementKind = conn
            .query_row("SELECT ?1", [MovementKind::Receivable], |row| row.get(0))
            .unwrap();
        assert_eq!(back, MovementKind::Receivable);
        let bad: rusqlite::Result<Status> = conn.query_row("SELECT 'ARCHIVED'", [], |row| row.get(0));
        assert!(bad.is_err());
    }
}
