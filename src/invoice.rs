// src/invoice.rs

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// One entry of the fixed expense taxonomy the extractor classifies into.
#[derive(Debug, Clone, Copy)]
pub struct ExpenseCategory {
    pub code: &'static str,
    pub description: &'static str,
    pub examples: &'static str,
}

pub const EXPENSE_CATEGORIES: [ExpenseCategory; 10] = [
    ExpenseCategory {
        code: "1",
        description: "INSUMOS AGRÍCOLAS",
        examples: "Sementes, Fertilizantes, Defensivos Agrícolas, Corretivos",
    },
    ExpenseCategory {
        code: "2",
        description: "MANUTENÇÃO E OPERAÇÃO",
        examples: "Combustíveis e Lubrificantes, Peças, Parafusos, Componentes Mecânicos, \
                   Manutenção de Máquinas e Equipamentos, Pneus, Filtros, Correias, \
                   Ferramentas e Utensílios",
    },
    ExpenseCategory {
        code: "3",
        description: "RECURSOS HUMANOS",
        examples: "Mão de Obra Temporária, Salários e Encargos",
    },
    ExpenseCategory {
        code: "4",
        description: "SERVIÇOS OPERACIONAIS",
        examples: "Frete e Transporte, Colheita Terceirizada, Secagem e Armazenagem, \
                   Pulverização e Aplicação",
    },
    ExpenseCategory {
        code: "5",
        description: "INFRAESTRUTURA E UTILIDADES",
        examples: "Energia Elétrica, Arrendamento de Terras, Construções e Reformas, \
                   Materiais de Construção",
    },
    ExpenseCategory {
        code: "6",
        description: "ADMINISTRATIVAS",
        examples: "Honorários Contábeis, Advocatícios, Agronômicos, \
                   Despesas Bancárias e Financeiras",
    },
    ExpenseCategory {
        code: "7",
        description: "SEGUROS E PROTEÇÃO",
        examples: "Seguro Agrícola, Seguro de Ativos, Seguro Prestamista",
    },
    ExpenseCategory {
        code: "8",
        description: "IMPOSTOS E TAXAS",
        examples: "ITR, IPTU, IPVA, INCRA-CCIR",
    },
    ExpenseCategory {
        code: "9",
        description: "INVESTIMENTOS",
        examples: "Aquisição de Máquinas e Implementos, Aquisição de Veículos, \
                   Aquisição de Imóveis, Infraestrutura Rural",
    },
    ExpenseCategory {
        code: "10",
        description: "OUTROS",
        examples: "Quando não se encaixar em nenhuma categoria acima",
    },
];

/// Look up a taxonomy entry by its code.
pub fn category_by_code(code: &str) -> Option<&'static ExpenseCategory> {
    EXPENSE_CATEGORIES.iter().find(|c| c.code == code.trim())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    #[serde(default, deserialize_with = "lenient_string")]
    pub razao_social: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub fantasia: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cnpj: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BilledParty {
    #[serde(default, deserialize_with = "lenient_string")]
    pub nome_completo: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cpf: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub numero: u32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub data_vencimento: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub valor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseClassification {
    #[serde(default, deserialize_with = "lenient_string")]
    pub codigo: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub descricao: String,
}

impl ExpenseClassification {
    /// The description to file this classification under: the model's own
    /// text, or the taxonomy entry for its code when the text is blank.
    pub fn resolved_description(&self) -> Option<&str> {
        let descricao = self.descricao.trim();
        if !descricao.is_empty() {
            return Some(descricao);
        }
        category_by_code(&self.codigo).map(|c| c.description)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDetails {
    #[serde(default, deserialize_with = "lenient_string")]
    pub numero: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub data_emissao: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub descricao_produtos: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parcelas: Vec<Installment>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub valor_total: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub classificacoes_despesa: Vec<ExpenseClassification>,
}

/// Everything the extractor pulls out of one invoice. All three sections
/// are always present, possibly with empty fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub fornecedor: Supplier,
    #[serde(default, deserialize_with = "null_as_default")]
    pub faturado: BilledParty,
    #[serde(default, deserialize_with = "null_as_default")]
    pub nota_fiscal: InvoiceDetails,
}

impl InvoiceData {
    /// How many of the key scalar fields were filled in.
    pub fn coverage(&self) -> (usize, usize) {
        let fields = [
            !self.fornecedor.razao_social.is_empty(),
            !self.fornecedor.cnpj.is_empty(),
            !self.faturado.nome_completo.is_empty(),
            !self.faturado.cpf.is_empty(),
            !self.nota_fiscal.numero.is_empty(),
            !self.nota_fiscal.data_emissao.is_empty(),
            !self.nota_fiscal.descricao_produtos.is_empty(),
            self.nota_fiscal.valor_total != 0.0,
        ];
        (fields.iter().filter(|&&v| v).count(), fields.len())
    }
}

// ---------------------------------------------------------------------------
// Lenient field decoding: models return numbers as strings, strings as
// numbers, and null for anything they could not find.
// ---------------------------------------------------------------------------

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n.as_f64().map(|f| f.max(0.0) as u32).unwrap_or(0),
        serde_json::Value::String(s) => leading_number(&s).unwrap_or(0),
        _ => 0,
    })
}

pub(crate) fn lenient_amount<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => parse_amount(&s).unwrap_or_else(|| {
            if !s.trim().is_empty() {
                warn!(raw = %s, "Unreadable amount, stored as 0");
            }
            0.0
        }),
        _ => 0.0,
    })
}

/// First run of digits in `raw`: installment numbers arrive as `"2"`,
/// `"1/3"` or `"01 de 03"`.
fn leading_number(raw: &str) -> Option<u32> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Parse a money string in either Brazilian (`1.234,56`, `1.500`) or plain
/// (`1234.56`, `1,234.56`) notation, ignoring currency symbols.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // Comma is the decimal separator: "1.234,56"
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        // Dot is the decimal separator: "1,234.56"
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // "1,234,567"
        (Some(_), None) if commas > 1 => cleaned.replace(',', ""),
        // "10,00"
        (Some(_), None) => cleaned.replace(',', "."),
        // "1.234.567" or "1.500"
        (None, Some(d)) if dots > 1 || cleaned.len() - d == 4 => cleaned.replace('.', ""),
        _ => cleaned,
    };
    normalized.parse().ok()
}
