//! Data models for strikes, cost allocations, reports and KPIs.
//!
//! Report types serialize with the field names the web and mobile clients
//! already consume (`resumo`, `porTipo`, `custo_total`, ...).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Label used when a strike has no category.
pub const SEM_CATEGORIA: &str = "Nao classificado";
/// Label used when a strike has no damage class.
pub const SEM_DANO: &str = "Sem dano";
/// Label used when a strike has no incident type.
pub const TIPO_DESCONHECIDO: &str = "desconhecido";
/// Label used when the species was not identified.
pub const ESPECIE_NAO_IDENTIFICADA: &str = "Nao identificada";
/// Label used when the location was not recorded.
pub const LOCAL_NAO_INFORMADO: &str = "Nao informado";

/// Qualitative severity derived from a strike's severity weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeverityTier {
    Baixa,
    Moderada,
    Alta,
    Critica,
}

impl SeverityTier {
    /// Classify a severity weight (0 to 5).
    ///
    /// # Thresholds
    ///
    /// - `Baixa`: weight <= 1 (also missing, negative or NaN weights)
    /// - `Moderada`: 1 < weight <= 2
    /// - `Alta`: 2 < weight <= 4
    /// - `Critica`: weight > 4
    pub fn from_weight(weight: f64) -> Self {
        if weight.is_nan() || weight <= 1.0 {
            SeverityTier::Baixa
        } else if weight <= 2.0 {
            SeverityTier::Moderada
        } else if weight <= 4.0 {
            SeverityTier::Alta
        } else {
            SeverityTier::Critica
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SeverityTier::Baixa => "Baixa",
            SeverityTier::Moderada => "Moderada",
            SeverityTier::Alta => "Alta",
            SeverityTier::Critica => "Critica",
        }
    }
}

/// Kind of a cost allocation attached to a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostType {
    Direto,
    Indireto,
    #[serde(other)]
    Outros,
}

impl CostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostType::Direto => "direto",
            CostType::Indireto => "indireto",
            CostType::Outros => "outros",
        }
    }
}

/// A stored cost allocation.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CostAllocation {
    pub id: i64,
    pub colisao_id: i64,
    pub tipo: String,
    pub valor: f64,
    pub descricao: Option<String>,
}

/// Request body entry for `PUT /api/colisoes/:id/custos`.
#[derive(Debug, Clone, Deserialize)]
pub struct CostAllocationInput {
    pub tipo: CostType,
    pub valor: f64,
    #[serde(default)]
    pub descricao: Option<String>,
}

/// One row of the wide financial query, before normalization.
///
/// Allocation sums are pre-aggregated per strike in SQL so each strike
/// yields exactly one row.
#[derive(Debug, Clone, FromRow)]
pub struct StrikeRow {
    pub id: i64,
    pub airport_id: i64,
    pub aeroporto: Option<String>,
    pub data: NaiveDate,
    pub hora: Option<String>,
    pub categoria: Option<String>,
    pub tipo_incidente: Option<String>,
    pub classe_dano: Option<String>,
    pub peso_severidade: Option<f64>,
    pub custo_brl: Option<f64>,
    pub notas: Option<String>,
    pub especie: Option<String>,
    pub local: Option<String>,
    pub n_alocacoes: i64,
    pub aloc_direto: f64,
    pub aloc_indireto: f64,
    pub aloc_outros: f64,
}

/// Costs of one strike split by type.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Costs {
    pub direto: f64,
    pub indireto: f64,
    pub outros: f64,
}

impl Costs {
    pub fn total(&self) -> f64 {
        self.direto + self.indireto + self.outros
    }

    pub fn add(&mut self, other: &Costs) {
        self.direto += other.direto;
        self.indireto += other.indireto;
        self.outros += other.outros;
    }
}

/// A strike normalized for reporting: fallback labels applied and costs
/// resolved from allocations or the legacy field.
#[derive(Debug, Clone)]
pub struct StrikeRecord {
    pub id: i64,
    pub airport_id: i64,
    pub aeroporto: Option<String>,
    pub data: NaiveDate,
    pub hora: Option<String>,
    pub categoria: String,
    pub tipo_incidente: String,
    pub classe_dano: String,
    pub peso_severidade: f64,
    pub especie: String,
    pub local: String,
    pub notas: Option<String>,
    pub custos: Costs,
}

/// Report query parameters: `airportId`, `startDate`, `endDate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodQuery {
    #[serde(default, alias = "airport_id")]
    pub airport_id: Option<i64>,
    #[serde(alias = "start_date")]
    pub start_date: NaiveDate,
    #[serde(alias = "end_date")]
    pub end_date: NaiveDate,
}

/// Resolved report filter, after tenancy checks.
#[derive(Debug, Clone, Copy)]
pub struct ReportFilter {
    pub airport_id: Option<i64>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Grand totals of the financial dataset.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Totais {
    pub eventos: u64,
    pub custo_direto: f64,
    pub custo_indireto: f64,
    pub custo_outros: f64,
    pub custo_total: f64,
}

/// Summary row per (year, category, incident type, damage class).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResumoItem {
    pub ano: i32,
    pub categoria: String,
    pub tipo_incidente: String,
    pub classe_dano: String,
    pub eventos: u64,
    pub custo_direto: f64,
    pub custo_indireto: f64,
    pub custo_outros: f64,
    pub custo_total: f64,
    pub severidade_media: f64,
}

/// One bucket of a single-dimension aggregation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgrupamentoItem {
    pub chave: String,
    pub eventos: u64,
    pub custo_total: f64,
    pub custo_medio: f64,
    pub severidade_media: f64,
    pub percentual_eventos: f64,
    pub percentual_custo: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agrupamentos {
    pub por_tipo: Vec<AgrupamentoItem>,
    pub por_categoria: Vec<AgrupamentoItem>,
    pub por_dano: Vec<AgrupamentoItem>,
    pub por_severidade: Vec<AgrupamentoItem>,
}

/// One strike in the flat incident list.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Incidente {
    pub id: i64,
    pub airport_id: i64,
    pub aeroporto: Option<String>,
    /// ISO date, `YYYY-MM-DD`.
    pub data: String,
    pub hora: Option<String>,
    pub ano: i32,
    pub categoria: String,
    pub tipo_incidente: String,
    pub classe_dano: String,
    pub peso_severidade: f64,
    pub severidade: SeverityTier,
    pub especie: String,
    pub local: String,
    pub custo_direto: f64,
    pub custo_indireto: f64,
    pub custo_outros: f64,
    pub custo_total: f64,
    pub notas: Option<String>,
    pub descricao: String,
}

/// Response for `GET /api/relatorios/financeiro`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FinancialDataset {
    pub resumo: Vec<ResumoItem>,
    pub agrupamentos: Agrupamentos,
    pub incidentes: Vec<Incidente>,
    pub totais: Totais,
}

/// Strike count for one species.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EspecieContagem {
    pub especie: String,
    pub colisoes: i64,
}

/// Raw counts read for the KPI endpoint.
#[derive(Debug, Clone, Default, FromRow)]
pub struct KpiCounts {
    pub colisoes: i64,
    pub colisoes_com_dano: i64,
    pub movimentos: i64,
    pub avistamentos: i64,
    pub individuos_avistados: i64,
    pub acoes_controle: i64,
    pub inspecoes: i64,
    pub carcacas: i64,
    pub treinamentos: i64,
}

/// Response for `GET /api/kpis`.
#[derive(Debug, Clone, Serialize)]
pub struct KpiResponse {
    pub airport_id: Option<i64>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub colisoes: i64,
    pub colisoes_com_dano: i64,
    pub movimentos: i64,
    /// Strikes per 10,000 movements; 0 when there were no movements.
    pub taxa_colisao_10k: f64,
    pub avistamentos: i64,
    pub individuos_avistados: i64,
    pub acoes_controle: i64,
    pub inspecoes: i64,
    pub carcacas: i64,
    pub treinamentos: i64,
    pub especies_mais_colididas: Vec<EspecieContagem>,
}

/// An airport (tenant).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Aeroporto {
    pub id: i64,
    pub icao: String,
    pub nome: String,
    pub cidade: Option<String>,
    pub uf: Option<String>,
}

/// Request body for `POST /api/aeroportos`.
#[derive(Debug, Clone, Deserialize)]
pub struct AeroportoInput {
    pub icao: String,
    pub nome: String,
    #[serde(default)]
    pub cidade: Option<String>,
    #[serde(default)]
    pub uf: Option<String>,
}

/// A lookup table entry.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LookupEntry {
    pub id: i64,
    pub codigo: String,
    pub nome: String,
}

/// Query parameters for generic list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default, alias = "airport_id")]
    pub airport_id: Option<i64>,
    #[serde(default, alias = "start_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, alias = "end_date")]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_tier_boundaries() {
        assert_eq!(SeverityTier::from_weight(0.0), SeverityTier::Baixa);
        assert_eq!(SeverityTier::from_weight(1.0), SeverityTier::Baixa);
        assert_eq!(SeverityTier::from_weight(1.01), SeverityTier::Moderada);
        assert_eq!(SeverityTier::from_weight(2.0), SeverityTier::Moderada);
        assert_eq!(SeverityTier::from_weight(2.01), SeverityTier::Alta);
        assert_eq!(SeverityTier::from_weight(4.0), SeverityTier::Alta);
        assert_eq!(SeverityTier::from_weight(4.01), SeverityTier::Critica);
        assert_eq!(SeverityTier::from_weight(5.0), SeverityTier::Critica);
    }

    #[test]
    fn test_severity_tier_degenerate_weights() {
        assert_eq!(SeverityTier::from_weight(-3.0), SeverityTier::Baixa);
        assert_eq!(SeverityTier::from_weight(f64::NAN), SeverityTier::Baixa);
    }

    #[test]
    fn test_cost_type_parsing() {
        let t: CostType = serde_json::from_str("\"direto\"").unwrap();
        assert_eq!(t, CostType::Direto);
        let t: CostType = serde_json::from_str("\"seguro\"").unwrap();
        assert_eq!(t, CostType::Outros);
        assert_eq!(CostType::Indireto.as_str(), "indireto");
    }

    #[test]
    fn test_costs_total() {
        let mut c = Costs {
            direto: 100.0,
            indireto: 20.5,
            outros: 0.0,
        };
        c.add(&Costs {
            direto: 1.0,
            indireto: 0.0,
            outros: 3.0,
        });
        assert_eq!(c.total(), 124.5);
    }

    #[test]
    fn test_agrupamentos_field_names() {
        let json = serde_json::to_value(Agrupamentos::default()).unwrap();
        for key in ["porTipo", "porCategoria", "porDano", "porSeveridade"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
