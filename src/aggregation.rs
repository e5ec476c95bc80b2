//! Financial dataset and KPI computation.
//!
//! Strikes are read once per request by [`Storage::fetch_strike_rows`],
//! normalized into [`StrikeRecord`]s and folded in memory. The fold itself is
//! pure so it can be tested without a database.
//!
//! # Rounding
//!
//! Each strike's costs are rounded to cents once, in [`normalize`]. Sums,
//! percentages and severity means are rounded to two decimals when written
//! out.

use std::collections::BTreeMap;

use chrono::Datelike;

use crate::error::Result;
use crate::model::{
    AgrupamentoItem, Agrupamentos, Costs, ESPECIE_NAO_IDENTIFICADA, FinancialDataset, Incidente,
    KpiResponse, LOCAL_NAO_INFORMADO, ReportFilter, ResumoItem, SEM_CATEGORIA, SEM_DANO,
    SeverityTier, StrikeRecord, StrikeRow, TIPO_DESCONHECIDO, Totais,
};
use crate::storage::Storage;

/// Number of species listed in the KPI response.
const TOP_SPECIES: i64 = 5;

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Format a value as Brazilian currency, e.g. `R$ 1.234,56`.
pub fn format_brl(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();

    let reais = (cents / 100).to_string();
    let mut grouped = String::with_capacity(reais.len() + reais.len() / 3);
    for (i, ch) in reais.chars().enumerate() {
        if i > 0 && (reais.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    format!("{sign}R$ {grouped},{:02}", cents % 100)
}

fn label_or(value: Option<String>, fallback: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => fallback.to_string(),
    }
}

/// Apply fallback labels and resolve costs.
///
/// A strike with at least one allocation is costed from its allocations
/// only. Otherwise its legacy `custo_brl` counts as a direct cost.
///
/// Costs are rounded to cents here; every total is a sum of these values.
pub fn normalize(row: StrikeRow) -> StrikeRecord {
    let custos = if row.n_alocacoes > 0 {
        Costs {
            direto: round2(row.aloc_direto),
            indireto: round2(row.aloc_indireto),
            outros: round2(row.aloc_outros),
        }
    } else {
        Costs {
            direto: round2(row.custo_brl.unwrap_or(0.0)),
            ..Costs::default()
        }
    };

    StrikeRecord {
        id: row.id,
        airport_id: row.airport_id,
        aeroporto: row.aeroporto,
        data: row.data,
        hora: row.hora,
        categoria: label_or(row.categoria, SEM_CATEGORIA),
        tipo_incidente: label_or(row.tipo_incidente, TIPO_DESCONHECIDO),
        classe_dano: label_or(row.classe_dano, SEM_DANO),
        peso_severidade: row.peso_severidade.unwrap_or(0.0),
        especie: label_or(row.especie, ESPECIE_NAO_IDENTIFICADA),
        local: label_or(row.local, LOCAL_NAO_INFORMADO),
        notas: row.notas.filter(|n| !n.trim().is_empty()),
        custos,
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    eventos: u64,
    custos: Costs,
    severidade: f64,
}

impl Accumulator {
    fn push(&mut self, record: &StrikeRecord) {
        self.eventos += 1;
        self.custos.add(&record.custos);
        self.severidade += record.peso_severidade;
    }

    fn severidade_media(&self) -> f64 {
        if self.eventos == 0 {
            0.0
        } else {
            round2(self.severidade / self.eventos as f64)
        }
    }
}

fn bucket<F>(records: &[StrikeRecord], totais: &Totais, key: F) -> Vec<AgrupamentoItem>
where
    F: Fn(&StrikeRecord) -> String,
{
    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    for record in records {
        groups.entry(key(record)).or_default().push(record);
    }

    let percent = |part: f64, whole: f64| {
        if whole > 0.0 {
            round2(part / whole * 100.0)
        } else {
            0.0
        }
    };

    let mut items: Vec<AgrupamentoItem> = groups
        .into_iter()
        .map(|(chave, acc)| {
            let total = acc.custos.total();
            AgrupamentoItem {
                chave,
                eventos: acc.eventos,
                custo_total: round2(total),
                custo_medio: round2(total / acc.eventos as f64),
                severidade_media: acc.severidade_media(),
                percentual_eventos: percent(acc.eventos as f64, totais.eventos as f64),
                percentual_custo: percent(total, totais.custo_total),
            }
        })
        .collect();

    items.sort_by(|a, b| {
        b.custo_total
            .total_cmp(&a.custo_total)
            .then(b.eventos.cmp(&a.eventos))
            .then_with(|| a.chave.cmp(&b.chave))
    });
    items
}

fn describe(record: &StrikeRecord, tier: SeverityTier) -> String {
    let mut text = format!(
        "{}: {} ({}) em {}. Especie: {}. Dano: {}. Severidade: {}. Custo total: {}.",
        record.data.format("%d/%m/%Y"),
        record.tipo_incidente,
        record.categoria,
        record.local,
        record.especie,
        record.classe_dano,
        tier.label(),
        format_brl(record.custos.total()),
    );
    if let Some(notas) = &record.notas {
        text.push_str(" Notas: ");
        text.push_str(notas);
    }
    text
}

/// Fold normalized strikes into the financial dataset.
///
/// Never fails; an empty input yields empty lists and zero totals.
pub fn build_financial_dataset(records: &[StrikeRecord]) -> FinancialDataset {
    let mut all = Accumulator::default();
    for record in records {
        all.push(record);
    }

    // Percentages are taken against the grand total before output rounding.
    let exact = Totais {
        eventos: all.eventos,
        custo_direto: all.custos.direto,
        custo_indireto: all.custos.indireto,
        custo_outros: all.custos.outros,
        custo_total: all.custos.total(),
    };

    let mut resumo_groups: BTreeMap<(i32, String, String, String), Accumulator> = BTreeMap::new();
    for record in records {
        let key = (
            record.data.year(),
            record.categoria.clone(),
            record.tipo_incidente.clone(),
            record.classe_dano.clone(),
        );
        resumo_groups.entry(key).or_default().push(record);
    }

    let mut resumo: Vec<ResumoItem> = resumo_groups
        .into_iter()
        .map(|((ano, categoria, tipo_incidente, classe_dano), acc)| ResumoItem {
            ano,
            categoria,
            tipo_incidente,
            classe_dano,
            eventos: acc.eventos,
            custo_direto: round2(acc.custos.direto),
            custo_indireto: round2(acc.custos.indireto),
            custo_outros: round2(acc.custos.outros),
            custo_total: round2(acc.custos.total()),
            severidade_media: acc.severidade_media(),
        })
        .collect();
    resumo.sort_by(|a, b| {
        b.ano
            .cmp(&a.ano)
            .then(b.custo_total.total_cmp(&a.custo_total))
    });

    let agrupamentos = Agrupamentos {
        por_tipo: bucket(records, &exact, |r| r.tipo_incidente.clone()),
        por_categoria: bucket(records, &exact, |r| r.categoria.clone()),
        por_dano: bucket(records, &exact, |r| r.classe_dano.clone()),
        por_severidade: bucket(records, &exact, |r| {
            SeverityTier::from_weight(r.peso_severidade).label().to_string()
        }),
    };

    let incidentes = records
        .iter()
        .map(|record| {
            let severidade = SeverityTier::from_weight(record.peso_severidade);
            Incidente {
                id: record.id,
                airport_id: record.airport_id,
                aeroporto: record.aeroporto.clone(),
                data: record.data.format("%Y-%m-%d").to_string(),
                hora: record.hora.clone(),
                ano: record.data.year(),
                categoria: record.categoria.clone(),
                tipo_incidente: record.tipo_incidente.clone(),
                classe_dano: record.classe_dano.clone(),
                peso_severidade: record.peso_severidade,
                severidade,
                especie: record.especie.clone(),
                local: record.local.clone(),
                custo_direto: round2(record.custos.direto),
                custo_indireto: round2(record.custos.indireto),
                custo_outros: round2(record.custos.outros),
                custo_total: round2(record.custos.total()),
                notas: record.notas.clone(),
                descricao: describe(record, severidade),
            }
        })
        .collect();

    let totais = Totais {
        eventos: exact.eventos,
        custo_direto: round2(exact.custo_direto),
        custo_indireto: round2(exact.custo_indireto),
        custo_outros: round2(exact.custo_outros),
        custo_total: round2(exact.custo_total),
    };

    FinancialDataset {
        resumo,
        agrupamentos,
        incidentes,
        totais,
    }
}

/// Build the financial dataset for a period.
pub async fn financial_dataset(storage: &Storage, filter: &ReportFilter) -> Result<FinancialDataset> {
    let records: Vec<StrikeRecord> = storage
        .fetch_strike_rows(filter)
        .await?
        .into_iter()
        .map(normalize)
        .collect();

    Ok(build_financial_dataset(&records))
}

/// Compute the dashboard KPIs for a period.
pub async fn compute_kpis(storage: &Storage, filter: &ReportFilter) -> Result<KpiResponse> {
    let counts = storage.kpi_counts(filter).await?;
    let especies_mais_colididas = storage.top_struck_species(filter, TOP_SPECIES).await?;

    let taxa_colisao_10k = if counts.movimentos > 0 {
        round2(counts.colisoes as f64 / counts.movimentos as f64 * 10_000.0)
    } else {
        0.0
    };

    Ok(KpiResponse {
        airport_id: filter.airport_id,
        start_date: filter.start_date,
        end_date: filter.end_date,
        colisoes: counts.colisoes,
        colisoes_com_dano: counts.colisoes_com_dano,
        movimentos: counts.movimentos,
        taxa_colisao_10k,
        avistamentos: counts.avistamentos,
        individuos_avistados: counts.individuos_avistados,
        acoes_controle: counts.acoes_controle,
        inspecoes: counts.inspecoes,
        carcacas: counts.carcacas,
        treinamentos: counts.treinamentos,
        especies_mais_colididas,
    })
}
