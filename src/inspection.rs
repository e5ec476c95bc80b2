//! Wildlife inspections.
//!
//! An inspection is a parent row in `fact_inspecao`, an ordered checklist in
//! `fact_inspecao_item`, and a list of structured sections kept as one JSON
//! document. Each write runs in a single transaction so the parent and its
//! children never diverge.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::patch::{Field, PatchError, RowKey, build_update, timestamp_text};
use crate::storage::{DEFAULT_LIMIT, MAX_LIMIT, Storage, bind_values, map_write_error};

/// Regulatory form types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipoInspecao {
    /// Daily runway and strip walk.
    Diaria,
    /// Weekly perimeter and habitat survey.
    Semanal,
    /// Fence integrity inspection.
    Cerca,
    /// Attraction focus survey (drainage, vegetation, waste).
    Focos,
}

impl TipoInspecao {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipoInspecao::Diaria => "diaria",
            TipoInspecao::Semanal => "semanal",
            TipoInspecao::Cerca => "cerca",
            TipoInspecao::Focos => "focos",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "diaria" => Some(TipoInspecao::Diaria),
            "semanal" => Some(TipoInspecao::Semanal),
            "cerca" => Some(TipoInspecao::Cerca),
            "focos" => Some(TipoInspecao::Focos),
            _ => None,
        }
    }
}

/// A structured sub-form of an inspection, tagged by `tipo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum Secao {
    OcorrenciaCerca {
        trecho: String,
        descricao: String,
        #[serde(default)]
        reparo_necessario: bool,
    },
    FocoDrenagem {
        local: String,
        #[serde(default)]
        agua_parada: bool,
        #[serde(default)]
        observacao: Option<String>,
    },
    FocoVegetacao {
        local: String,
        #[serde(default)]
        altura_cm: Option<f64>,
        #[serde(default)]
        observacao: Option<String>,
    },
    FocoResiduos {
        local: String,
        tipo_residuo: String,
        #[serde(default)]
        observacao: Option<String>,
    },
}

/// One checklist line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(deny_unknown_fields)]
pub struct ItemInspecao {
    pub descricao: String,
    pub conforme: bool,
    #[serde(default)]
    pub observacao: Option<String>,
}

/// An inspection with its children.
#[derive(Debug, Clone, Serialize)]
pub struct Inspecao {
    pub id: i64,
    pub airport_id: i64,
    pub tipo: TipoInspecao,
    pub data: String,
    pub responsavel: Option<String>,
    pub observacoes: Option<String>,
    pub secoes: Vec<Secao>,
    pub itens: Vec<ItemInspecao>,
    pub created_at: String,
    pub updated_at: String,
}

/// Request body for `POST /api/inspecoes`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NovaInspecao {
    #[serde(default)]
    pub airport_id: Option<i64>,
    pub tipo: TipoInspecao,
    pub data: NaiveDate,
    #[serde(default)]
    pub responsavel: Option<String>,
    #[serde(default)]
    pub observacoes: Option<String>,
    #[serde(default)]
    pub secoes: Vec<Secao>,
    #[serde(default)]
    pub itens: Vec<ItemInspecao>,
}

/// Query parameters for `GET /api/inspecoes`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspecaoQuery {
    #[serde(default, alias = "airport_id")]
    pub airport_id: Option<i64>,
    #[serde(default)]
    pub tipo: Option<TipoInspecao>,
    #[serde(default, alias = "start_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, alias = "end_date")]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Parent columns writable through `PUT /api/inspecoes/:id`.
static INSPECAO_FIELDS: &[Field] = &[
    Field::text("tipo").required(),
    Field::date("data").required(),
    Field::text("responsavel"),
    Field::text("observacoes"),
    Field::json("secoes"),
];

#[derive(Debug, FromRow)]
struct InspecaoRow {
    id: i64,
    airport_id: i64,
    tipo: String,
    data: String,
    responsavel: Option<String>,
    observacoes: Option<String>,
    secoes: String,
    created_at: String,
    updated_at: String,
}

fn validation(err: impl std::fmt::Display) -> AppError {
    AppError::Validation(err.to_string())
}

fn check_items(itens: &[ItemInspecao]) -> Result<()> {
    if itens.iter().any(|i| i.descricao.trim().is_empty()) {
        return Err(AppError::Validation(
            "field 'itens.descricao' must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate and normalize the typed parts of an inspection patch.
///
/// Returns the parent-column patch and the replacement checklist, if any.
fn prepare_patch(
    patch: &Map<String, Value>,
) -> Result<(Map<String, Value>, Option<Vec<ItemInspecao>>)> {
    let mut parent = patch.clone();

    let itens = parent
        .remove("itens")
        .map(serde_json::from_value::<Vec<ItemInspecao>>)
        .transpose()
        .map_err(validation)?;
    if let Some(itens) = &itens {
        check_items(itens)?;
    }

    if let Some(tipo) = parent.get("tipo") {
        serde_json::from_value::<TipoInspecao>(tipo.clone())
            .map_err(|_| validation("field 'tipo' must be one of diaria, semanal, cerca, focos"))?;
    }

    if let Some(secoes) = parent.get_mut("secoes") {
        let parsed: Vec<Secao> = if secoes.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(secoes.clone()).map_err(validation)?
        };
        *secoes = serde_json::to_value(parsed)?;
    }

    if parent.is_empty() && itens.is_none() {
        return Err(PatchError::NoFields.into());
    }

    Ok((parent, itens))
}

async fn insert_items(
    tx: &mut Transaction<'_, Sqlite>,
    inspecao_id: i64,
    itens: &[ItemInspecao],
) -> Result<()> {
    for (ordem, item) in itens.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO fact_inspecao_item (inspecao_id, ordem, descricao, conforme, observacao)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(inspecao_id)
        .bind(ordem as i64)
        .bind(&item.descricao)
        .bind(item.conforme)
        .bind(&item.observacao)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

impl Storage {
    async fn load_items(&self, inspecao_id: i64) -> Result<Vec<ItemInspecao>> {
        Ok(sqlx::query_as::<_, ItemInspecao>(
            r#"
            SELECT descricao, conforme, observacao
            FROM fact_inspecao_item
            WHERE inspecao_id = ?
            ORDER BY ordem
            "#,
        )
        .bind(inspecao_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn hydrate(&self, row: InspecaoRow) -> Result<Inspecao> {
        let tipo = TipoInspecao::parse(&row.tipo).ok_or_else(|| {
            AppError::Internal(format!("inspecao {} has unknown tipo '{}'", row.id, row.tipo))
        })?;
        let secoes: Vec<Secao> = serde_json::from_str(&row.secoes)?;
        let itens = self.load_items(row.id).await?;

        Ok(Inspecao {
            id: row.id,
            airport_id: row.airport_id,
            tipo,
            data: row.data,
            responsavel: row.responsavel,
            observacoes: row.observacoes,
            secoes,
            itens,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    pub async fn get_inspection(&self, id: i64, airport_id: Option<i64>) -> Result<Inspecao> {
        let row = sqlx::query_as::<_, InspecaoRow>(
            r#"
            SELECT id, airport_id, tipo, data, responsavel, observacoes, secoes, created_at, updated_at
            FROM fact_inspecao
            WHERE id = ? AND (? IS NULL OR airport_id = ?)
            "#,
        )
        .bind(id)
        .bind(airport_id)
        .bind(airport_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("inspecao {id}")))?;

        self.hydrate(row).await
    }

    pub async fn list_inspections(
        &self,
        airport_id: Option<i64>,
        query: &InspecaoQuery,
    ) -> Result<Vec<Inspecao>> {
        let rows = sqlx::query_as::<_, InspecaoRow>(
            r#"
            SELECT id, airport_id, tipo, data, responsavel, observacoes, secoes, created_at, updated_at
            FROM fact_inspecao
            WHERE (? IS NULL OR airport_id = ?)
              AND (? IS NULL OR tipo = ?)
              AND (? IS NULL OR data >= ?)
              AND (? IS NULL OR data <= ?)
            ORDER BY data DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(airport_id)
        .bind(airport_id)
        .bind(query.tipo.map(|t| t.as_str()))
        .bind(query.tipo.map(|t| t.as_str()))
        .bind(query.start_date)
        .bind(query.start_date)
        .bind(query.end_date)
        .bind(query.end_date)
        .bind(query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT))
        .bind(query.offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut inspections = Vec::with_capacity(rows.len());
        for row in rows {
            inspections.push(self.hydrate(row).await?);
        }
        Ok(inspections)
    }

    /// Insert an inspection and its checklist atomically.
    pub async fn create_inspection(&self, input: &NovaInspecao, airport_id: i64) -> Result<Inspecao> {
        check_items(&input.itens)?;
        let secoes = serde_json::to_string(&input.secoes)?;
        let now = timestamp_text(Utc::now());

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO fact_inspecao
                (airport_id, tipo, data, responsavel, observacoes, secoes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(airport_id)
        .bind(input.tipo.as_str())
        .bind(input.data.format("%Y-%m-%d").to_string())
        .bind(&input.responsavel)
        .bind(&input.observacoes)
        .bind(&secoes)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(map_write_error)?;

        let id = result.last_insert_rowid();
        insert_items(&mut tx, id, &input.itens).await?;
        tx.commit().await?;

        debug!(id, airport_id, itens = input.itens.len(), "Inspection created");
        self.get_inspection(id, None).await
    }

    /// Apply a partial update, optionally replacing the checklist.
    ///
    /// The parent row is locked before anything else so concurrent edits of
    /// the same inspection are serialized. Validation happens before the
    /// transaction starts; any failure inside it rolls everything back.
    pub async fn update_inspection(
        &self,
        id: i64,
        airport_id: Option<i64>,
        patch: &Map<String, Value>,
    ) -> Result<Inspecao> {
        let (parent, itens) = prepare_patch(patch)?;
        let now = Utc::now();
        let key = RowKey { id, airport_id };
        let statement = if parent.is_empty() {
            None
        } else {
            Some(build_update("fact_inspecao", INSPECAO_FIELDS, &parent, key, now)?)
        };

        let mut tx = self.pool.begin().await?;

        // No-op write: takes the database write lock for this transaction.
        let locked = sqlx::query(
            "UPDATE fact_inspecao SET updated_at = ? WHERE id = ? AND (? IS NULL OR airport_id = ?)",
        )
        .bind(timestamp_text(now))
        .bind(id)
        .bind(airport_id)
        .bind(airport_id)
        .execute(&mut *tx)
        .await?;

        if locked.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("inspecao {id}")));
        }

        if let Some(statement) = &statement {
            bind_values(sqlx::query(&statement.sql), &statement.values)
                .execute(&mut *tx)
                .await
                .map_err(map_write_error)?;
        }

        if let Some(itens) = &itens {
            sqlx::query("DELETE FROM fact_inspecao_item WHERE inspecao_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            insert_items(&mut tx, id, itens).await?;
        }

        tx.commit().await?;
        debug!(id, replaced_items = itens.is_some(), "Inspection updated");

        self.get_inspection(id, airport_id).await
    }

    /// Delete an inspection and its checklist atomically.
    pub async fn delete_inspection(&self, id: i64, airport_id: Option<i64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM fact_inspecao_item WHERE inspecao_id IN \
             (SELECT id FROM fact_inspecao WHERE id = ? AND (? IS NULL OR airport_id = ?))",
        )
        .bind(id)
        .bind(airport_id)
        .bind(airport_id)
        .execute(&mut *tx)
        .await?;

        let parent = sqlx::query(
            "DELETE FROM fact_inspecao WHERE id = ? AND (? IS NULL OR airport_id = ?)",
        )
        .bind(id)
        .bind(airport_id)
        .bind(airport_id)
        .execute(&mut *tx)
        .await?;

        if parent.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("inspecao {id}")));
        }

        tx.commit().await?;
        debug!(id, items = deleted.rows_affected(), "Inspection deleted");
        Ok(())
    }
}
