//! SQLite storage layer.
//!
//! The schema follows a small data-warehouse layout:
//!
//! - `fact_*`: one row per recorded event (strike, sighting, movement, ...)
//! - `dim_*`: descriptive entities referenced by facts (airport, species, location)
//! - `lu_*`: seeded enumerations (damage class, phase of flight, ...)
//!
//! Every fact row belongs to one airport through `airport_id`. All SQL is
//! parameterized; table and column names come from static descriptors only.

use std::str::FromStr;

use chrono::Utc;
use serde_json::{Map, Value, json};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{FromRow, Row, Sqlite};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::model::{
    Aeroporto, AeroportoInput, CostAllocation, CostAllocationInput, ESPECIE_NAO_IDENTIFICADA,
    EspecieContagem, KpiCounts, ListQuery, LookupEntry, ReportFilter, StrikeRow,
};
use crate::patch::{ColumnKind, RowKey, SqlValue, build_insert, build_update, timestamp_text};
use crate::resources::Resource;

/// Default page size for list endpoints.
pub const DEFAULT_LIMIT: i64 = 200;
/// Largest page a list endpoint returns.
pub const MAX_LIMIT: i64 = 1000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dim_aeroporto (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        icao TEXT NOT NULL UNIQUE,
        nome TEXT NOT NULL,
        cidade TEXT,
        uf TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lu_classe_dano (
        id INTEGER PRIMARY KEY,
        codigo TEXT NOT NULL UNIQUE,
        nome TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lu_fase_voo (
        id INTEGER PRIMARY KEY,
        codigo TEXT NOT NULL UNIQUE,
        nome TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lu_condicao_tempo (
        id INTEGER PRIMARY KEY,
        codigo TEXT NOT NULL UNIQUE,
        nome TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lu_quadrante (
        id INTEGER PRIMARY KEY,
        codigo TEXT NOT NULL UNIQUE,
        nome TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_especie (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        nome_popular TEXT NOT NULL,
        nome_cientifico TEXT,
        grupo TEXT,
        porte TEXT,
        peso_medio_kg REAL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_local (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        nome TEXT NOT NULL,
        tipo TEXT,
        latitude REAL,
        longitude REAL,
        quadrante_id INTEGER REFERENCES lu_quadrante(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_colisao (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        hora TEXT,
        especie_id INTEGER REFERENCES dim_especie(id),
        local_id INTEGER REFERENCES dim_local(id),
        fase_voo_id INTEGER REFERENCES lu_fase_voo(id),
        classe_dano_id INTEGER REFERENCES lu_classe_dano(id),
        condicao_tempo_id INTEGER REFERENCES lu_condicao_tempo(id),
        categoria TEXT,
        tipo_incidente TEXT,
        peso_severidade REAL,
        custo_brl REAL,
        aeronave TEXT,
        altitude_pes INTEGER,
        notas TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_colisao_custo (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        colisao_id INTEGER NOT NULL REFERENCES fact_colisao(id) ON DELETE CASCADE,
        tipo TEXT NOT NULL,
        valor REAL NOT NULL CHECK (valor >= 0),
        descricao TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_avistamento (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        hora TEXT,
        especie_id INTEGER REFERENCES dim_especie(id),
        local_id INTEGER REFERENCES dim_local(id),
        quadrante_id INTEGER REFERENCES lu_quadrante(id),
        condicao_tempo_id INTEGER REFERENCES lu_condicao_tempo(id),
        quantidade INTEGER,
        comportamentos TEXT,
        observacoes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_movimento (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        pousos INTEGER,
        decolagens INTEGER,
        observacoes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_acao_controle (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        hora TEXT,
        tipo_acao TEXT NOT NULL,
        especie_id INTEGER REFERENCES dim_especie(id),
        local_id INTEGER REFERENCES dim_local(id),
        metodos TEXT,
        quantidade_dispersada INTEGER,
        resultado TEXT,
        observacoes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_carcaca (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        hora TEXT,
        especie_id INTEGER REFERENCES dim_especie(id),
        local_id INTEGER REFERENCES dim_local(id),
        quantidade INTEGER,
        estado TEXT,
        destino TEXT,
        colisao_id INTEGER REFERENCES fact_colisao(id) ON DELETE SET NULL,
        observacoes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_treinamento (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        data TEXT NOT NULL,
        titulo TEXT NOT NULL,
        instrutor TEXT,
        carga_horaria REAL,
        participantes TEXT,
        observacoes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_inspecao (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        airport_id INTEGER NOT NULL REFERENCES dim_aeroporto(id),
        tipo TEXT NOT NULL,
        data TEXT NOT NULL,
        responsavel TEXT,
        observacoes TEXT,
        secoes TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_inspecao_item (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        inspecao_id INTEGER NOT NULL REFERENCES fact_inspecao(id) ON DELETE CASCADE,
        ordem INTEGER NOT NULL,
        descricao TEXT NOT NULL,
        conforme BOOLEAN NOT NULL,
        observacao TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fact_colisao_airport_data ON fact_colisao(airport_id, data)",
    "CREATE INDEX IF NOT EXISTS idx_fact_colisao_custo_colisao ON fact_colisao_custo(colisao_id)",
    "CREATE INDEX IF NOT EXISTS idx_fact_avistamento_airport_data ON fact_avistamento(airport_id, data)",
    "CREATE INDEX IF NOT EXISTS idx_fact_movimento_airport_data ON fact_movimento(airport_id, data)",
    "CREATE INDEX IF NOT EXISTS idx_fact_inspecao_airport_data ON fact_inspecao(airport_id, data)",
    "CREATE INDEX IF NOT EXISTS idx_fact_inspecao_item_inspecao ON fact_inspecao_item(inspecao_id)",
];

const SEED: &[&str] = &[
    r#"
    INSERT OR IGNORE INTO lu_classe_dano (id, codigo, nome) VALUES
        (1, 'N', 'Sem dano'),
        (2, 'M', 'Menor'),
        (3, 'M?', 'Indeterminado'),
        (4, 'S', 'Substancial'),
        (5, 'D', 'Destruida')
    "#,
    r#"
    INSERT OR IGNORE INTO lu_fase_voo (id, codigo, nome) VALUES
        (1, 'TAX', 'Taxiamento'),
        (2, 'DEC', 'Decolagem'),
        (3, 'SUB', 'Subida'),
        (4, 'ROT', 'Em rota'),
        (5, 'APR', 'Aproximacao'),
        (6, 'POU', 'Pouso')
    "#,
    r#"
    INSERT OR IGNORE INTO lu_condicao_tempo (id, codigo, nome) VALUES
        (1, 'CLR', 'Ceu claro'),
        (2, 'NUB', 'Nublado'),
        (3, 'CHU', 'Chuva'),
        (4, 'NEV', 'Nevoeiro')
    "#,
    r#"
    INSERT OR IGNORE INTO lu_quadrante (id, codigo, nome) VALUES
        (1, 'NE', 'Nordeste'),
        (2, 'NO', 'Noroeste'),
        (3, 'SE', 'Sudeste'),
        (4, 'SO', 'Sudoeste')
    "#,
];

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind values to `?` placeholders in order.
pub(crate) fn bind_values<'q>(mut query: SqliteQuery<'q>, values: &'q [SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(n) => query.bind(*n),
            SqlValue::Real(n) => query.bind(*n),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Bool(b) => query.bind(*b),
        };
    }
    query
}

/// Turn reference violations on writes into client errors.
///
/// Everything else, including unique violations, stays a database error.
pub(crate) fn map_write_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.kind() == ErrorKind::ForeignKeyViolation => {
            AppError::Validation("operation violates a reference to another record".to_string())
        }
        _ => AppError::Database(err),
    }
}

fn date_text(date: chrono::NaiveDate) -> SqlValue {
    SqlValue::Text(date.format("%Y-%m-%d").to_string())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the default pool size and
    /// initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:faunaguard.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Create a new storage instance with an explicit pool size.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create tables and indexes if missing, then seed the lookup tables.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.iter().chain(SEED) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic resources
    // ------------------------------------------------------------------

    fn select_columns(resource: &Resource) -> String {
        let mut columns = vec!["id"];
        if resource.airport_scoped {
            columns.push("airport_id");
        }
        columns.extend(resource.fields.iter().map(|f| f.column));
        columns.extend(["created_at", "updated_at"]);
        columns.join(", ")
    }

    fn row_to_json(resource: &Resource, row: &SqliteRow) -> Result<Value> {
        let mut obj = Map::new();
        obj.insert("id".to_string(), json!(row.try_get::<i64, _>("id")?));
        if resource.airport_scoped {
            obj.insert(
                "airport_id".to_string(),
                json!(row.try_get::<i64, _>("airport_id")?),
            );
        }

        for field in resource.fields {
            let value = match field.kind {
                ColumnKind::Integer => json!(row.try_get::<Option<i64>, _>(field.column)?),
                ColumnKind::Real => json!(row.try_get::<Option<f64>, _>(field.column)?),
                ColumnKind::Boolean => json!(row.try_get::<Option<bool>, _>(field.column)?),
                ColumnKind::Text | ColumnKind::Date | ColumnKind::Time => {
                    json!(row.try_get::<Option<String>, _>(field.column)?)
                }
                ColumnKind::TextList | ColumnKind::Json => {
                    match row.try_get::<Option<String>, _>(field.column)? {
                        Some(text) => serde_json::from_str(&text)?,
                        None => Value::Null,
                    }
                }
            };
            obj.insert(field.name.to_string(), value);
        }

        obj.insert(
            "created_at".to_string(),
            json!(row.try_get::<String, _>("created_at")?),
        );
        obj.insert(
            "updated_at".to_string(),
            json!(row.try_get::<String, _>("updated_at")?),
        );

        Ok(Value::Object(obj))
    }

    /// List rows of a resource, newest first.
    pub async fn list_records(
        &self,
        resource: &Resource,
        airport_id: Option<i64>,
        query: &ListQuery,
    ) -> Result<Vec<Value>> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            Self::select_columns(resource),
            resource.table
        );
        let mut values = Vec::new();

        if let (true, Some(id)) = (resource.airport_scoped, airport_id) {
            sql.push_str(" AND airport_id = ?");
            values.push(SqlValue::Integer(id));
        }
        if let Some(column) = resource.date_column {
            if let Some(start) = query.start_date {
                sql.push_str(&format!(" AND {column} >= ?"));
                values.push(date_text(start));
            }
            if let Some(end) = query.end_date {
                sql.push_str(&format!(" AND {column} <= ?"));
                values.push(date_text(end));
            }
            sql.push_str(&format!(" ORDER BY {column} DESC, id DESC"));
        } else {
            sql.push_str(" ORDER BY id");
        }

        sql.push_str(" LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(
            query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        ));
        values.push(SqlValue::Integer(query.offset.unwrap_or(0).max(0)));

        let rows = bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Self::row_to_json(resource, row))
            .collect()
    }

    /// Fetch one row. Rows of other airports are reported as missing.
    pub async fn get_record(
        &self,
        resource: &Resource,
        id: i64,
        airport_id: Option<i64>,
    ) -> Result<Value> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            Self::select_columns(resource),
            resource.table
        );
        let mut values = vec![SqlValue::Integer(id)];
        if let (true, Some(airport)) = (resource.airport_scoped, airport_id) {
            sql.push_str(" AND airport_id = ?");
            values.push(SqlValue::Integer(airport));
        }

        let row = bind_values(sqlx::query(&sql), &values)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {id}", resource.label)))?;

        Self::row_to_json(resource, &row)
    }

    /// Insert a row from a validated request body.
    ///
    /// `airport_id` is required for airport-scoped resources and ignored
    /// otherwise.
    pub async fn create_record(
        &self,
        resource: &'static Resource,
        body: &Map<String, Value>,
        airport_id: Option<i64>,
    ) -> Result<Value> {
        let extra = match (resource.airport_scoped, airport_id) {
            (true, Some(id)) => vec![("airport_id", SqlValue::Integer(id))],
            (true, None) => {
                return Err(AppError::Validation("field 'airport_id' is required".to_string()));
            }
            (false, _) => Vec::new(),
        };

        let stmt = build_insert(resource.table, resource.fields, body, &extra, Utc::now())?;
        let result = bind_values(sqlx::query(&stmt.sql), &stmt.values)
            .execute(&self.pool)
            .await
            .map_err(map_write_error)?;

        let id = result.last_insert_rowid();
        debug!(resource = resource.path, id, "Row inserted");
        self.get_record(resource, id, None).await
    }

    /// Apply a partial update. Zero affected rows means the row does not
    /// exist for this airport.
    pub async fn update_record(
        &self,
        resource: &'static Resource,
        id: i64,
        airport_id: Option<i64>,
        patch: &Map<String, Value>,
    ) -> Result<Value> {
        let key = RowKey {
            id,
            airport_id: airport_id.filter(|_| resource.airport_scoped),
        };
        let stmt = build_update(resource.table, resource.fields, patch, key, Utc::now())?;

        let result = bind_values(sqlx::query(&stmt.sql), &stmt.values)
            .execute(&self.pool)
            .await
            .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("{} {id}", resource.label)));
        }

        self.get_record(resource, id, key.airport_id).await
    }

    pub async fn delete_record(
        &self,
        resource: &Resource,
        id: i64,
        airport_id: Option<i64>,
    ) -> Result<()> {
        let mut sql = format!("DELETE FROM {} WHERE id = ?", resource.table);
        let mut values = vec![SqlValue::Integer(id)];
        if let (true, Some(airport)) = (resource.airport_scoped, airport_id) {
            sql.push_str(" AND airport_id = ?");
            values.push(SqlValue::Integer(airport));
        }

        let result = bind_values(sqlx::query(&sql), &values)
            .execute(&self.pool)
            .await
            .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("{} {id}", resource.label)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Airports and lookups
    // ------------------------------------------------------------------

    pub async fn list_airports(&self, only: Option<i64>) -> Result<Vec<Aeroporto>> {
        let airports = match only {
            Some(id) => {
                sqlx::query_as::<_, Aeroporto>(
                    "SELECT id, icao, nome, cidade, uf FROM dim_aeroporto WHERE id = ?",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Aeroporto>(
                    "SELECT id, icao, nome, cidade, uf FROM dim_aeroporto ORDER BY icao",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(airports)
    }

    pub async fn create_airport(&self, input: &AeroportoInput) -> Result<Aeroporto> {
        let icao = input.icao.trim().to_ascii_uppercase();
        if icao.len() != 4 || !icao.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::Validation(
                "field 'icao' must be a 4-character ICAO code".to_string(),
            ));
        }
        if input.nome.trim().is_empty() {
            return Err(AppError::Validation("field 'nome' is required".to_string()));
        }

        let now = timestamp_text(Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO dim_aeroporto (icao, nome, cidade, uf, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&icao)
        .bind(input.nome.trim())
        .bind(&input.cidade)
        .bind(&input.uf)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(Aeroporto {
            id: result.last_insert_rowid(),
            icao,
            nome: input.nome.trim().to_string(),
            cidade: input.cidade.clone(),
            uf: input.uf.clone(),
        })
    }

    /// Read a lookup table. `table` must come from the lookup allow-list.
    pub async fn list_lookup(&self, table: &'static str) -> Result<Vec<LookupEntry>> {
        let sql = format!("SELECT id, codigo, nome FROM {table} ORDER BY id");
        Ok(sqlx::query_as::<_, LookupEntry>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    // ------------------------------------------------------------------
    // Strike cost allocations
    // ------------------------------------------------------------------

    async fn strike_exists(&self, colisao_id: i64, airport_id: Option<i64>) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM fact_colisao
            WHERE id = ? AND (? IS NULL OR airport_id = ?)
            "#,
        )
        .bind(colisao_id)
        .bind(airport_id)
        .bind(airport_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("n") > 0)
    }

    pub async fn list_cost_allocations(
        &self,
        colisao_id: i64,
        airport_id: Option<i64>,
    ) -> Result<Vec<CostAllocation>> {
        if !self.strike_exists(colisao_id, airport_id).await? {
            return Err(AppError::NotFound(format!("colisao {colisao_id}")));
        }

        Ok(sqlx::query_as::<_, CostAllocation>(
            r#"
            SELECT id, colisao_id, tipo, valor, descricao
            FROM fact_colisao_custo
            WHERE colisao_id = ?
            ORDER BY id
            "#,
        )
        .bind(colisao_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Replace every allocation of a strike in one transaction.
    ///
    /// The strike row is touched first, which takes the write lock and
    /// refreshes its `updated_at`; if it matches nothing the transaction is
    /// dropped and rolled back.
    pub async fn replace_cost_allocations(
        &self,
        colisao_id: i64,
        airport_id: Option<i64>,
        allocations: &[CostAllocationInput],
    ) -> Result<Vec<CostAllocation>> {
        if let Some(bad) = allocations
            .iter()
            .find(|a| !a.valor.is_finite() || a.valor < 0.0)
        {
            return Err(AppError::Validation(format!(
                "field 'valor' must be at least 0, got {}",
                bad.valor
            )));
        }

        let now = timestamp_text(Utc::now());
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE fact_colisao SET updated_at = ?
            WHERE id = ? AND (? IS NULL OR airport_id = ?)
            "#,
        )
        .bind(&now)
        .bind(colisao_id)
        .bind(airport_id)
        .bind(airport_id)
        .execute(&mut *tx)
        .await?;

        if touched.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("colisao {colisao_id}")));
        }

        sqlx::query("DELETE FROM fact_colisao_custo WHERE colisao_id = ?")
            .bind(colisao_id)
            .execute(&mut *tx)
            .await?;

        for allocation in allocations {
            sqlx::query(
                r#"
                INSERT INTO fact_colisao_custo (colisao_id, tipo, valor, descricao, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(colisao_id)
            .bind(allocation.tipo.as_str())
            .bind(allocation.valor)
            .bind(&allocation.descricao)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(colisao_id, count = allocations.len(), "Cost allocations replaced");

        self.list_cost_allocations(colisao_id, airport_id).await
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Fetch every strike in the period as one row per strike, joined with
    /// its lookups and pre-summed cost allocations.
    pub async fn fetch_strike_rows(&self, filter: &ReportFilter) -> Result<Vec<StrikeRow>> {
        let mut sql = String::from(
            r#"
            SELECT
                c.id AS id,
                c.airport_id AS airport_id,
                a.icao AS aeroporto,
                c.data AS data,
                c.hora AS hora,
                c.categoria AS categoria,
                c.tipo_incidente AS tipo_incidente,
                d.nome AS classe_dano,
                c.peso_severidade AS peso_severidade,
                c.custo_brl AS custo_brl,
                c.notas AS notas,
                e.nome_popular AS especie,
                l.nome AS local,
                COALESCE(ca.n, 0) AS n_alocacoes,
                CAST(COALESCE(ca.direto, 0) AS REAL) AS aloc_direto,
                CAST(COALESCE(ca.indireto, 0) AS REAL) AS aloc_indireto,
                CAST(COALESCE(ca.outros, 0) AS REAL) AS aloc_outros
            FROM fact_colisao c
            LEFT JOIN dim_aeroporto a ON a.id = c.airport_id
            LEFT JOIN lu_classe_dano d ON d.id = c.classe_dano_id
            LEFT JOIN dim_especie e ON e.id = c.especie_id
            LEFT JOIN dim_local l ON l.id = c.local_id
            LEFT JOIN (
                SELECT
                    colisao_id,
                    COUNT(*) AS n,
                    SUM(CASE WHEN tipo = 'direto' THEN valor ELSE 0 END) AS direto,
                    SUM(CASE WHEN tipo = 'indireto' THEN valor ELSE 0 END) AS indireto,
                    SUM(CASE WHEN tipo NOT IN ('direto', 'indireto') THEN valor ELSE 0 END) AS outros
                FROM fact_colisao_custo
                GROUP BY colisao_id
            ) ca ON ca.colisao_id = c.id
            WHERE c.data >= ? AND c.data <= ?
            "#,
        );
        let mut values = vec![date_text(filter.start_date), date_text(filter.end_date)];
        if let Some(airport_id) = filter.airport_id {
            sql.push_str(" AND c.airport_id = ?");
            values.push(SqlValue::Integer(airport_id));
        }
        sql.push_str(" ORDER BY c.data, c.id");

        let rows = bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(StrikeRow::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Event counts for the KPI endpoint.
    pub async fn kpi_counts(&self, filter: &ReportFilter) -> Result<KpiCounts> {
        let scope = if filter.airport_id.is_some() {
            " AND airport_id = ?"
        } else {
            ""
        };
        let period = format!("data >= ? AND data <= ?{scope}");

        let subqueries = [
            format!("(SELECT COUNT(*) FROM fact_colisao WHERE {period}) AS colisoes"),
            format!(
                "(SELECT COUNT(*) FROM fact_colisao c JOIN lu_classe_dano d ON d.id = c.classe_dano_id \
                 WHERE d.codigo <> 'N' AND {period}) AS colisoes_com_dano"
            ),
            format!(
                "(SELECT COALESCE(SUM(COALESCE(pousos, 0) + COALESCE(decolagens, 0)), 0) \
                 FROM fact_movimento WHERE {period}) AS movimentos"
            ),
            format!("(SELECT COUNT(*) FROM fact_avistamento WHERE {period}) AS avistamentos"),
            format!(
                "(SELECT COALESCE(SUM(COALESCE(quantidade, 1)), 0) FROM fact_avistamento \
                 WHERE {period}) AS individuos_avistados"
            ),
            format!("(SELECT COUNT(*) FROM fact_acao_controle WHERE {period}) AS acoes_controle"),
            format!("(SELECT COUNT(*) FROM fact_inspecao WHERE {period}) AS inspecoes"),
            format!("(SELECT COUNT(*) FROM fact_carcaca WHERE {period}) AS carcacas"),
            format!("(SELECT COUNT(*) FROM fact_treinamento WHERE {period}) AS treinamentos"),
        ];
        let sql = format!("SELECT {}", subqueries.join(",\n"));

        let mut values = Vec::new();
        for _ in 0..subqueries.len() {
            values.push(date_text(filter.start_date));
            values.push(date_text(filter.end_date));
            if let Some(airport_id) = filter.airport_id {
                values.push(SqlValue::Integer(airport_id));
            }
        }

        let row = bind_values(sqlx::query(&sql), &values)
            .fetch_one(&self.pool)
            .await?;

        Ok(KpiCounts::from_row(&row)?)
    }

    /// Species with the most strikes in the period.
    pub async fn top_struck_species(
        &self,
        filter: &ReportFilter,
        limit: i64,
    ) -> Result<Vec<EspecieContagem>> {
        let mut sql = String::from(
            r#"
            SELECT COALESCE(e.nome_popular, ?) AS especie, COUNT(*) AS colisoes
            FROM fact_colisao c
            LEFT JOIN dim_especie e ON e.id = c.especie_id
            WHERE c.data >= ? AND c.data <= ?
            "#,
        );
        let mut values = vec![
            SqlValue::Text(ESPECIE_NAO_IDENTIFICADA.to_string()),
            date_text(filter.start_date),
            date_text(filter.end_date),
        ];
        if let Some(airport_id) = filter.airport_id {
            sql.push_str(" AND c.airport_id = ?");
            values.push(SqlValue::Integer(airport_id));
        }
        sql.push_str(" GROUP BY especie ORDER BY colisoes DESC, especie ASC LIMIT ?");
        values.push(SqlValue::Integer(limit));

        let rows = bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(EspecieContagem::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::find_resource;
    use chrono::NaiveDate;

    pub(crate) async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    pub(crate) async fn add_airport(storage: &Storage, icao: &str) -> i64 {
        storage
            .create_airport(&AeroportoInput {
                icao: icao.to_string(),
                nome: format!("Aeroporto {icao}"),
                cidade: None,
                uf: None,
            })
            .await
            .unwrap()
            .id
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn colisoes() -> &'static Resource {
        find_resource("colisoes").unwrap()
    }

    #[tokio::test]
    async fn test_schema_is_idempotent_and_seeded() {
        let storage = setup_test_storage().await;
        storage.initialize_schema().await.unwrap();

        let danos = storage.list_lookup("lu_classe_dano").await.unwrap();
        assert_eq!(danos.len(), 5);
        assert_eq!(danos[0].nome, "Sem dano");
    }

    #[tokio::test]
    async fn test_create_and_get_record() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;

        let created = storage
            .create_record(
                find_resource("acoes-controle").unwrap(),
                &obj(json!({
                    "data": "2024-05-02",
                    "tipo_acao": "dispersao",
                    "metodos": ["pirotecnia", "laser"],
                    "quantidade_dispersada": 30
                })),
                Some(airport),
            )
            .await
            .unwrap();

        assert_eq!(created["airport_id"], airport);
        assert_eq!(created["metodos"], json!(["pirotecnia", "laser"]));
        assert_eq!(created["quantidade_dispersada"], 30);
        assert!(created["observacoes"].is_null());

        let id = created["id"].as_i64().unwrap();
        let fetched = storage
            .get_record(find_resource("acoes-controle").unwrap(), id, Some(airport))
            .await
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_rows_of_other_airports_are_not_found() {
        let storage = setup_test_storage().await;
        let a = add_airport(&storage, "SBGR").await;
        let b = add_airport(&storage, "SBSP").await;

        let created = storage
            .create_record(colisoes(), &obj(json!({ "data": "2024-01-01" })), Some(a))
            .await
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        let err = storage.get_record(colisoes(), id, Some(b)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = storage.delete_record(colisoes(), id, Some(b)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let listed = storage
            .list_records(colisoes(), Some(b), &ListQuery::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_update_record() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        let created = storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-01-01", "notas": "inicial" })),
                Some(airport),
            )
            .await
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        let updated = storage
            .update_record(
                colisoes(),
                id,
                Some(airport),
                &obj(json!({ "peso_severidade": 3, "notas": null })),
            )
            .await
            .unwrap();

        assert_eq!(updated["peso_severidade"], 3.0);
        assert!(updated["notas"].is_null());
        assert_eq!(updated["data"], "2024-01-01");
    }

    #[tokio::test]
    async fn test_empty_update_writes_nothing() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        let created = storage
            .create_record(colisoes(), &obj(json!({ "data": "2024-01-01" })), Some(airport))
            .await
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        let err = storage
            .update_record(colisoes(), id, Some(airport), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg == "no fields to update"));

        let after = storage.get_record(colisoes(), id, None).await.unwrap();
        assert_eq!(after["updated_at"], created["updated_at"]);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let storage = setup_test_storage().await;
        let err = storage
            .update_record(colisoes(), 404, None, &obj(json!({ "notas": "x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_validation_error() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        let err = storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-01-01", "especie_id": 999 })),
                Some(airport),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_filters_by_date() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        for data in ["2024-01-10", "2024-02-10", "2024-03-10"] {
            storage
                .create_record(colisoes(), &obj(json!({ "data": data })), Some(airport))
                .await
                .unwrap();
        }

        let query = ListQuery {
            start_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 10),
            ..Default::default()
        };
        let rows = storage
            .list_records(colisoes(), Some(airport), &query)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["data"], "2024-03-10");
    }

    #[tokio::test]
    async fn test_replace_cost_allocations() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        let created = storage
            .create_record(colisoes(), &obj(json!({ "data": "2024-01-01" })), Some(airport))
            .await
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        let inputs: Vec<CostAllocationInput> = serde_json::from_value(json!([
            { "tipo": "direto", "valor": 500.0 },
            { "tipo": "indireto", "valor": 120.5, "descricao": "atraso" }
        ]))
        .unwrap();
        let stored = storage
            .replace_cost_allocations(id, Some(airport), &inputs)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);

        let inputs: Vec<CostAllocationInput> =
            serde_json::from_value(json!([{ "tipo": "seguro", "valor": 10.0 }])).unwrap();
        let stored = storage
            .replace_cost_allocations(id, Some(airport), &inputs)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].tipo, "outros");
    }

    #[tokio::test]
    async fn test_replace_cost_allocations_missing_strike_rolls_back() {
        let storage = setup_test_storage().await;
        let inputs: Vec<CostAllocationInput> =
            serde_json::from_value(json!([{ "tipo": "direto", "valor": 1.0 }])).unwrap();

        let err = storage
            .replace_cost_allocations(77, None, &inputs)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let row = sqlx::query("SELECT COUNT(*) AS n FROM fact_colisao_custo")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 0);
    }

    #[tokio::test]
    async fn test_negative_allocation_rejected() {
        let storage = setup_test_storage().await;
        let inputs: Vec<CostAllocationInput> =
            serde_json::from_value(json!([{ "tipo": "direto", "valor": -1.0 }])).unwrap();
        let err = storage
            .replace_cost_allocations(1, None, &inputs)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fetch_strike_rows_sums_allocations() {
        let storage = setup_test_storage().await;
        let airport = add_airport(&storage, "SBGR").await;
        let with_alloc = storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-04-01", "custo_brl": 999.0, "classe_dano_id": 2 })),
                Some(airport),
            )
            .await
            .unwrap();
        storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-04-02", "custo_brl": 1000.0 })),
                Some(airport),
            )
            .await
            .unwrap();

        let inputs: Vec<CostAllocationInput> = serde_json::from_value(json!([
            { "tipo": "direto", "valor": 200.0 },
            { "tipo": "direto", "valor": 50.0 },
            { "tipo": "outros", "valor": 5.0 }
        ]))
        .unwrap();
        storage
            .replace_cost_allocations(with_alloc["id"].as_i64().unwrap(), None, &inputs)
            .await
            .unwrap();

        let filter = ReportFilter {
            airport_id: Some(airport),
            start_date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
        };
        let rows = storage.fetch_strike_rows(&filter).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].n_alocacoes, 3);
        assert_eq!(rows[0].aloc_direto, 250.0);
        assert_eq!(rows[0].aloc_outros, 5.0);
        assert_eq!(rows[0].classe_dano.as_deref(), Some("Menor"));
        assert_eq!(rows[0].aeroporto.as_deref(), Some("SBGR"));
        assert_eq!(rows[1].n_alocacoes, 0);
        assert_eq!(rows[1].aloc_direto, 0.0);
        assert_eq!(rows[1].custo_brl, Some(1000.0));
    }

    #[tokio::test]
    async fn test_kpi_counts_respect_airport_and_period() {
        let storage = setup_test_storage().await;
        let a = add_airport(&storage, "SBGR").await;
        let b = add_airport(&storage, "SBSP").await;

        let movimentos = find_resource("movimentos").unwrap();
        storage
            .create_record(
                movimentos,
                &obj(json!({ "data": "2024-06-01", "pousos": 100, "decolagens": 95 })),
                Some(a),
            )
            .await
            .unwrap();
        storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-06-01", "classe_dano_id": 4 })),
                Some(a),
            )
            .await
            .unwrap();
        storage
            .create_record(
                colisoes(),
                &obj(json!({ "data": "2024-06-02", "classe_dano_id": 1 })),
                Some(a),
            )
            .await
            .unwrap();
        storage
            .create_record(colisoes(), &obj(json!({ "data": "2024-06-02" })), Some(b))
            .await
            .unwrap();
        storage
            .create_record(colisoes(), &obj(json!({ "data": "2023-06-02" })), Some(a))
            .await
            .unwrap();

        let filter = ReportFilter {
            airport_id: Some(a),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        };
        let counts = storage.kpi_counts(&filter).await.unwrap();

        assert_eq!(counts.colisoes, 2);
        assert_eq!(counts.colisoes_com_dano, 1);
        assert_eq!(counts.movimentos, 195);
        assert_eq!(counts.avistamentos, 0);

        let all = storage
            .kpi_counts(&ReportFilter {
                airport_id: None,
                ..filter
            })
            .await
            .unwrap();
        assert_eq!(all.colisoes, 3);
    }
}
