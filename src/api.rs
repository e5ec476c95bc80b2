//! HTTP API handlers.
//!
//! Every route except `/health` requires a bearer token (see [`AuthUser`]).
//! Non-admin callers only ever see and write rows of their own airport;
//! handlers resolve that through [`AuthUser::scope`] before touching storage.
//!
//! The generic record routes are registered once per entry of
//! [`RESOURCES`]; the matching [`Resource`] reaches the handler as an
//! [`Extension`].

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::aggregation::{compute_kpis, financial_dataset};
use crate::auth::{AuthKeys, AuthUser, Role};
use crate::error::{AppError, Result};
use crate::inspection::{Inspecao, InspecaoQuery, NovaInspecao};
use crate::model::{
    Aeroporto, AeroportoInput, CostAllocation, CostAllocationInput, FinancialDataset,
    KpiResponse, ListQuery, LookupEntry, PeriodQuery, ReportFilter,
};
use crate::patch::{PatchError, as_object};
use crate::resources::{RESOURCES, Resource, find_lookup, find_resource};
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub auth: Arc<AuthKeys>,
}

impl AppState {
    pub fn new(storage: Storage, jwt_secret: &str) -> Self {
        Self {
            storage,
            auth: Arc::new(AuthKeys::from_secret(jwt_secret)),
        }
    }
}

/// Build the full router: `/health` plus everything under `/api`.
pub fn build_router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/aeroportos", get(list_airports).post(create_airport))
        .route("/lookups/:nome", get(list_lookup))
        .route("/colisoes/:id/custos", get(get_costs).put(put_costs))
        .route("/inspecoes", get(list_inspections).post(create_inspection))
        .route(
            "/inspecoes/:id",
            get(get_inspection)
                .put(update_inspection)
                .delete(delete_inspection),
        )
        .route("/kpis", get(get_kpis))
        .route("/relatorios/financeiro", get(get_financeiro));

    for resource in RESOURCES {
        api = api
            .route(
                &format!("/{}", resource.path),
                get(list_records)
                    .post(create_record)
                    .layer(Extension(resource)),
            )
            .route(
                &format!("/{}/:id", resource.path),
                get(get_record)
                    .put(update_record)
                    .delete(delete_record)
                    .layer(Extension(resource)),
            );
    }

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Deserialize a JSON body, reporting shape errors as 400.
fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| AppError::Validation(e.to_string()))
}

/// Split a body into its `airport_id` (if any) and the remaining fields.
fn take_airport_id(body: &Value) -> Result<(Option<i64>, Map<String, Value>)> {
    let mut fields = as_object(body)?.clone();
    let airport_id = match fields.remove("airport_id") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or(PatchError::InvalidValue {
            field: "airport_id",
            reason: "must be an integer".to_string(),
        })?),
    };
    Ok((airport_id, fields))
}

fn report_filter(user: &AuthUser, query: &PeriodQuery) -> Result<ReportFilter> {
    if query.start_date > query.end_date {
        return Err(AppError::Validation(
            "startDate must not be after endDate".to_string(),
        ));
    }
    Ok(ReportFilter {
        airport_id: user.scope(query.airport_id)?,
        start_date: query.start_date,
        end_date: query.end_date,
    })
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Generic records
// ============================================================================

/// GET /api/<resource>
#[instrument(skip(state, user, resource), fields(resource = resource.path))]
pub async fn list_records(
    State(state): State<AppState>,
    Extension(resource): Extension<&'static Resource>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Value>>> {
    let airport_id = user.scope(query.airport_id)?;

    let rows = state
        .storage
        .list_records(resource, airport_id, &query)
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to list records"))?;

    info!(count = rows.len(), ?airport_id, "Records listed");
    Ok(Json(rows))
}

/// GET /api/<resource>/:id
#[instrument(skip(state, user, resource), fields(resource = resource.path))]
pub async fn get_record(
    State(state): State<AppState>,
    Extension(resource): Extension<&'static Resource>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let airport_id = user.scope(None)?;
    let row = state.storage.get_record(resource, id, airport_id).await?;
    Ok(Json(row))
}

/// POST /api/<resource>
///
/// The row's airport comes from the caller's token; admins name it with
/// `airport_id` in the body.
#[instrument(skip(state, user, resource, body), fields(resource = resource.path))]
pub async fn create_record(
    State(state): State<AppState>,
    Extension(resource): Extension<&'static Resource>,
    user: AuthUser,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    user.require(resource.write_role)?;
    let (requested, fields) = take_airport_id(&body)?;
    let airport_id = user.scope(requested)?;

    let row = state
        .storage
        .create_record(resource, &fields, airport_id)
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to create record"))?;

    info!(id = %row["id"], ?airport_id, "Record created");
    Ok((StatusCode::CREATED, Json(row)))
}

/// PUT /api/<resource>/:id
///
/// Partial update: only keys present in the body are written. An empty
/// body is rejected before any statement runs.
#[instrument(skip(state, user, resource, body), fields(resource = resource.path))]
pub async fn update_record(
    State(state): State<AppState>,
    Extension(resource): Extension<&'static Resource>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    user.require(resource.write_role)?;
    let airport_id = user.scope(None)?;

    let row = state
        .storage
        .update_record(resource, id, airport_id, as_object(&body)?)
        .await
        .inspect_err(|e| warn!(id, error = %e, "Failed to update record"))?;

    info!(id, "Record updated");
    Ok(Json(row))
}

/// DELETE /api/<resource>/:id
#[instrument(skip(state, user, resource), fields(resource = resource.path))]
pub async fn delete_record(
    State(state): State<AppState>,
    Extension(resource): Extension<&'static Resource>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    user.require(resource.delete_role)?;
    let airport_id = user.scope(None)?;

    state
        .storage
        .delete_record(resource, id, airport_id)
        .await
        .inspect_err(|e| warn!(id, error = %e, "Failed to delete record"))?;

    info!(id, "Record deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Strike costs
// ============================================================================

/// GET /api/colisoes/:id/custos
#[instrument(skip(state, user))]
pub async fn get_costs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<CostAllocation>>> {
    let airport_id = user.scope(None)?;
    let allocations = state.storage.list_cost_allocations(id, airport_id).await?;
    Ok(Json(allocations))
}

/// PUT /api/colisoes/:id/custos - Replace every allocation of a strike.
#[instrument(skip(state, user, body))]
pub async fn put_costs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<CostAllocation>>> {
    let colisoes = find_resource("colisoes")
        .ok_or_else(|| AppError::Internal("colisoes resource missing".to_string()))?;
    user.require(colisoes.write_role)?;
    let airport_id = user.scope(None)?;
    let allocations: Vec<CostAllocationInput> = parse_body(body)?;

    let saved = state
        .storage
        .replace_cost_allocations(id, airport_id, &allocations)
        .await
        .inspect_err(|e| warn!(id, error = %e, "Failed to replace cost allocations"))?;

    info!(id, count = saved.len(), "Cost allocations replaced");
    Ok(Json(saved))
}

// ============================================================================
// Inspections
// ============================================================================

/// GET /api/inspecoes
#[instrument(skip(state, user))]
pub async fn list_inspections(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<InspecaoQuery>,
) -> Result<Json<Vec<Inspecao>>> {
    let airport_id = user.scope(query.airport_id)?;
    let inspections = state.storage.list_inspections(airport_id, &query).await?;
    info!(count = inspections.len(), "Inspections listed");
    Ok(Json(inspections))
}

/// GET /api/inspecoes/:id
#[instrument(skip(state, user))]
pub async fn get_inspection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Inspecao>> {
    let airport_id = user.scope(None)?;
    Ok(Json(state.storage.get_inspection(id, airport_id).await?))
}

/// POST /api/inspecoes
#[instrument(skip(state, user, body))]
pub async fn create_inspection(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Inspecao>)> {
    user.require(Role::Operador)?;
    let input: NovaInspecao = parse_body(body)?;
    let airport_id = user.scope(input.airport_id)?.ok_or_else(|| {
        AppError::Validation("field 'airport_id' is required".to_string())
    })?;

    let inspection = state
        .storage
        .create_inspection(&input, airport_id)
        .await
        .inspect_err(|e| warn!(airport_id, error = %e, "Failed to create inspection"))?;

    info!(
        id = inspection.id,
        airport_id,
        tipo = inspection.tipo.as_str(),
        itens = inspection.itens.len(),
        "Inspection created"
    );
    Ok((StatusCode::CREATED, Json(inspection)))
}

/// PUT /api/inspecoes/:id
///
/// Parent fields are patched; `itens`, when present, replaces the whole
/// checklist. Both happen in one transaction.
#[instrument(skip(state, user, body))]
pub async fn update_inspection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Inspecao>> {
    user.require(Role::Operador)?;
    let airport_id = user.scope(None)?;

    let inspection = state
        .storage
        .update_inspection(id, airport_id, as_object(&body)?)
        .await
        .inspect_err(|e| warn!(id, error = %e, "Failed to update inspection"))?;

    info!(id, "Inspection updated");
    Ok(Json(inspection))
}

/// DELETE /api/inspecoes/:id
#[instrument(skip(state, user))]
pub async fn delete_inspection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    user.require(Role::Gestor)?;
    let airport_id = user.scope(None)?;

    state
        .storage
        .delete_inspection(id, airport_id)
        .await
        .inspect_err(|e| warn!(id, error = %e, "Failed to delete inspection"))?;

    info!(id, "Inspection deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Airports and lookups
// ============================================================================

/// GET /api/aeroportos - All airports for admins, the caller's own otherwise.
#[instrument(skip(state, user))]
pub async fn list_airports(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Aeroporto>>> {
    let only = user.scope(None)?;
    Ok(Json(state.storage.list_airports(only).await?))
}

/// POST /api/aeroportos
#[instrument(skip(state, user, body))]
pub async fn create_airport(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Aeroporto>)> {
    user.require(Role::Admin)?;
    let input: AeroportoInput = parse_body(body)?;

    let airport = state
        .storage
        .create_airport(&input)
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to create airport"))?;

    info!(id = airport.id, icao = %airport.icao, "Airport created");
    Ok((StatusCode::CREATED, Json(airport)))
}

/// GET /api/lookups/:nome
#[instrument(skip(state, _user))]
pub async fn list_lookup(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(nome): Path<String>,
) -> Result<Json<Vec<LookupEntry>>> {
    let table = find_lookup(&nome).ok_or_else(|| AppError::NotFound(format!("lookup {nome}")))?;
    Ok(Json(state.storage.list_lookup(table).await?))
}

// ============================================================================
// Reports
// ============================================================================

/// GET /api/kpis?airportId=&startDate=&endDate=
#[instrument(skip(state, user))]
pub async fn get_kpis(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<KpiResponse>> {
    let filter = report_filter(&user, &query)?;

    let kpis = compute_kpis(&state.storage, &filter)
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to compute KPIs"))?;

    info!(
        airport_id = ?filter.airport_id,
        colisoes = kpis.colisoes,
        taxa = kpis.taxa_colisao_10k,
        "KPIs queried"
    );
    Ok(Json(kpis))
}

/// GET /api/relatorios/financeiro?airportId=&startDate=&endDate=
///
/// # Response
///
/// ```json
/// {
///     "resumo": [{ "ano": 2024, "categoria": "Ave", "custo_total": 1000.0, ... }],
///     "agrupamentos": { "porTipo": [], "porCategoria": [], "porDano": [], "porSeveridade": [] },
///     "incidentes": [{ "id": 1, "data": "2024-03-15", "descricao": "15/03/2024: ...", ... }],
///     "totais": { "eventos": 1, "custo_direto": 1000.0, "custo_total": 1000.0, ... }
/// }
/// ```
#[instrument(skip(state, user))]
pub async fn get_financeiro(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<FinancialDataset>> {
    let filter = report_filter(&user, &query)?;

    let dataset = financial_dataset(&state.storage, &filter)
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to build financial dataset"))?;

    info!(
        airport_id = ?filter.airport_id,
        eventos = dataset.totais.eventos,
        custo_total = dataset.totais.custo_total,
        "Financial dataset built"
    );
    Ok(Json(dataset))
}
