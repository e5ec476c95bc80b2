//! Integration tests for the FaunaGuard API.
//!
//! These tests verify the full request/response cycle through the HTTP API,
//! with bearer tokens minted against the same secret the server verifies.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode, header::AUTHORIZATION};
use axum_test::TestServer;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use faunaguard::api::{AppState, build_router};
use faunaguard::auth::{Claims, Role};
use faunaguard::model::AeroportoInput;
use faunaguard::storage::Storage;

const SECRET: &str = "integration-secret";

struct Harness {
    server: TestServer,
    airport: i64,
    other_airport: i64,
}

async fn create_test_storage() -> (Storage, i64, i64) {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let mut ids = Vec::new();
    for icao in ["SBGR", "SBSP"] {
        let airport = storage
            .create_airport(&AeroportoInput {
                icao: icao.to_string(),
                nome: format!("Aeroporto {icao}"),
                cidade: None,
                uf: None,
            })
            .await
            .unwrap();
        ids.push(airport.id);
    }
    (storage, ids[0], ids[1])
}

async fn create_test_server() -> Harness {
    let (storage, airport, other_airport) = create_test_storage().await;
    let app = build_router(AppState::new(storage, SECRET));

    Harness {
        server: TestServer::new(app).unwrap(),
        airport,
        other_airport,
    }
}

fn token(role: Role, airport_id: Option<i64>) -> String {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
    let claims = Claims {
        sub: format!("{role:?}").to_lowercase(),
        role,
        airport_id,
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = create_test_server().await;

    h.server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let h = create_test_server().await;

    let response = h.server.get("/api/colisoes").await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = h
        .server
        .get("/api/colisoes")
        .add_header(AUTHORIZATION, HeaderValue::from_static("Bearer not-a-jwt"))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_list_update_delete_strike() {
    let h = create_test_server().await;
    let operador = bearer(&token(Role::Operador, Some(h.airport)));
    let gestor = bearer(&token(Role::Gestor, Some(h.airport)));

    let response = h
        .server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, operador.clone())
        .json(&json!({
            "data": "2024-03-15",
            "hora": "14:30",
            "categoria": "Ave",
            "custo_brl": 1500.0,
            "peso_severidade": 2
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: Value = response.json();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["airport_id"], h.airport);
    assert_eq!(created["hora"], "14:30:00");

    let response = h
        .server
        .get("/api/colisoes?startDate=2024-01-01&endDate=2024-12-31")
        .add_header(AUTHORIZATION, operador.clone())
        .await;
    response.assert_status_ok();
    let rows: Vec<Value> = response.json();
    assert_eq!(rows.len(), 1);

    let response = h
        .server
        .put(&format!("/api/colisoes/{id}"))
        .add_header(AUTHORIZATION, operador.clone())
        .json(&json!({ "notas": "Motor inspecionado" }))
        .await;
    response.assert_status_ok();
    let updated: Value = response.json();
    assert_eq!(updated["notas"], "Motor inspecionado");
    assert_eq!(updated["categoria"], "Ave");

    // Operators cannot delete.
    h.server
        .delete(&format!("/api/colisoes/{id}"))
        .add_header(AUTHORIZATION, operador)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    h.server
        .delete(&format!("/api/colisoes/{id}"))
        .add_header(AUTHORIZATION, gestor.clone())
        .await
        .assert_status(StatusCode::NO_CONTENT);

    h.server
        .get(&format!("/api/colisoes/{id}"))
        .add_header(AUTHORIZATION, gestor)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_update_is_rejected_without_writing() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    let created: Value = h
        .server
        .post("/api/avistamentos")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-05-02", "quantidade": 12 }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    let response = h
        .server
        .put(&format!("/api/avistamentos/{id}"))
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "no fields to update");

    let after: Value = h
        .server
        .get(&format!("/api/avistamentos/{id}"))
        .add_header(AUTHORIZATION, auth)
        .await
        .json();
    assert_eq!(after["updated_at"], created["updated_at"]);
}

#[tokio::test]
async fn test_unknown_and_invalid_fields_are_rejected() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    let response = h
        .server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-03-15", "piloto": "x" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = h
        .server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "15/03/2024" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = h
        .server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth)
        .json(&json!({ "data": "2024-03-15", "especie_id": 999 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cross_airport_access_is_forbidden() {
    let h = create_test_server().await;
    let mine = bearer(&token(Role::Gestor, Some(h.airport)));
    let theirs = bearer(&token(Role::Gestor, Some(h.other_airport)));

    h.server
        .get(&format!("/api/movimentos?airportId={}", h.other_airport))
        .add_header(AUTHORIZATION, mine.clone())
        .await
        .assert_status(StatusCode::FORBIDDEN);

    h.server
        .post("/api/movimentos")
        .add_header(AUTHORIZATION, mine.clone())
        .json(&json!({ "airport_id": h.other_airport, "data": "2024-01-01", "pousos": 3 }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let created: Value = h
        .server
        .post("/api/movimentos")
        .add_header(AUTHORIZATION, mine)
        .json(&json!({ "data": "2024-01-01", "pousos": 3 }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    // Another airport's row looks missing.
    h.server
        .put(&format!("/api/movimentos/{id}"))
        .add_header(AUTHORIZATION, theirs.clone())
        .json(&json!({ "pousos": 4 }))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    h.server
        .delete(&format!("/api/movimentos/{id}"))
        .add_header(AUTHORIZATION, theirs)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_must_name_airport() {
    let h = create_test_server().await;
    let admin = bearer(&token(Role::Admin, None));

    h.server
        .post("/api/carcacas")
        .add_header(AUTHORIZATION, admin.clone())
        .json(&json!({ "data": "2024-02-10" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let response = h
        .server
        .post("/api/carcacas")
        .add_header(AUTHORIZATION, admin.clone())
        .json(&json!({ "airport_id": h.other_airport, "data": "2024-02-10", "quantidade": 1 }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["airport_id"], h.other_airport);

    let airports: Vec<Value> = h
        .server
        .get("/api/aeroportos")
        .add_header(AUTHORIZATION, admin)
        .await
        .json();
    assert_eq!(airports.len(), 2);
}

#[tokio::test]
async fn test_airport_creation_is_admin_only() {
    let h = create_test_server().await;

    h.server
        .post("/api/aeroportos")
        .add_header(AUTHORIZATION, bearer(&token(Role::Gestor, Some(h.airport))))
        .json(&json!({ "icao": "SBKP", "nome": "Viracopos" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let response = h
        .server
        .post("/api/aeroportos")
        .add_header(AUTHORIZATION, bearer(&token(Role::Admin, None)))
        .json(&json!({ "icao": "sbkp", "nome": "Viracopos" }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["icao"], "SBKP");
}

#[tokio::test]
async fn test_lookups() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Leitor, Some(h.airport)));

    let response = h
        .server
        .get("/api/lookups/classe-dano")
        .add_header(AUTHORIZATION, auth.clone())
        .await;
    response.assert_status_ok();
    let entries: Vec<Value> = response.json();
    assert_eq!(entries[0]["nome"], "Sem dano");

    h.server
        .get("/api/lookups/usuarios")
        .add_header(AUTHORIZATION, auth)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_financial_dataset_single_strike() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    h.server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-06-01", "custo_brl": 1000, "peso_severidade": 3 }))
        .await
        .assert_status(StatusCode::CREATED);

    let response = h
        .server
        .get("/api/relatorios/financeiro?startDate=2024-01-01&endDate=2024-12-31")
        .add_header(AUTHORIZATION, auth)
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["totais"]["eventos"], 1);
    assert_eq!(body["totais"]["custo_total"], 1000.0);
    let severidade = body["agrupamentos"]["porSeveridade"].as_array().unwrap();
    assert_eq!(severidade.len(), 1);
    assert_eq!(severidade[0]["chave"], "Alta");
    assert_eq!(severidade[0]["percentual_eventos"], 100.0);
    assert!(
        body["incidentes"][0]["descricao"]
            .as_str()
            .unwrap()
            .contains("R$ 1.000,00")
    );
}

#[tokio::test]
async fn test_financial_dataset_uses_allocations() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    let created: Value = h
        .server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-06-01", "custo_brl": 1000 }))
        .await
        .json();
    let id = created["id"].as_i64().unwrap();

    let response = h
        .server
        .put(&format!("/api/colisoes/{id}/custos"))
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!([
            { "tipo": "direto", "valor": 300.0 },
            { "tipo": "indireto", "valor": 120.5, "descricao": "Atraso" }
        ]))
        .await;
    response.assert_status_ok();
    let saved: Vec<Value> = response.json();
    assert_eq!(saved.len(), 2);

    let body: Value = h
        .server
        .get("/api/relatorios/financeiro?startDate=2024-01-01&endDate=2024-12-31")
        .add_header(AUTHORIZATION, auth)
        .await
        .json();
    assert_eq!(body["totais"]["custo_direto"], 300.0);
    assert_eq!(body["totais"]["custo_indireto"], 120.5);
    assert_eq!(body["totais"]["custo_total"], 420.5);
}

#[tokio::test]
async fn test_financial_dataset_rejects_inverted_range() {
    let h = create_test_server().await;

    h.server
        .get("/api/relatorios/financeiro?startDate=2024-12-31&endDate=2024-01-01")
        .add_header(AUTHORIZATION, bearer(&token(Role::Leitor, Some(h.airport))))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_kpis() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    h.server
        .post("/api/movimentos")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-06-01", "pousos": 5000, "decolagens": 5000 }))
        .await
        .assert_status(StatusCode::CREATED);
    h.server
        .post("/api/colisoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({ "data": "2024-06-01" }))
        .await
        .assert_status(StatusCode::CREATED);

    let body: Value = h
        .server
        .get("/api/kpis?startDate=2024-01-01&endDate=2024-12-31")
        .add_header(AUTHORIZATION, auth)
        .await
        .json();
    assert_eq!(body["colisoes"], 1);
    assert_eq!(body["movimentos"], 10000);
    assert_eq!(body["taxa_colisao_10k"], 1.0);
}

#[tokio::test]
async fn test_inspection_workflow() {
    let h = create_test_server().await;
    let auth = bearer(&token(Role::Operador, Some(h.airport)));

    let response = h
        .server
        .post("/api/inspecoes")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({
            "tipo": "cerca",
            "data": "2024-07-01",
            "itens": [
                { "descricao": "Tela integra", "conforme": false, "observacao": "rompida no km 2" }
            ],
            "secoes": [
                { "tipo": "ocorrencia_cerca", "trecho": "km 2", "descricao": "buraco", "reparo_necessario": true }
            ]
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: Value = response.json();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["itens"].as_array().unwrap().len(), 1);
    assert_eq!(created["secoes"][0]["tipo"], "ocorrencia_cerca");

    h.server
        .put(&format!("/api/inspecoes/{id}"))
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let response = h
        .server
        .put(&format!("/api/inspecoes/{id}"))
        .add_header(AUTHORIZATION, auth.clone())
        .json(&json!({
            "itens": [
                { "descricao": "Tela integra", "conforme": true },
                { "descricao": "Portao trancado", "conforme": true }
            ]
        }))
        .await;
    response.assert_status_ok();
    let updated: Value = response.json();
    assert_eq!(updated["itens"].as_array().unwrap().len(), 2);
    assert_eq!(updated["itens"][0]["conforme"], true);

    let listed: Vec<Value> = h
        .server
        .get("/api/inspecoes?tipo=cerca")
        .add_header(AUTHORIZATION, auth.clone())
        .await
        .json();
    assert_eq!(listed.len(), 1);

    h.server
        .delete(&format!("/api/inspecoes/{id}"))
        .add_header(AUTHORIZATION, bearer(&token(Role::Gestor, Some(h.airport))))
        .await
        .assert_status(StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_inspection_rejects_unknown_section() {
    let h = create_test_server().await;

    h.server
        .post("/api/inspecoes")
        .add_header(AUTHORIZATION, bearer(&token(Role::Operador, Some(h.airport))))
        .json(&json!({
            "tipo": "focos",
            "data": "2024-07-01",
            "secoes": [{ "tipo": "foco_lixo", "local": "Patio" }]
        }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_router_oneshot_health() {
    let (storage, _, _) = create_test_storage().await;
    let app = build_router(AppState::new(storage, SECRET));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
