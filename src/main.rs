//! FaunaGuard server.
//!
//! # API Endpoints
//!
//! - `GET /health` - Health check (no token)
//! - `GET|POST /api/<resource>` and `GET|PUT|DELETE /api/<resource>/:id` for
//!   `colisoes`, `avistamentos`, `movimentos`, `acoes-controle`, `carcacas`,
//!   `treinamentos`, `locais` and `especies`
//! - `GET|PUT /api/colisoes/:id/custos` - Strike cost allocations
//! - `GET|POST /api/inspecoes`, `GET|PUT|DELETE /api/inspecoes/:id`
//! - `GET|POST /api/aeroportos`, `GET /api/lookups/:nome`
//! - `GET /api/kpis`, `GET /api/relatorios/financeiro`

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use faunaguard::api::{AppState, build_router};
use faunaguard::config::Config;
use faunaguard::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("faunaguard=info".parse()?))
        .init();

    let config = Config::from_env()?;

    info!(
        port = config.port,
        max_connections = config.max_connections,
        "Starting FaunaGuard server"
    );

    let storage = Storage::connect(&config.database_url, config.max_connections).await?;
    info!("Database initialized");

    let app = build_router(AppState::new(storage, &config.jwt_secret));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "FaunaGuard is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
