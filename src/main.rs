// Rodalies departures API server
// Serves next departures for Rodalies de Catalunya stops from the static Renfe GTFS feed

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod rodalies;

use config::Config;
use rodalies::departures::service_time_of;
use rodalies::{Rodalies, RodaliesError};

/// Upper bound for the `limit` query parameter.
const MAX_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    rodalies: Arc<Rodalies>,
    config: Arc<Config>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    reason: Option<&'static str>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            reason: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    fn error(e: &RodaliesError) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(e.to_string()),
            reason: Some(e.reason()),
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeparturesQuery {
    at: Option<String>,
    limit: Option<usize>,
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_departures(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<DeparturesQuery>,
) -> HttpResponse {
    let stop_id = path.into_inner();
    let query = query.into_inner();

    let reference_time = query
        .at
        .unwrap_or_else(|| service_time_of(&Utc::now().with_timezone(&state.config.timezone)));
    let limit = query.limit.unwrap_or(state.config.default_limit).min(MAX_LIMIT);

    match state
        .rodalies
        .next_departures(&stop_id, &reference_time, limit)
        .await
    {
        Ok(result) => {
            info!(
                "🚆 Departures for {} ({}) after {}: {}",
                stop_id,
                result.stop_name.as_deref().unwrap_or("unknown stop"),
                reference_time,
                result.departures.len()
            );
            HttpResponse::Ok().json(ApiResponse::success(result))
        }
        Err(e @ RodaliesError::InvalidTime(_)) => {
            warn!("⚠️  Rejected departures query for {}: {}", stop_id, e);
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(&e))
        }
        Err(e) => {
            error!("❌ Departures for {} unavailable: {}", stop_id, e);
            HttpResponse::ServiceUnavailable().json(ApiResponse::<()>::error(&e))
        }
    }
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    info!("🔄 Manual refresh requested...");

    match state.rodalies.refresh().await {
        Ok(snapshot) => {
            info!("✓ Manual refresh completed (generation {})", snapshot.generation);
            HttpResponse::Ok().json(ApiResponse::success(state.rodalies.status()))
        }
        Err(e) => {
            warn!("⚠️  Manual refresh failed: {}", e);
            HttpResponse::BadGateway().json(ApiResponse::<()>::error(&e))
        }
    }
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.rodalies.status()))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Rodalies departures API",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp(),
    }))
}

fn rodalies_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/rodalies")
            .route("/status", web::get().to(get_status))
            .route("/refresh", web::post().to(force_refresh))
            .route("/{stop_id}", web::get().to(get_departures)),
    );
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: Config, rodalies: Arc<Rodalies>) -> std::io::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let app_state = AppState {
        rodalies,
        config: Arc::new(config),
    };

    info!("🌐 Server running on: http://{}", bind_addr);
    info!("📍 GET  /api/rodalies/{{stop_id}}?at=HH:MM:SS&limit=N - Next departures");
    info!("📍 GET  /api/rodalies/status                         - Index status");
    info!("📍 POST /api/rodalies/refresh                        - Download and re-index");
    info!("📍 GET  /health                                      - Health check");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .configure(rodalies_routes)
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}

/// One-shot download and re-index, for cron jobs and first deployment.
async fn run_refresh(rodalies: Arc<Rodalies>) -> anyhow::Result<()> {
    let snapshot = rodalies.refresh().await?;
    info!(
        "✓ GTFS update completed: {} stops, {} stop times in {}",
        snapshot.index.stop_count(),
        snapshot.index.stop_time_count(),
        rodalies.data_dir().display()
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!(
        "🚀 Rodalies departures (feed: {}, data dir: {})",
        config.gtfs_url,
        config.data_dir.display()
    );

    let rodalies = Arc::new(Rodalies::new(config.data_dir.clone(), Arc::new(config.fetcher())));

    match std::env::args().nth(1).as_deref() {
        Some("refresh") => actix_web::rt::System::new().block_on(run_refresh(rodalies)),
        Some(other) => anyhow::bail!("unknown command {:?}, expected `refresh` or no argument", other),
        None => {
            actix_web::rt::System::new().block_on(run_server(config, rodalies))?;
            Ok(())
        }
    }
}
