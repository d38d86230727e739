// Client Identity Resolution - Web Server
// REST API with Axum for the intake, new-client and client-search screens

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use client_identity::{
    ClientField, ClientId, ClientProfile, ClientStore, DependentKind, IdentityResolutionService, MergeError,
    MergePlan, PartialClientProfile, Recovery, ResolutionConfig, SqliteStore,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<SqliteStore>>,
    config: ResolutionConfig,
}

impl AppState {
    fn store(&self) -> Result<MutexGuard<'_, SqliteStore>, Response> {
        self.db.lock().map_err(|_| {
            error!("Database mutex poisoned");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Database unavailable").into_response()
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data }
    }
}

/// Error body. Tells the UI which of the four recoveries applies.
#[derive(Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<Recovery>,
    mutated_state: bool,
    resubmit_same_plan: bool,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            success: false,
            error: message.into(),
            recovery: None,
            mutated_state: false,
            resubmit_same_plan: false,
        }
    }
}

impl From<MergeError> for ApiError {
    fn from(e: MergeError) -> Self {
        let status = match &e {
            MergeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MergeError::Conflict { .. } => StatusCode::CONFLICT,
            MergeError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            MergeError::PartialFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let recovery = e.recovery();
        Self {
            status,
            success: false,
            error: e.to_string(),
            recovery: Some(recovery),
            mutated_state: e.mutated_state(),
            resubmit_same_plan: recovery == Recovery::ResubmitSamePlan,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
struct MatchRequest {
    profile: PartialClientProfile,
    #[serde(default)]
    exclude_ids: Vec<ClientId>,
}

#[derive(Deserialize)]
struct PlanRequest {
    /// Source records, in field-resolution order
    client_ids: Vec<ClientId>,
    primary_id: ClientId,
    #[serde(default)]
    overrides: BTreeMap<ClientField, String>,
}

#[derive(Serialize)]
struct PlanResponse {
    plan: MergePlan,
    fingerprint: String,
}

#[derive(Serialize)]
struct ClientResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<ClientProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merged_into: Option<ClientId>,
    /// Records still pointing at this client, by kind
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    dependents: BTreeMap<DependentKind, Vec<String>>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/matches - Propose possible duplicates for a profile
async fn propose_matches(State(state): State<AppState>, Json(req): Json<MatchRequest>) -> Response {
    let store = match state.store() {
        Ok(store) => store,
        Err(response) => return response,
    };
    let service = IdentityResolutionService::new(&*store, state.config.clone());

    let exclude: HashSet<ClientId> = req.exclude_ids.into_iter().collect();
    let results = service.propose_matches(&req.profile, &exclude);

    // "search failed" must not look like "no matches"
    let status = if results.is_failed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(ApiResponse::ok(results))).into_response()
}

/// POST /api/merge-plans - Resolve canonical fields for a reviewer
async fn create_merge_plan(State(state): State<AppState>, Json(req): Json<PlanRequest>) -> Response {
    let store = match state.store() {
        Ok(store) => store,
        Err(response) => return response,
    };
    let service = IdentityResolutionService::new(&*store, state.config.clone());

    let records = match service.load_clients(&req.client_ids) {
        Ok(records) => records,
        Err(e) => return ApiError::from(e).into_response(),
    };

    match service.create_merge_plan(&records, &req.primary_id, &req.overrides) {
        Ok(plan) => {
            let fingerprint = plan.fingerprint();
            Json(ApiResponse::ok(PlanResponse { plan, fingerprint })).into_response()
        }
        Err(e) => ApiError::from(MergeError::from(e)).into_response(),
    }
}

/// POST /api/merges - Execute (or resubmit) a merge plan
async fn execute_merge(State(state): State<AppState>, Json(plan): Json<MergePlan>) -> Response {
    let store = match state.store() {
        Ok(store) => store,
        Err(response) => return response,
    };
    let service = IdentityResolutionService::new(&*store, state.config.clone());

    match service.execute_merge(&plan) {
        Ok(result) => Json(ApiResponse::ok(result)).into_response(),
        Err(e) => {
            error!(primary = %plan.primary_id, error = %e, "Merge request failed");
            ApiError::from(e).into_response()
        }
    }
}

/// GET /api/clients/:id - Fetch a client with its dependent records, or where it was merged to
async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let store = match state.store() {
        Ok(store) => store,
        Err(response) => return response,
    };
    let service = IdentityResolutionService::new(&*store, state.config.clone());
    let id = ClientId::from(id);

    let lookup = store.get_client(&id).and_then(|client| match client {
        Some(client) => Ok((Some(client), None, service.dependent_records(&id)?)),
        None => Ok((None, store.merged_into(&id)?, BTreeMap::new())),
    });

    match lookup {
        Ok((Some(client), _, dependents)) => Json(ApiResponse::ok(ClientResponse {
            client: Some(client),
            merged_into: None,
            dependents,
        }))
        .into_response(),
        Ok((None, merged_into, dependents)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::ok(ClientResponse {
                client: None,
                merged_into,
                dependents,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(client = %id, error = %e, "Client lookup failed");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌐 Client Identity - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = std::env::var("CLIENT_IDENTITY_CONFIG").ok().map(std::path::PathBuf::from);
    let config = ResolutionConfig::load(config_path.as_deref())?;

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    println!("✓ Database opened: {}", config.database_path.display());

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(store)),
        config,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/matches", post(propose_matches))
        .route("/merge-plans", post(create_merge_plan))
        .route("/merges", post(execute_merge))
        .route("/clients/:id", get(get_client))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let addr = std::env::var("CLIENT_IDENTITY_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "Server listening");
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/health", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
