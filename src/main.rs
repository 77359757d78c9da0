//! Report Structure Engine - hierarchical line item reordering service.

mod config;
mod error;
mod flatten;
mod persist;
mod planner;
mod reorder;
mod schema;
mod sort_order;
mod store;
mod supabase;
mod tree;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use config::EngineConfig;
use error::ReorderError;
use persist::{OrderPersistor, PersistSummary};
use reorder::{BatchCommit, MoveCommit, MoveState, ReorderSession};
use schema::{LineItem, MoveRequest, TreeNode};
use serde::{Deserialize, Serialize};
use sort_order::PositionUpdate;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use store::{InMemoryStore, LineItemStore};
use supabase::SupabaseStore;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn LineItemStore>,
    config: Arc<EngineConfig>,
    /// One in-flight mutation per structure. Entries live only while a
    /// mutation holds or waits on them.
    move_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AppState {
    fn new(store: Arc<dyn LineItemStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            move_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `mutation` while holding the structure's lock, or answer 409 when
    /// another mutation already holds it.
    async fn with_move_lock<T, F, Fut>(
        &self,
        structure_id: &str,
        mutation: F,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let lock = self
            .move_locks
            .lock()
            .await
            .entry(structure_id.to_string())
            .or_default()
            .clone();

        let result = match lock.try_lock() {
            Ok(_guard) => mutation().await,
            Err(_) => Err(busy(structure_id)),
        };

        let mut locks = self.move_locks.lock().await;
        drop(lock);
        if locks
            .get(structure_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(structure_id);
        }
        result
    }

    async fn open_session(
        &self,
        structure_id: &str,
    ) -> Result<ReorderSession<dyn LineItemStore>, ApiError> {
        ReorderSession::open(self.store.clone(), &self.config, structure_id)
            .await
            .map_err(api_error)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "report_structure_engine=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;

    let store: Arc<dyn LineItemStore> = match SupabaseStore::from_env(&config) {
        Some(supabase) => {
            info!("Using Supabase store (schema={})", config.supabase_schema);
            Arc::new(supabase)
        }
        None => {
            warn!("SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY not set, using in-memory store");
            match &config.seed_path {
                Some(path) => Arc::new(InMemoryStore::load_from_file(path)?),
                None => Arc::new(InMemoryStore::new()),
            }
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(store, config);

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/structures/:structure_id/tree", get(get_tree))
        .route("/structures/:structure_id/moves", post(submit_move))
        .route("/structures/:structure_id/moves/preview", post(preview_move))
        .route("/structures/:structure_id/sibling-reorder", post(sibling_reorder))
        .route("/structures/:structure_id/normalize", post(normalize))
        .route("/structures/:structure_id/positions", put(update_positions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    /// Where the move stopped, when a session got far enough to have one.
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<MoveState>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(err: ReorderError) -> ApiError {
    (
        err.status_code(),
        Json(ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
            state: None,
        }),
    )
}

fn session_error<S: LineItemStore + ?Sized>(
    session: &ReorderSession<S>,
    err: ReorderError,
) -> ApiError {
    let (status, Json(mut body)) = api_error(err);
    body.state = Some(session.state());
    (status, Json(body))
}

fn busy(structure_id: &str) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(ErrorBody {
            kind: "move_in_flight",
            message: format!("A move is already in progress for structure {}", structure_id),
            state: None,
        }),
    )
}

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Current forest for a structure.
async fn get_tree(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
) -> Result<Json<Vec<TreeNode>>, ApiError> {
    let session = state.open_session(&structure_id).await?;
    Ok(Json(session.into_forest()))
}

/// Drag-and-drop move through the store's reparent procedure.
async fn submit_move(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<MoveCommit>, ApiError> {
    let (app, sid) = (&state, structure_id.as_str());
    state
        .with_move_lock(sid, || async move {
            let mut session = app.open_session(sid).await?;
            let commit = session
                .submit_move(&request)
                .await
                .map_err(|e| session_error(&session, e))?;
            info!(
                "Move {} committed on {} ({:?} rows affected)",
                commit.move_id, sid, commit.affected_count
            );
            Ok(Json(commit))
        })
        .await
}

/// Optimistic, non-persisted result of a move.
async fn preview_move(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<Vec<LineItem>>, ApiError> {
    let session = state.open_session(&structure_id).await?;
    session.preview(&request).map(Json).map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct SiblingReorderRequest {
    active_id: String,
    over_id: String,
}

/// Same-parent reorder persisted through the batch path.
async fn sibling_reorder(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
    Json(request): Json<SiblingReorderRequest>,
) -> Result<Json<BatchCommit>, ApiError> {
    let (app, sid) = (&state, structure_id.as_str());
    state
        .with_move_lock(sid, || async move {
            let mut session = app.open_session(sid).await?;
            let result = session
                .reorder_within_parent(&request.active_id, &request.over_id)
                .await;
            result.map(Json).map_err(|e| session_error(&session, e))
        })
        .await
}

/// Repair gaps and duplicates in the stored order.
async fn normalize(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
) -> Result<Json<BatchCommit>, ApiError> {
    let (app, sid) = (&state, structure_id.as_str());
    state
        .with_move_lock(sid, || async move {
            let mut session = app.open_session(sid).await?;
            let result = session.normalize().await;
            result.map(Json).map_err(|e| session_error(&session, e))
        })
        .await
}

/// Bulk renumbering with caller-computed positions.
async fn update_positions(
    State(state): State<AppState>,
    Path(structure_id): Path<String>,
    Json(updates): Json<Vec<PositionUpdate>>,
) -> Result<Json<PersistSummary>, ApiError> {
    let (app, sid) = (&state, structure_id.as_str());
    state
        .with_move_lock(sid, || async move {
            let persistor = OrderPersistor::new(app.store.clone(), &app.config);
            persistor
                .persist_updates(sid, updates)
                .await
                .map(Json)
                .map_err(api_error)
        })
        .await
}
