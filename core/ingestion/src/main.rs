use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use contact_hub_identity::ContactStore;
use contact_hub_ingestion::{
    HttpSearchIndex, HubError, IngestPipeline, MemoryIndex, SearchIndex,
};
use contact_hub_schemas::SuggestionKind;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber;

#[derive(Parser, Debug)]
#[command(name = "contact-hub-ingestion", about = "Contact Hub ingestion service")]
struct Args {
    /// Data directory for the flat-file stores (contacts, seen ids, audit log)
    #[arg(long)]
    data_dir: Option<String>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1:21970")]
    addr: String,

    /// Base URL of the external indexing service. Without one, documents go
    /// to a non-durable in-memory index (useful for local smoke runs only).
    #[arg(long)]
    index_url: Option<String>,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<IngestPipeline>,
    contacts: Arc<Mutex<ContactStore>>,
}

fn default_data_dir() -> String {
    std::env::var("HUB_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/ContactHub", home)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Contact Hub Ingestion Service v0.1.0");

    let args = Args::parse();
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;
    info!("Data directory: {}", data_dir);

    let index_url = args.index_url.or_else(|| std::env::var("INDEX_URL").ok());
    let index: Arc<dyn SearchIndex> = match &index_url {
        Some(url) => {
            info!("Using index service at {}", url);
            Arc::new(HttpSearchIndex::new(url))
        }
        None => {
            warn!("No index service configured, documents will not be durable");
            Arc::new(MemoryIndex::new())
        }
    };

    let pipeline = Arc::new(IngestPipeline::open(&data_dir, index)?);
    let state = AppState {
        contacts: pipeline.contacts(),
        pipeline,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ingest/event", post(ingest_event))
        .route("/ingest/batch", post(ingest_batch))

        // Identity operations
        .route("/contacts/:handle", get(get_contact))
        .route("/contacts/:handle/suggestions", post(add_suggestion))
        .route(
            "/contacts/:handle/suggestions/:suggestion_id/accept",
            post(accept_suggestion),
        )
        .route(
            "/contacts/:handle/suggestions/:suggestion_id/decline",
            post(decline_suggestion),
        )
        .route("/contacts/:handle/merge", post(merge_contact))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    info!("Starting HTTP server on {}", args.addr);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(e: HubError) -> (StatusCode, String) {
    let status = if e.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, e.to_string())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "ingestion",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let outcome = state
        .pipeline
        .ingest_event(&raw)
        .await
        .map_err(error_response)?;

    Ok(Json(serde_json::json!({
        "duplicate": outcome.duplicate,
        "doc_id": outcome.doc.id,
        "message_id": outcome.event.message_id,
        "handle": outcome.event.peer.handle
    })))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    events: Vec<Value>,
    fail_fast: Option<bool>,
}

async fn ingest_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> impl IntoResponse {
    let fail_fast = request.fail_fast.unwrap_or(true);
    let report = state.pipeline.ingest_batch(&request.events, fail_fast).await;
    Json(report)
}

async fn get_contact(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut contacts = state.contacts.lock().await;
    let contact = contacts
        .find_contact(&handle)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match contact {
        Some(c) => Ok(Json(c)),
        None => Err((StatusCode::NOT_FOUND, "Contact not found".to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct SuggestionRequest {
    kind: String,
    content: String,
}

async fn add_suggestion(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<SuggestionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let kind = SuggestionKind::from_str_loose(&request.kind).ok_or((
        StatusCode::BAD_REQUEST,
        format!("unknown suggestion kind '{}'", request.kind),
    ))?;

    let mut contacts = state.contacts.lock().await;
    let suggestion = contacts
        .add_suggestion(&handle, kind, &request.content)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({
        "added": suggestion.is_some(),
        "suggestion": suggestion
    })))
}

async fn accept_suggestion(
    State(state): State<AppState>,
    Path((handle, suggestion_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut contacts = state.contacts.lock().await;
    let accepted = contacts
        .accept_suggestion(&handle, &suggestion_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if accepted {
        Ok(Json(serde_json::json!({ "accepted": true })))
    } else {
        Err((StatusCode::NOT_FOUND, "Suggestion not found".to_string()))
    }
}

async fn decline_suggestion(
    State(state): State<AppState>,
    Path((handle, suggestion_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut contacts = state.contacts.lock().await;
    let declined = contacts
        .decline_suggestion(&handle, &suggestion_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if declined {
        Ok(Json(serde_json::json!({ "declined": true })))
    } else {
        Err((StatusCode::NOT_FOUND, "Suggestion not found".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    into: String,
}

async fn merge_contact(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<MergeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut contacts = state.contacts.lock().await;
    let merged = contacts
        .merge_contacts(&handle, &request.into)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match merged {
        Some(contact) => Ok(Json(contact)),
        None => Err((StatusCode::NOT_FOUND, "Contact not found".to_string())),
    }
}
