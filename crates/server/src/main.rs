use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{ApiContext, UploadConfig};
use shared::{
    domain::SessionToken,
    error::{ApiError, ErrorCode},
    protocol::{
        ChangePasswordRequest, HistoryEntry, LoginRequest, LoginResponse, ProfilePicResponse,
        RegisterRequest, StatusMessage, WsQuery,
    },
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        uploads: UploadConfig {
            dir: settings.upload_dir.clone(),
            public_prefix: settings.upload_public_prefix.clone(),
        },
    };

    let mut state = AppState::new(api);
    state.history_replay_limit = settings.history_replay_limit;
    state.end_session_on_disconnect = settings.end_session_on_disconnect;
    let app = build_router(Arc::new(state), settings.max_upload_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, upload_dir = %settings.upload_dir.display(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let public_prefix = state.api.uploads.public_prefix.clone();
    let uploads = ServeDir::new(state.api.uploads.dir.clone());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/messages", get(messages))
        .route("/upload-profile-pic/:token", post(upload_profile_pic))
        .route("/profile-pic/:token", get(profile_pic))
        .route("/change-password/:token", post(change_password))
        .route("/ws/:token", get(ws_handler))
        .nest_service(&public_prefix, uploads)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(detail = %err.detail, "request failed");
    }
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<StatusMessage> {
    server_api::register(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    server_api::login(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Vec<HistoryEntry>> {
    server_api::history(&state.api, q.limit)
        .await
        .map(Json)
        .map_err(reject)
}

async fn upload_profile_pic(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<ProfilePicResponse> {
    let token = SessionToken(token);
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_rejection)? {
        if field.name() == Some("file") {
            file = Some(field.bytes().await.map_err(multipart_rejection)?);
            break;
        }
    }
    let bytes = file.ok_or_else(|| reject(ApiError::validation("missing multipart field 'file'")))?;

    server_api::store_profile_pic(&state.api, &token, &bytes)
        .await
        .map(Json)
        .map_err(reject)
}

fn multipart_rejection(err: axum::extract::multipart::MultipartError) -> (StatusCode, Json<ApiError>) {
    let code = if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ErrorCode::PayloadTooLarge
    } else {
        ErrorCode::Validation
    };
    reject(ApiError::new(code, err.body_text()))
}

async fn profile_pic(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<ProfilePicResponse> {
    server_api::profile_pic(&state.api, &SessionToken(token))
        .await
        .map(Json)
        .map_err(reject)
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<StatusMessage> {
    server_api::change_password(&state.api, &SessionToken(token), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let replay_history = q.history.unwrap_or(true);
    ws.on_upgrade(move |socket| ws::serve_socket(state, socket, SessionToken(token), replay_history))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
