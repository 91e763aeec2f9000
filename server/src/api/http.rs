use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State as AxumState},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{post, MethodRouter},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use typerace_types::api::{
    ErrorResponse, MoneyResponse, ProfileImageResponse, UpdateMoneyRequest, UploadResponse,
    UserInfoResponse,
};
use typerace_types::{AccountId, ErrorKind, LobbyError};
use uuid::Uuid;

use crate::Server;

/// Largest accepted profile image.
const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
/// Body cap for the upload route: the image plus room for the other form fields.
const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_BYTES + 64 * 1024;
const ALLOWED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];
const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];
/// URL prefix the stored images are served under.
const UPLOADS_PREFIX: &str = "uploads";

#[derive(Debug, thiserror::Error)]
pub(super) enum ApiError {
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error("profile image exceeds the 5 MiB limit")]
    TooLarge,
    #[error("{0}")]
    BadUpload(&'static str),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Lobby(err) => match err.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::AlreadyExists => StatusCode::CONFLICT,
                ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
                ErrorKind::InvalidPayload => StatusCode::BAD_REQUEST,
                ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                ErrorKind::Rejected => StatusCode::CONFLICT,
                ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::BadUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Lobby(err) => err.code(),
            ApiError::TooLarge => "PAYLOAD_TOO_LARGE",
            ApiError::BadUpload(_) | ApiError::Multipart(_) => "INVALID_PAYLOAD",
            ApiError::Io(_) => "STORAGE_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
    rooms: usize,
    players: usize,
}

pub(super) async fn healthz(AxumState(server): AxumState<Arc<Server>>) -> Response {
    let snapshot = server.lobby_snapshot();
    Json(HealthzResponse {
        ok: true,
        rooms: snapshot.rooms,
        players: snapshot.players,
    })
    .into_response()
}

/// Lowercased extension of `file_name` when it is on the allow-list.
fn allowed_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

struct Upload {
    extension: String,
    bytes: Vec<u8>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<(AccountId, Upload), ApiError> {
    let mut user_id = None;
    let mut upload = None;
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("userId") => {
                let raw = field.text().await?;
                let id = raw
                    .trim()
                    .parse::<AccountId>()
                    .map_err(|_| ApiError::BadUpload("userId must be an integer"))?;
                user_id = Some(id);
            }
            Some("profileImage") => {
                let mime = field.content_type().unwrap_or_default().to_ascii_lowercase();
                if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
                    return Err(ApiError::BadUpload("unsupported image type"));
                }
                let extension = field
                    .file_name()
                    .and_then(allowed_extension)
                    .ok_or(ApiError::BadUpload("unsupported file extension"))?;
                let mut bytes = Vec::new();
                while let Some(chunk) = field.chunk().await? {
                    if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                        return Err(ApiError::TooLarge);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                if bytes.is_empty() {
                    return Err(ApiError::BadUpload("profileImage is empty"));
                }
                upload = Some(Upload { extension, bytes });
            }
            _ => {}
        }
    }
    let user_id = user_id.ok_or(ApiError::BadUpload("missing userId"))?;
    let upload = upload.ok_or(ApiError::BadUpload("missing profileImage"))?;
    Ok((user_id, upload))
}

async fn store_upload(
    server: &Server,
    mut multipart: Multipart,
) -> Result<UploadResponse, ApiError> {
    let (user_id, upload) = read_upload(&mut multipart).await?;
    let store = server.coordinator().store();
    store.get_account(user_id).await?;

    let file_name = format!("{user_id}-{}.{}", Uuid::new_v4(), upload.extension);
    let dir = server.config.upload_dir();
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(&file_name), &upload.bytes).await?;

    let profile_image = format!("{UPLOADS_PREFIX}/{file_name}");
    store.set_profile_image(user_id, &profile_image).await?;
    tracing::info!(account = user_id, path = %profile_image, "profile image stored");
    Ok(UploadResponse {
        success: true,
        profile_image,
    })
}

/// The upload route carries its own body cap, so the global limit never loosens it.
pub(super) fn upload_route() -> MethodRouter<Arc<Server>> {
    post(upload_profile_image).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
}

pub(super) async fn upload_profile_image(
    AxumState(server): AxumState<Arc<Server>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let start = Instant::now();
    let result = store_upload(&server, multipart).await;
    server.http_metrics().record_upload(start.elapsed());
    result.map(Json)
}

pub(super) async fn get_profile_image(
    AxumState(server): AxumState<Arc<Server>>,
    Path(id): Path<AccountId>,
) -> Result<Json<ProfileImageResponse>, ApiError> {
    let start = Instant::now();
    let result = server.coordinator().store().get_profile_image(id).await;
    server.http_metrics().record_user_info(start.elapsed());
    Ok(Json(ProfileImageResponse {
        profile_image: result?,
    }))
}

pub(super) async fn get_user_info(
    AxumState(server): AxumState<Arc<Server>>,
    Path(id): Path<AccountId>,
) -> Result<Json<UserInfoResponse>, ApiError> {
    let start = Instant::now();
    let result = server.coordinator().store().get_account(id).await;
    server.http_metrics().record_user_info(start.elapsed());
    Ok(Json(result?.into()))
}

pub(super) async fn get_user_money(
    AxumState(server): AxumState<Arc<Server>>,
    Path(id): Path<AccountId>,
) -> Result<Json<MoneyResponse>, ApiError> {
    let start = Instant::now();
    let result = server.coordinator().ledger().balance(id).await;
    server.http_metrics().record_money(start.elapsed());
    Ok(Json(MoneyResponse { money: result? }))
}

pub(super) async fn update_user_money(
    AxumState(server): AxumState<Arc<Server>>,
    Json(request): Json<UpdateMoneyRequest>,
) -> Result<Json<MoneyResponse>, ApiError> {
    let start = Instant::now();
    let result = server
        .coordinator()
        .ledger()
        .adjust(request.user_id, request.amount)
        .await;
    server.http_metrics().record_money(start.elapsed());
    let money = result?;
    tracing::info!(
        account = request.user_id,
        amount = request.amount,
        balance = money,
        "balance adjusted over http"
    );
    Ok(Json(MoneyResponse { money }))
}

pub(super) async fn ws_metrics(
    headers: HeaderMap,
    AxumState(server): AxumState<Arc<Server>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(server.ws_metrics_snapshot()).into_response()
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(server): AxumState<Arc<Server>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(server.http_metrics_snapshot()).into_response()
}

pub(super) async fn lobby_metrics(
    headers: HeaderMap,
    AxumState(server): AxumState<Arc<Server>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(server.lobby_snapshot()).into_response()
}

pub(super) async fn system_metrics(
    headers: HeaderMap,
    AxumState(server): AxumState<Arc<Server>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(server.system_metrics_snapshot()).into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    check_metrics_token(headers, &token)
}

fn check_metrics_token(headers: &HeaderMap, token: &str) -> Option<StatusCode> {
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(token) || header_token == Some(token) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}
