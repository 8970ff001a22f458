use std::sync::Arc;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{
    config::AppCfg,
    events::{FormEvent, SessionEvent},
    form::{FormError, ImageUpload, SubmitError, UploadError, UploadSlot},
    generate::GenerationError,
    io::{download_name, to_png, PROMPT_FILE},
    prompts::Catalog,
    providers::ImageGenerator,
    session::{self, Session, SessionView, SubmitFailure},
};

#[derive(Clone)]
pub struct AppState {
    catalog: Arc<Catalog>,
    session: Arc<Mutex<Session>>,
    generator: Arc<dyn ImageGenerator>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, generator: Arc<dyn ImageGenerator>) -> Self {
        let (tx, _rx) = broadcast::channel::<SessionEvent>(256);
        let session = Session::new(catalog.clone()).with_events(tx.clone());
        Self { catalog, session: Arc::new(Mutex::new(session)), generator, events_tx: tx }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/catalog", get(get_catalog))
        .route("/api/session", get(get_session))
        .route("/api/session/events", post(apply_event))
        .route("/api/prompt", get(get_prompt))
        .route("/api/prompt/reset", post(reset_prompt))
        .route("/api/prompt/download", get(download_prompt))
        .route("/api/uploads/{slot}", put(put_upload).delete(delete_upload))
        .route("/api/generate", post(generate))
        .route("/api/output/download", get(download_output))
        .route("/api/events", get(session_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(cfg: &AppCfg, catalog: Arc<Catalog>, generator: Arc<dyn ImageGenerator>) -> Result<()> {
    let mut app = router(AppState::new(catalog, generator));
    if let Some(dir) = &cfg.server.static_dir {
        tracing::info!(dir = %dir.display(), "serving static page");
        app = app.fallback_service(ServeDir::new(dir));
    }

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
    tracing::info!(bind = %cfg.server.bind, "promptbook API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_catalog(State(st): State<AppState>) -> Json<Catalog> {
    Json(st.catalog.as_ref().clone())
}

async fn get_session(State(st): State<AppState>) -> Json<SessionView> {
    Json(st.session.lock().view())
}

async fn apply_event(State(st): State<AppState>, Json(ev): Json<FormEvent>) -> Result<Json<SessionView>, ApiErr> {
    let mut s = st.session.lock();
    s.apply(ev).map_err(ApiErr::form)?;
    Ok(Json(s.view()))
}

async fn reset_prompt(State(st): State<AppState>) -> Result<Json<SessionView>, ApiErr> {
    apply_event(State(st), Json(FormEvent::ResetPrompt)).await
}

async fn get_prompt(State(st): State<AppState>) -> impl IntoResponse {
    let prompt = st.session.lock().form().editable_prompt().to_string();
    ([(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))], prompt)
}

async fn download_prompt(State(st): State<AppState>) -> Response {
    let prompt = st.session.lock().form().editable_prompt().to_string();
    attachment("text/plain; charset=utf-8", PROMPT_FILE, prompt.into_bytes())
}

fn attachment(content_type: &'static str, file_name: &str, bytes: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"{file_name}\"");
    match HeaderValue::from_str(&disposition) {
        Ok(disposition) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => ApiErr::internal(e).into_response(),
    }
}

fn parse_slot(slot: &str) -> Result<UploadSlot, ApiErr> {
    match slot {
        "product" => Ok(UploadSlot::Product),
        "logo" => Ok(UploadSlot::Logo),
        other => Err(ApiErr::not_found(format!("unknown upload slot '{other}'"))),
    }
}

/// File names end up quoted in `Content-Disposition`, so only printable ASCII
/// without quotes or path separators is kept.
fn upload_name(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or_default()
        .chars()
        .map(|c| match c {
            '"' | '\\' | '/' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() { "upload".to_string() } else { cleaned.to_string() }
}

#[derive(Deserialize)]
struct UploadQuery {
    name: Option<String>,
}

async fn put_upload(
    State(st): State<AppState>,
    Path(slot): Path<String>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SessionView>, ApiErr> {
    let slot = parse_slot(&slot)?;
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();
    let name = upload_name(q.name.as_deref());
    let upload = ImageUpload::new(name, mime, body.to_vec());

    let mut s = st.session.lock();
    match slot {
        UploadSlot::Product => s.upload_product(upload),
        UploadSlot::Logo => s.upload_logo(upload),
    }
    .map_err(ApiErr::upload)?;
    Ok(Json(s.view()))
}

async fn delete_upload(State(st): State<AppState>, Path(slot): Path<String>) -> Result<Json<SessionView>, ApiErr> {
    let slot = parse_slot(&slot)?;
    let mut s = st.session.lock();
    match slot {
        UploadSlot::Product => s.clear_product(),
        UploadSlot::Logo => s.clear_logo(),
    }
    Ok(Json(s.view()))
}

#[derive(Serialize)]
struct GenerateResp {
    image: String,
    download_name: String,
}

async fn generate(State(st): State<AppState>) -> Result<Json<GenerateResp>, ApiErr> {
    let uri = session::submit(&st.session, st.generator.as_ref()).await.map_err(ApiErr::submit)?;
    // Name after the photo that was submitted, not whatever is on the form now.
    let download_name = {
        let s = st.session.lock();
        download_name(s.generated().map(|g| g.product_file.as_str()))
    };
    Ok(Json(GenerateResp { image: uri.to_string(), download_name }))
}

async fn download_output(State(st): State<AppState>) -> Result<Response, ApiErr> {
    let generated = st.session.lock().generated().cloned();
    let Some(img) = generated else {
        return Err(ApiErr::not_found("No generated image yet"));
    };
    let png = to_png(&img.uri)?;
    Ok(attachment("image/png", &download_name(Some(&img.product_file)), png))
}

pub async fn session_events(
    State(st): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = st.events_tx.subscribe();

    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| async move { msg.ok() })
        .map(|evt: SessionEvent| {
            let json = serde_json::to_string(&evt).unwrap_or_default();
            Ok(Event::default().event("message").data(json))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self { status, code: code.to_string(), message: message.into(), suggestion: None }
    }

    fn with_suggestion(mut self, s: impl Into<String>) -> Self {
        self.suggestion = Some(s.into());
        self
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("Internal error: {}", e))
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn form(e: FormError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string())
    }

    fn upload(e: UploadError) -> Self {
        let err = Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_upload", e.to_string());
        match e {
            UploadError::UnsupportedType { slot: "logo", .. } => err.with_suggestion("Logos must be PNG, JPEG, WEBP or SVG."),
            UploadError::UnsupportedType { .. } => err.with_suggestion("Send the file with an image/* Content-Type."),
            UploadError::Empty(_) => Self::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()),
        }
    }

    fn submit(e: SubmitFailure) -> Self {
        match e {
            SubmitFailure::Rejected(SubmitError::Busy) => {
                Self::new(StatusCode::CONFLICT, "generation_in_progress", SubmitError::Busy.to_string())
                    .with_suggestion("Wait for the current image to finish.")
            }
            SubmitFailure::Rejected(e) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", e.to_string()),
            SubmitFailure::Generation(e @ GenerationError::MissingCredential(_)) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "missing_credential", e.to_string())
            }
            SubmitFailure::Generation(e) => Self::new(StatusCode::BAD_GATEWAY, "generation_failed", e.to_string()),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiErr {
    fn from(e: E) -> Self {
        Self::internal(e.into())
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}
