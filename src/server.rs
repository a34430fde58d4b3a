//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/documents` | Upload a document (`{title, text}`) |
//! | `GET`    | `/documents` | List documents |
//! | `GET`    | `/documents/{id}` | Document with staging counts |
//! | `DELETE` | `/documents/{id}` | Delete a document |
//! | `POST`   | `/documents/{id}/process` | Run extraction, streamed as server-sent events |
//! | `GET`    | `/documents/{id}/staged` | Staged items (`?phase=&itemType=&status=`) |
//! | `POST`   | `/staged/verify` | Verify, reject or reset staged items |
//! | `POST`   | `/documents/{id}/commit` | Commit verified items |
//! | `POST`   | `/documents/reset-stale` | Fail documents stuck in PROCESSING |
//! | `POST`   | `/knowledge/add` | Add knowledge from free text |
//! | `POST`   | `/knowledge/correct` | Correct rules from free text |
//! | `POST`   | `/rules/{id}/update` | Versioned rule update |
//! | `POST`   | `/rules/{id}/deprecate` | Deprecate a rule |
//! | `POST`   | `/answer` | Cited answer to a question |
//! | `POST`   | `/search` | Structured search (rate limited) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Некорректный запрос: ids must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `rate_limited` (429,
//! with `Retry-After`), `provider_error` (502), `internal` (500). Messages
//! are in Russian; internal details are logged, not returned.
//!
//! # Processing stream
//!
//! Each SSE event is named after the event type and carries the JSON wire
//! event `{type, phase?, data?}`. The stream ends after `complete`,
//! `error` or `fatal_error`. Closing the connection stops delivery but not
//! the run.
//!
//! Authentication is expected in front of this server and is not handled
//! here.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, Extensions, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::commit;
use crate::config::Config;
use crate::correction;
use crate::db;
use crate::documents;
use crate::errors::PipelineError;
use crate::knowledge::{self, RuleUpdate};
use crate::processing::Processor;
use crate::provider::{create_provider, AiProvider};
use crate::retrieval::{self, SearchRequest};
use crate::staging::{self, StagingFilter, VerificationAction};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    provider: Arc<dyn AiProvider>,
    processor: Processor,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: SqlitePool, provider: Arc<dyn AiProvider>) -> Self {
        let processor = Processor::new(pool.clone(), provider.clone(), config.clone());
        let limiter = Arc::new(search_limiter(config.server.rate_limit_per_minute));
        Self {
            config,
            pool,
            provider,
            processor,
            limiter,
        }
    }
}

fn search_limiter(per_minute: u32) -> DefaultKeyedRateLimiter<String> {
    let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_minute(per_minute))
}

/// Starts the HTTP server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    let provider: Arc<dyn AiProvider> = Arc::from(create_provider(&config.llm, &config.embedding)?);
    let state = AppState::new(Arc::new(config.clone()), pool, provider);

    let app = router(state);

    tracing::info!(%bind_addr, "server listening");
    println!("Server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/documents/reset-stale", post(handle_reset_stale))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/documents/{id}/process", post(handle_process))
        .route("/documents/{id}/staged", get(handle_staged))
        .route("/documents/{id}/commit", post(handle_commit))
        .route("/staged/verify", post(handle_verify))
        .route("/knowledge/add", post(handle_add))
        .route("/knowledge/correct", post(handle_correct))
        .route("/rules/{id}/update", post(handle_rule_update))
        .route("/rules/{id}/deprecate", post(handle_rule_deprecate))
        .route("/answer", post(handle_answer))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        retry_after: None,
    }
}

fn rate_limited(retry_after: u64) -> AppError {
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited",
        message: format!(
            "Слишком много запросов. Повторите через {} с.",
            retry_after
        ),
        retry_after: Some(retry_after),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(m) => bad_request(format!("Некорректный запрос: {}", m)),
            PipelineError::NotFound(m) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: format!("Не найдено: {}", m),
                retry_after: None,
            },
            PipelineError::Parse { message, .. } => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "provider_error",
                message: format!("Не удалось разобрать ответ модели: {}", message),
                retry_after: None,
            },
            PipelineError::Provider(m) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "provider_error",
                message: format!("Ошибка AI-провайдера: {}", m),
                retry_after: None,
            },
            other => {
                tracing::error!(error = %other, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: "Внутренняя ошибка сервера. Попробуйте ещё раз.".to_string(),
                    retry_after: None,
                }
            }
        }
    }
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Documents ============

#[derive(Deserialize)]
struct UploadRequest {
    title: String,
    text: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let document = documents::create_document(&state.pool, &req.title, &req.text).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let docs = documents::list_documents(&state.pool).await?;
    Ok(Json(serde_json::json!({ "documents": docs })))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let document = documents::get_document(&state.pool, &id).await?;
    let staging = staging::counts_by_status(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({
        "document": document,
        "staging": staging,
    })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    documents::delete_document(&state.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_reset_stale(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let max_age = state.config.server.stale_after_minutes * 60;
    let reset = documents::reset_stale(&state.pool, max_age).await?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

// ============ Processing ============

async fn handle_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // 404 before the stream opens; later failures arrive as events.
    documents::get_document(&state.pool, &id).await?;

    let run = state.processor.start(&id);
    let stream = run.into_stream().map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.kind())
                .data(event.to_json()),
        )
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ Staging ============

async fn handle_staged(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(filter): Query<StagingFilter>,
) -> Result<Json<serde_json::Value>, AppError> {
    documents::get_document(&state.pool, &id).await?;
    let items = staging::list_by_document(&state.pool, &id, &filter).await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    ids: Vec<String>,
    action: String,
}

async fn handle_verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let action: VerificationAction = req.action.parse()?;
    let updated = staging::set_verification(&state.pool, &req.ids, action).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn handle_commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = commit::commit(
        &state.pool,
        state.provider.as_ref(),
        &state.config.commit,
        &id,
    )
    .await?;
    let mut body = serde_json::to_value(&summary).map_err(PipelineError::from)?;
    body["success"] = serde_json::json!(true);
    Ok(Json(body))
}

// ============ Knowledge ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextRequest {
    text: String,
    #[serde(default)]
    initiated_by: Option<String>,
}

async fn handle_add(
    State(state): State<AppState>,
    Json(req): Json<TextRequest>,
) -> Result<Json<correction::AddSummary>, AppError> {
    let who = req.initiated_by.as_deref().unwrap_or("api");
    let summary = correction::add_knowledge(
        &state.pool,
        state.provider.as_ref(),
        &state.config,
        &req.text,
        who,
    )
    .await?;
    Ok(Json(summary))
}

async fn handle_correct(
    State(state): State<AppState>,
    Json(req): Json<TextRequest>,
) -> Result<Json<correction::CorrectionSummary>, AppError> {
    let who = req.initiated_by.as_deref().unwrap_or("api");
    let summary = correction::correct_knowledge(
        &state.pool,
        state.provider.as_ref(),
        &state.config,
        &req.text,
        who,
    )
    .await?;
    Ok(Json(summary))
}

async fn handle_rule_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<RuleUpdate>,
) -> Result<Json<crate::models::Rule>, AppError> {
    let rule = knowledge::update_rule(&state.pool, &id, &update).await?;
    Ok(Json(rule))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeprecateRequest {
    reason: Option<String>,
    initiated_by: Option<String>,
}

async fn handle_rule_deprecate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DeprecateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let qa = knowledge::deprecate_rule(
        &state.pool,
        &id,
        req.reason.as_deref(),
        req.initiated_by.as_deref().unwrap_or("api"),
    )
    .await?;
    Ok(Json(serde_json::json!({ "qaDeprecated": qa })))
}

// ============ Retrieval ============

#[derive(Deserialize)]
struct AnswerRequest {
    question: String,
}

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<retrieval::Answer>, AppError> {
    let answer = retrieval::answer(
        &state.pool,
        state.provider.as_ref(),
        &state.config,
        &req.question,
    )
    .await?;
    Ok(Json(answer))
}

/// Rate-limit key: the caller's agent id, else forwarded or peer address.
fn client_key(req: &SearchRequest, headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(agent) = req.agent_id.as_deref().filter(|a| !a.trim().is_empty()) {
        return format!("agent:{}", agent.trim());
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return format!("ip:{}", forwarded.trim());
    }
    match extensions.get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "anonymous".to_string(),
    }
}

fn check_rate(limiter: &DefaultKeyedRateLimiter<String>, key: &str) -> Result<(), AppError> {
    limiter.check_key(&key.to_string()).map_err(|not_until| {
        let wait = not_until.wait_time_from(DefaultClock::default().now());
        rate_limited(wait.as_secs().max(1))
    })
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(req): Json<SearchRequest>,
) -> Result<Json<retrieval::SearchResponse>, AppError> {
    let key = client_key(&req, &headers, &extensions);
    check_rate(&state.limiter, &key)?;

    let response = retrieval::search(&state.pool, state.provider.as_ref(), &state.config, &req).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_rejects_after_quota() {
        let limiter = search_limiter(2);
        assert!(check_rate(&limiter, "agent:bot").is_ok());
        assert!(check_rate(&limiter, "agent:bot").is_ok());
        let err = check_rate(&limiter, "agent:bot").unwrap_err();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.retry_after.unwrap() >= 1);
        // Other clients have their own budget.
        assert!(check_rate(&limiter, "agent:web").is_ok());
    }

    #[test]
    fn test_zero_rate_limit_still_allows_one() {
        let limiter = search_limiter(0);
        assert!(check_rate(&limiter, "ip:127.0.0.1").is_ok());
    }

    #[test]
    fn test_client_key_prefers_agent_id() {
        let req = SearchRequest {
            query: "q".into(),
            agent_id: Some("telegram".into()),
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(client_key(&req, &headers, &Extensions::new()), "agent:telegram");

        let anonymous = SearchRequest {
            query: "q".into(),
            ..Default::default()
        };
        assert_eq!(client_key(&anonymous, &headers, &Extensions::new()), "ip:10.0.0.1");
        assert_eq!(
            client_key(&anonymous, &HeaderMap::new(), &Extensions::new()),
            "anonymous"
        );
    }

    #[test]
    fn test_error_mapping() {
        let e = AppError::from(PipelineError::Validation("ids must not be empty".into()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert!(e.message.contains("ids must not be empty"));

        let e = AppError::from(PipelineError::NotFound("document x".into()));
        assert_eq!(e.code, "not_found");

        let e = AppError::from(PipelineError::Internal(anyhow::anyhow!("secret path /var/db")));
        assert_eq!(e.code, "internal");
        assert!(!e.message.contains("/var/db"));
    }
}
