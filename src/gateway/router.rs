//! HTTP router and handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::auth_info::{AuthInformation, auth_info_middleware};
use super::chat::{ChatCompletionManager, ChatCompletionRequest, ChatCompletionResponse};
use crate::auth::ToolAuthManager;
use crate::config::Config;
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Chat completion routing
    pub chat: ChatCompletionManager,
    /// Tool credentials, login and refresh
    pub tools: Arc<ToolAuthManager>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let body_limit = server.max_body_size;
    let timeout = server.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/auth/login", get(login_handler))
        .route("/auth/callback", get(callback_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_info_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// GET /v1/models
async fn models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data: Vec<_> = state
        .chat
        .model_ids()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "llm-gateway",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// POST /v1/chat/completions
///
/// Authorization failures come back as an ordinary assistant message (HTTP 200).
async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthInformation>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    match state.chat.complete(&request, &auth).await {
        Ok(completion) if request.stream => sse_response(completion),
        Ok(completion) => Json(completion).into_response(),
        Err(e) => error_response(&e),
    }
}

/// A finished completion as server-sent events, closed by `[DONE]`.
fn sse_response(completion: ChatCompletionResponse) -> Response {
    let mut events: Vec<Result<Event, Infallible>> = completion
        .into_chunks()
        .into_iter()
        .map(|chunk| Ok(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())))
        .collect();
    events.push(Ok(Event::default().data("[DONE]")));
    Sse::new(futures::stream::iter(events)).into_response()
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    audience: String,
    referrer: Option<String>,
}

/// GET /auth/login?audience=A[&referrer=R]
async fn login_handler(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthInformation>,
    Query(params): Query<LoginParams>,
) -> Response {
    let manager = state.tools.auth();
    match manager.configs().get_config_for_audience(&params.audience) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return bad_request(
                "unknown_audience",
                &format!("No login is configured for '{}'", params.audience),
            );
        }
        Err(e) => return error_response(&e),
    }

    // An explicit referrer must be allowed; a header referrer is dropped if not
    let referrer = match params.referrer {
        Some(referrer) if state.config.is_allowed_referrer(&referrer) => Some(referrer),
        Some(referrer) => {
            warn!(referrer = %referrer, "Rejecting login with foreign referrer");
            return bad_request("invalid_referrer", "The referrer is not an allowed origin");
        }
        None => auth.referrer.clone().filter(|r| state.config.is_allowed_referrer(r)),
    };

    let redirect_uri = manager.default_redirect_uri();
    let context = auth
        .login_context(state.tools.exchange().reader(), referrer)
        .await;
    match manager
        .create_authorization_url(&redirect_uri, &params.audience, context)
        .await
    {
        Ok(url) => {
            info!(audience = %params.audience, "Redirecting to provider login");
            redirect(&url)
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /auth/callback?code&state
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        warn!(error = %error, "Provider returned an error to the callback");
        let description = params.error_description.unwrap_or_default();
        return bad_request(&error, &description);
    }
    let (Some(code), Some(login_state)) = (params.code, params.state) else {
        return bad_request("invalid_request", "Missing code or state");
    };

    let manager = state.tools.auth();
    let redirect_uri = manager.default_redirect_uri();
    match manager
        .read_callback_response(&code, &login_state, &redirect_uri)
        .await
    {
        Ok(outcome) => match outcome.referrer.filter(|r| state.config.is_allowed_referrer(r)) {
            Some(referrer) => redirect(&referrer),
            None => Json(json!({
                "audience": outcome.item.audience,
                "email": outcome.item.email,
            }))
            .into_response(),
        },
        Err(Error::Authorization(needed)) => bad_request("invalid_state", &needed.message),
        Err(e) => error_response(&e),
    }
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn bad_request(code: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": code, "error_description": message })),
    )
        .into_response()
}

/// OpenAI-style error body.
fn error_response(err: &Error) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        warn!(error = %err, "Request rejected");
    }
    (
        status,
        Json(json!({
            "error": {
                "message": err.to_string(),
                "type": err.error_type(),
                "code": status.as_u16(),
            }
        })),
    )
        .into_response()
}
