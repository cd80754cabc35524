// Main entry point for the image studio service

use image_studio::{
    core::{
        types::{FitMode, PanelScript, Position, ReplaceOptions},
        Config, ErrorKind, PipelineError,
    },
    middleware::{caller_key, RateDecision, RateLimiter},
    orchestration::Studio,
    pipelines::{
        clarity, enhance::DEFAULT_SCALE, BeautifyRequest, ClarityRequest, ComicGenerationRequest,
        ComicPageRequest, EnhanceRequest, RelightOptions, RelightRequest, ReplaceBackgroundRequest,
        RestyleRequest, Style,
    },
    services::storage::content_type_for,
};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, ConnectInfo, DefaultBodyLimit, MatchedPath, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

const SCOPE_HEADER: &str = "x-cache-scope";
const API_KEY_HEADERS: [&str; 2] = ["x-api-key", "x-client-key"];

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    studio: Arc<Studio>,
    rate_limiter: Arc<RateLimiter>,
}

/// Error body returned by every handler
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
        ErrorKind::TransientUpstream => (StatusCode::SERVICE_UNAVAILABLE, "transient_upstream"),
        ErrorKind::UpstreamFailed => (StatusCode::BAD_GATEWAY, "upstream_failed"),
        ErrorKind::UpstreamCanceled => (StatusCode::BAD_GATEWAY, "upstream_canceled"),
        ErrorKind::TimedOut => (StatusCode::GATEWAY_TIMEOUT, "timed_out"),
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let (status, kind) = status_for(err.kind());
        if status.is_server_error() {
            error!("Request failed ({}): {}", kind, err);
        } else {
            warn!("Request rejected ({}): {}", kind, err);
        }
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "image_studio={},tower_http=warn",
            config.log_level().as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== IMAGE STUDIO ===");
    info!(
        "Pools: light={} heavy={} batch={} | retry: {}x from {:?} | cache: {} entries, ttl {:?}",
        config.concurrency.light,
        config.concurrency.heavy,
        config.concurrency.batch,
        config.retry.max_attempts,
        config.retry.base_delay,
        config.cache.max_entries,
        config.cache.ttl
    );
    if !config.has_api_token() {
        warn!("REPLICATE_API_TOKEN missing: every model call will fail");
    }

    let studio = Arc::new(Studio::new(config.clone())?);
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let state = AppState { studio, rate_limiter };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Feature routes start upstream jobs and are rate limited per caller
    let features = Router::new()
        .route("/replace-background", post(replace_background))
        .route("/comic/page", post(comic_page))
        .route("/comic/generate", post(comic_generate))
        .route("/enhance", post(enhance))
        .route("/beautify", post(beautify))
        .route("/clarity", post(clarity_upscale))
        .route("/restyle", post(restyle))
        .route("/relight", post(relight))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), rate_limit));

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/blobs/{*key}", get(serve_blob))
        .merge(features)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.body_limit_mb * 1024 * 1024))
        .layer(TimeoutLayer::new(config.server.request_timeout))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                    - Root endpoint");
    info!("  GET  /health              - Health check");
    info!("  GET  /metrics             - Prometheus metrics");
    info!("  GET  /stats               - Pools, cache and metrics (JSON)");
    info!("  POST /replace-background  - Cut out and composite (multipart)");
    info!("  POST /comic/page          - Compose a comic page (multipart)");
    info!("  POST /comic/generate      - Generate a comic from a prompt (JSON)");
    info!("  POST /enhance             - Restore / upscale an image (multipart)");
    info!("  POST /beautify            - Restore, upscale and tone a portrait (multipart)");
    info!("  POST /clarity             - Super-resolution upscale (multipart)");
    info!("  POST /restyle             - Redraw in an art style (multipart)");
    info!("  POST /relight             - Relight a portrait (multipart)");
    info!("  GET  /blobs/*key          - Presigned blob download");
    info!(
        "Rate limit: {} requests / {:?} per caller and route ({} overrides)",
        config.rate_limit.max_requests,
        config.rate_limit.window,
        config.rate_limit.route_limits.len()
    );
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Image Studio - hosted model orchestration and compositing"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_host_configured": state.studio.config().has_api_token(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.studio.metrics().to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    serde_json::to_value(state.studio.stats())
        .map(Json)
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: format!("Failed to serialize stats: {}", e),
        })
}

/// Scope token from the request headers; blank values count as missing
fn cache_scope(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SCOPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Caller identity for rate limiting: API key header or bearer token, else
/// the peer address
fn request_caller(request: &Request<Body>) -> String {
    let headers = request.headers();
    let api_key = API_KEY_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .or_else(|| headers.get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    caller_key(api_key, addr)
}

/// Sliding-window limit per caller and route; 429 with `Retry-After` when exceeded
async fn rate_limit(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let caller = request_caller(&request);

    match state.rate_limiter.check(&caller, &route) {
        RateDecision::Allowed { .. } => next.run(request).await,
        RateDecision::Limited { retry_after } => {
            state.studio.metrics().record_endpoint_request("rate_limited");
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            let mut response = ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                kind: "rate_limited",
                message: format!("Too many requests to {}; retry in {}s", route, secs),
            }
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Accepts 0/1 as well as true/false
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Collect every multipart field as (name, bytes)
async fn read_fields(mut multipart: Multipart) -> Result<Vec<(String, Vec<u8>)>, ApiError> {
    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Read error for '{}': {}", name, e)))?;
        fields.push((name, data.to_vec()));
    }
    Ok(fields)
}

fn take_field(fields: &mut Vec<(String, Vec<u8>)>, name: &str) -> Option<Vec<u8>> {
    let index = fields.iter().position(|(n, _)| n == name)?;
    Some(fields.swap_remove(index).1)
}

/// Text form field, trimmed; blank counts as missing
fn take_text(fields: &mut Vec<(String, Vec<u8>)>, name: &str) -> Result<Option<String>, ApiError> {
    let Some(data) = take_field(fields, name) else {
        return Ok(None);
    };
    let text = String::from_utf8(data).map_err(|_| ApiError::bad_request(format!("'{}' must be UTF-8 text", name)))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// The `image` upload every single-image feature takes
async fn read_image(multipart: Multipart) -> Result<(Vec<u8>, Vec<(String, Vec<u8>)>), ApiError> {
    let mut fields = read_fields(multipart).await?;
    let image = take_field(&mut fields, "image").ok_or_else(|| ApiError::bad_request("Missing 'image' file"))?;
    Ok((image, fields))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceQuery {
    fit: Option<String>,
    position: Option<String>,
    feather_px: Option<u32>,
    shadow: Option<String>,
    sign_ttl: Option<u64>,
}

impl ReplaceQuery {
    fn into_options(self) -> Result<ReplaceOptions, ApiError> {
        let defaults = ReplaceOptions::default();
        let fit = match self.fit {
            Some(fit) => fit.parse::<FitMode>().map_err(|e| ApiError::bad_request(e.to_string()))?,
            None => defaults.fit,
        };
        let position = match self.position {
            Some(position) => position
                .parse::<Position>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
            None => defaults.position,
        };
        let add_shadow = match self.shadow {
            Some(shadow) => parse_flag(&shadow)
                .ok_or_else(|| ApiError::bad_request(format!("shadow must be 0 or 1, got '{}'", shadow)))?,
            None => defaults.add_shadow,
        };

        Ok(ReplaceOptions {
            fit,
            position,
            feather_px: self.feather_px.unwrap_or(defaults.feather_px),
            add_shadow,
            sign_ttl_secs: self.sign_ttl.unwrap_or(defaults.sign_ttl_secs),
        })
    }
}

/// Background replacement
///
/// # Request Format:
/// - multipart/form-data with `foreground` and `background` image files
/// - query: `fit`, `position`, `featherPx` (0-20), `shadow` (0|1), `signTtl` (60-86400)
async fn replace_background(
    State(state): State<AppState>,
    Query(query): Query<ReplaceQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("replace_background");

    let options = query.into_options()?;
    let mut fields = read_fields(multipart).await?;
    let foreground = take_field(&mut fields, "foreground")
        .ok_or_else(|| ApiError::bad_request("Missing 'foreground' image"))?;
    let background = take_field(&mut fields, "background")
        .ok_or_else(|| ApiError::bad_request("Missing 'background' image"))?;

    let delivery = state
        .studio
        .replace_background(ReplaceBackgroundRequest {
            foreground,
            background,
            options,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

/// Comic page composition
///
/// # Request Format:
/// - multipart/form-data, one `images` field per panel (reading order)
/// - optional `panels` field: JSON array of `{dialogue, speaker}`
async fn comic_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("comic_page");

    let mut images = Vec::new();
    let mut panels: Vec<PanelScript> = Vec::new();
    for (name, data) in read_fields(multipart).await? {
        match name.as_str() {
            "images" => images.push(data),
            "panels" => {
                panels = serde_json::from_slice(&data)
                    .map_err(|e| ApiError::bad_request(format!("Invalid panels JSON: {}", e)))?;
            }
            _ => {}
        }
    }

    let delivery = state
        .studio
        .compose_comic_page(ComicPageRequest {
            images,
            panels,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

/// Comic generation from a text prompt (JSON body)
async fn comic_generate(
    State(state): State<AppState>,
    Json(request): Json<ComicGenerationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("comic_generate");

    let started = std::time::Instant::now();
    let comic = state.studio.generate_comic(request).await?;
    info!("Comic {} ready in {:.2}s", comic.comic_id, started.elapsed().as_secs_f64());

    Ok(Json(comic))
}

#[derive(Debug, Default, Deserialize)]
struct EnhanceQuery {
    scale: Option<u32>,
}

/// Single-image enhancement: multipart `image`, query `scale` (1-4)
async fn enhance(
    State(state): State<AppState>,
    Query(query): Query<EnhanceQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("enhance");

    let (image, _) = read_image(multipart).await?;

    let delivery = state
        .studio
        .enhance(EnhanceRequest {
            image,
            scale: query.scale.unwrap_or(DEFAULT_SCALE),
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

/// Portrait beautification: multipart `image`
async fn beautify(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("beautify");

    let (image, _) = read_image(multipart).await?;
    let delivery = state
        .studio
        .beautify(BeautifyRequest {
            image,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClarityQuery {
    scale: Option<u32>,
    face_enhance: Option<String>,
}

/// Super-resolution upscale: multipart `image`, query `scale` (2|4), `faceEnhance` (0|1)
async fn clarity_upscale(
    State(state): State<AppState>,
    Query(query): Query<ClarityQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("clarity");

    let face_enhance = match query.face_enhance {
        Some(flag) => parse_flag(&flag)
            .ok_or_else(|| ApiError::bad_request(format!("faceEnhance must be 0 or 1, got '{}'", flag)))?,
        None => false,
    };
    let (image, _) = read_image(multipart).await?;
    let delivery = state
        .studio
        .clarity(ClarityRequest {
            image,
            scale: query.scale.unwrap_or(clarity::DEFAULT_SCALE),
            face_enhance,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

/// Art-style redraw: multipart `image`, `style`, optional `extra`
async fn restyle(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("restyle");

    let (image, mut fields) = read_image(multipart).await?;
    let style: Style = take_text(&mut fields, "style")?
        .ok_or_else(|| ApiError::bad_request("Missing 'style' field"))?
        .parse()?;
    let extra = take_text(&mut fields, "extra")?;

    let delivery = state
        .studio
        .restyle(RestyleRequest {
            image,
            style,
            extra,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

/// Portrait relighting: multipart `image`, model options as query parameters
async fn relight(
    State(state): State<AppState>,
    query: Result<Query<RelightOptions>, QueryRejection>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("relight");

    let Query(options) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let (image, _) = read_image(multipart).await?;
    let delivery = state
        .studio
        .relight(RelightRequest {
            image,
            options,
            scope: cache_scope(&headers),
        })
        .await?;

    Ok(Json(delivery))
}

#[derive(Debug, Deserialize)]
struct BlobQuery {
    expires: u64,
    sig: String,
}

/// Presigned download of a locally stored blob
async fn serve_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.studio.metrics().record_endpoint_request("blobs");

    let store = state
        .studio
        .local_store()
        .ok_or_else(|| ApiError::not_found("Blobs are not served by this instance"))?;

    store.verify(&key, query.expires, &query.sig).map_err(|e| ApiError {
        status: StatusCode::FORBIDDEN,
        kind: "forbidden",
        message: e.to_string(),
    })?;
    let bytes = store
        .read(&key)
        .await
        .map_err(|_| ApiError::not_found(format!("No blob at {}", key)))?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&key))], bytes))
}
