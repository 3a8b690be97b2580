use crate::aggregator::{Aggregator, AggregatorState};
use crate::cache::Cache;
use crate::collector::{SourceRegistry, SourceStatus};
use crate::config::Listener as ListenerConfig;
use crate::health::{self, HealthReport, HealthStatus};
use crate::metrics_defs::API_NEWS_REQUESTS;
use crate::types::{Item, MAX_ITEMS};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::counter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const API_VERSION: &str = "v1";
const SERVICE_NAME: &str = "InfoHub";
const DEFAULT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub aggregator: Aggregator,
    pub sources: SourceRegistry,
    pub cache: Arc<dyn Cache>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ApiError {
    #[error("Invalid limit parameter. Must be between 1 and 1000")]
    InvalidLimit,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
    version: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidLimit => StatusCode::BAD_REQUEST,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            version: API_VERSION,
        });

        (status, body).into_response()
    }
}

pub async fn bind(listener: &ListenerConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind(format!("{}:{}", listener.host, listener.port)).await
}

/// Serves the API until `shutdown` is cancelled, then stops accepting
/// connections and waits for in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api", get(api_info))
        .route("/api/v1/news", get(news_handler))
        .route("/api/v1/healthz", get(health_handler))
        .route("/api/v1/sources", get(sources_handler))
        .route("/news", get(|| async { moved_permanently("/api/v1/news") }))
        .route("/healthz", get(|| async { moved_permanently("/api/v1/healthz") }))
        .fallback(not_found)
        .with_state(state)
}

fn moved_permanently(location: &'static str) -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

#[derive(Deserialize, Debug)]
struct NewsParams {
    limit: Option<String>,
}

impl NewsParams {
    // `?limit=` with no value means the default.
    fn limit(&self) -> Result<usize, ApiError> {
        let Some(raw) = self.limit.as_deref().filter(|raw| !raw.is_empty()) else {
            return Ok(DEFAULT_LIMIT);
        };

        match raw.parse::<usize>() {
            Ok(limit) if (1..=MAX_ITEMS).contains(&limit) => Ok(limit),
            _ => Err(ApiError::InvalidLimit),
        }
    }
}

#[derive(Serialize)]
struct NewsResponse {
    count: usize,
    news: Vec<Item>,
    version: &'static str,
}

async fn news_handler(
    State(state): State<ApiState>,
    Query(params): Query<NewsParams>,
) -> Result<Json<NewsResponse>, ApiError> {
    let limit = match params.limit() {
        Ok(limit) => limit,
        Err(e) => {
            counter!(API_NEWS_REQUESTS, "status" => "400").increment(1);
            return Err(e);
        }
    };

    let news = state.aggregator.get_latest_news(limit);
    counter!(API_NEWS_REQUESTS, "status" => "200").increment(1);

    Ok(Json(NewsResponse {
        count: news.len(),
        news,
        version: API_VERSION,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    report: HealthReport,
    service: &'static str,
    version: &'static str,
}

async fn health_handler(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let report = health::run_checks(
        &state.aggregator,
        &state.sources,
        state.cache.as_ref(),
        health::CHECK_TIMEOUT,
    )
    .await;

    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        status,
        Json(HealthResponse {
            report,
            service: SERVICE_NAME,
            version: API_VERSION,
        }),
    )
}

#[derive(Serialize)]
struct SourcesResponse {
    count: usize,
    sources: Vec<SourceStatus>,
    version: &'static str,
}

async fn sources_handler(State(state): State<ApiState>) -> Json<SourcesResponse> {
    let sources = state.sources.list();
    Json(SourcesResponse {
        count: sources.len(),
        sources,
        version: API_VERSION,
    })
}

#[derive(Serialize)]
struct ApiInfo {
    service: &'static str,
    version: &'static str,
    endpoints: [&'static str; 3],
    items: usize,
    state: AggregatorState,
    timestamp: DateTime<Utc>,
}

async fn api_info(State(state): State<ApiState>) -> Json<ApiInfo> {
    Json(ApiInfo {
        service: SERVICE_NAME,
        version: API_VERSION,
        endpoints: ["/api/v1/news", "/api/v1/healthz", "/api/v1/sources"],
        items: state.aggregator.len(),
        state: state.aggregator.state(),
        timestamp: Utc::now(),
    })
}

#[derive(Serialize)]
struct NotFoundResponse {
    error: &'static str,
    code: u16,
    message: &'static str,
    path: String,
}

async fn not_found(uri: Uri) -> (StatusCode, Json<NotFoundResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            error: "Not Found",
            code: StatusCode::NOT_FOUND.as_u16(),
            message: "The requested endpoint does not exist",
            path: uri.path().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::types::Source;
    use crate::types::fixtures::item;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use url::Url;

    async fn state_with(items: Vec<Item>) -> ApiState {
        let aggregator = Aggregator::new(None);
        aggregator.merge(items).await;

        let source = Source::new("tech", Url::parse("https://tech.example.com/api").unwrap());
        ApiState {
            aggregator,
            sources: SourceRegistry::new(&[source]),
            cache: Arc::new(MemoryCache::new(
                Duration::from_secs(60),
                Duration::from_secs(60),
                10,
            )),
        }
    }

    async fn request(state: ApiState, uri: &str) -> (StatusCode, Response) {
        let response = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        (response.status(), response)
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_news_default_limit() {
        let items = (0..150).map(|i| item(&format!("n{i}"), i)).collect();
        let (status, response) = request(state_with(items).await, "/api/v1/news").await;

        assert_eq!(status, StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["count"], 100);
        assert_eq!(body["version"], "v1");
        assert_eq!(body["news"].as_array().unwrap().len(), 100);
        assert_eq!(body["news"][0]["id"], "n149");
    }

    #[tokio::test]
    async fn test_news_explicit_limit() {
        let state = state_with(vec![item("a", 1), item("b", 2), item("c", 3)]).await;

        let (status, response) = request(state.clone(), "/api/v1/news?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["news"][0]["id"], "c");
        assert_eq!(body["news"][1]["id"], "b");

        let (_, response) = request(state, "/api/v1/news?limit=1000").await;
        assert_eq!(json(response).await["count"], 3);
    }

    #[tokio::test]
    async fn test_news_invalid_limit() {
        let state = state_with(vec![item("a", 1)]).await;

        for limit in ["0", "-5", "1001", "abc", "1.5"] {
            let (status, response) =
                request(state.clone(), &format!("/api/v1/news?limit={limit}")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "limit={limit}");

            let body = json(response).await;
            assert_eq!(
                body["error"],
                "Invalid limit parameter. Must be between 1 and 1000"
            );
            assert_eq!(body["code"], 400);
            assert_eq!(body["version"], "v1");
        }
    }

    #[tokio::test]
    async fn test_news_empty_limit_uses_default() {
        let items = (0..150).map(|i| item(&format!("n{i}"), i)).collect();
        let (status, response) = request(state_with(items).await, "/api/v1/news?limit=").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(response).await["count"], 100);
    }

    #[tokio::test]
    async fn test_healthz() {
        let state = state_with(vec![]).await;
        let (results_tx, results_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let consumer = {
            let aggregator = state.aggregator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { aggregator.start(results_rx, errors_rx, shutdown).await })
        };
        while !state.aggregator.is_ready() {
            tokio::task::yield_now().await;
        }

        let (status, response) = request(state.clone(), "/api/v1/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "InfoHub");
        assert_eq!(body["version"], "v1");
        assert!(body["timestamp"].is_string());
        assert_eq!(body["checks"]["aggregator"]["status"], "healthy");
        assert_eq!(body["checks"]["cache"]["status"], "healthy");
        assert_eq!(body["checks"]["source_tech"]["status"], "healthy");

        // A failing source degrades the report but still answers 200
        let error = crate::collector::FetchError::Status(reqwest::StatusCode::BAD_GATEWAY);
        state.sources.record_failure("tech", &error);
        let (status, response) = request(state.clone(), "/api/v1/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "warning");
        assert_eq!(body["checks"]["source_tech"]["status"], "warning");

        shutdown.cancel();
        consumer.await.unwrap();
        drop((results_tx, errors_tx));

        let (status, response) = request(state, "/api/v1/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body = json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"]["aggregator"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_sources() {
        let state = state_with(vec![]).await;
        state.sources.record_success("tech", 4);

        let (status, response) = request(state, "/api/v1/sources").await;
        assert_eq!(status, StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sources"][0]["name"], "tech");
        assert_eq!(body["sources"][0]["last_item_count"], 4);
        assert_eq!(body["sources"][0]["consecutive_failures"], 0);
    }

    #[tokio::test]
    async fn test_api_info() {
        let (status, response) = request(state_with(vec![item("a", 1)]).await, "/api").await;
        assert_eq!(status, StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["service"], "InfoHub");
        assert_eq!(body["items"], 1);
        assert_eq!(body["endpoints"][0], "/api/v1/news");
    }

    #[tokio::test]
    async fn test_legacy_redirects() {
        let state = state_with(vec![]).await;

        let (status, response) = request(state.clone(), "/news").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/api/v1/news");

        let (status, response) = request(state, "/healthz").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/api/v1/healthz");
    }

    #[tokio::test]
    async fn test_not_found() {
        let (status, response) = request(state_with(vec![]).await, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = json(response).await;
        assert_eq!(body["error"], "Not Found");
        assert_eq!(body["code"], 404);
        assert_eq!(body["path"], "/nope");
    }

    #[tokio::test]
    async fn test_serve_graceful_shutdown() {
        let listener = bind(&ListenerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        })
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, state_with(vec![]).await, shutdown.clone()));

        let response = reqwest::get(format!("http://{addr}/api/v1/sources"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
