//! HTTP trigger surface for the carwatch worker.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use carwatch_sync::SearchPool;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pool: SearchPool,
    /// Required bearer token for trigger routes. `None` leaves them open.
    pub token: Option<String>,
}

impl AppState {
    pub fn new(pool: SearchPool, token: Option<String>) -> Self {
        Self { pool, token }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == expected)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/trigger/{search_id}", post(trigger_handler))
        .route("/trigger-all", post(trigger_all_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "installing ctrl-c handler failed");
            }
            info!("shutting down trigger server");
        })
        .await?;
    Ok(())
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Response {
    if !state.authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Ok(id) = Uuid::parse_str(&search_id) else {
        return error_body(StatusCode::BAD_REQUEST, "Invalid search id");
    };
    info!(search_id = %id, "scrape triggered");
    state.pool.enqueue(id);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Scrape started", "searchId": id })),
    )
        .into_response()
}

async fn trigger_all_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    info!("scrape of all active searches triggered");
    state.pool.enqueue_all();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Scrape started for all active searches" })),
    )
        .into_response()
}

async fn not_found_handler() -> Response {
    error_body(StatusCode::NOT_FOUND, "Not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use carwatch_adapters::{AdapterRegistry, FixtureAdapter};
    use carwatch_core::{SavedSearch, ScrapeStatus, ScrapedRecord, SiteKey};
    use carwatch_storage::{CatalogStore, MemoryStore};
    use carwatch_sync::{LogMailer, Notifier, ScrapeOrchestrator};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    async fn fixture() -> (Arc<MemoryStore>, SavedSearch, Router) {
        let store = Arc::new(MemoryStore::new());
        let search = SavedSearch::new(Uuid::new_v4(), "Nissan", "Skyline GT-R", 1989, 1999);
        store.insert_search(search.clone()).await;
        let adapters = AdapterRegistry::new().with(FixtureAdapter::records(
            SiteKey::Autotrader,
            vec![ScrapedRecord::new(
                SiteKey::Autotrader,
                "https://www.autotrader.com/cars-for-sale/vehicle/777",
                "1995 Nissan Skyline GT-R V-Spec",
                9_000_000,
            )],
        ));
        let notifier = Notifier::new(store.clone(), store.clone(), Arc::new(LogMailer));
        let pool = SearchPool::new(ScrapeOrchestrator::new(store.clone(), adapters, notifier), 2);
        let router = app(AppState::new(pool, Some(TOKEN.to_string())));
        (store, search, router)
    }

    fn post(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let (_, _, router) = fixture().await;
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn trigger_requires_bearer_token() {
        let (_, search, router) = fixture().await;
        let uri = format!("/trigger/{}", search.id);

        let missing = router.clone().oneshot(post(&uri, None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(missing).await, json!({ "error": "Unauthorized" }));

        let wrong = router.clone().oneshot(post(&uri, Some("nope"))).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let all = router.oneshot(post("/trigger-all", None)).await.unwrap();
        assert_eq!(all.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_accepts_and_runs_in_background() {
        let (store, search, router) = fixture().await;
        let resp = router
            .oneshot(post(&format!("/trigger/{}", search.id), Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = json_body(resp).await;
        assert_eq!(body["message"], "Scrape started");
        assert_eq!(body["searchId"], search.id.to_string());

        let mut status = ScrapeStatus::Idle;
        for _ in 0..100 {
            status = store.search(search.id).await.unwrap().unwrap().scrape_status;
            if status == ScrapeStatus::Complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ScrapeStatus::Complete);
        assert_eq!(store.all_listings().await.len(), 1);
    }

    #[tokio::test]
    async fn trigger_all_is_accepted() {
        let (_, _, router) = fixture().await;
        let resp = router.oneshot(post("/trigger-all", Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn malformed_search_id_is_rejected() {
        let (_, _, router) = fixture().await;
        let resp = router.oneshot(post("/trigger/not-a-uuid", Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_routes_are_json_404() {
        let (_, _, router) = fixture().await;
        let resp = router
            .oneshot(Request::builder().uri("/listings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await, json!({ "error": "Not found" }));
    }
}
