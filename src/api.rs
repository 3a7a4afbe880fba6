//! HTTP front end
//!
//! Maps requests onto [`VaultService`]. No rotation logic lives here.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::backends::RotationJob;
use crate::error::VaultError;
use crate::service::VaultService;

const RETRIEVED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let (error_kind, message) = match self {
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::NotFound(msg) => ("not_found", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
        };

        (
            status,
            Json(ErrorBody {
                error: error_kind.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidInput(msg) => ApiError::BadRequest(msg),
            VaultError::AlreadyExists(_) => ApiError::Conflict("Username already exists".to_string()),
            VaultError::NotFound(_) => ApiError::NotFound("Credential not found".to_string()),
            VaultError::Store(e) => {
                error!("Store error while serving request: {}", e);
                ApiError::Internal("Database error".to_string())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub username: String,
    pub password: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub username: String,
    pub password: String,
    pub retrieved_time: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_due_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<VaultService>,
}

pub fn build_router(service: Arc<VaultService>) -> Router {
    Router::new()
        .route("/create", post(create_handler))
        .route("/retrieve/", get(missing_username_handler).post(missing_username_handler))
        .route(
            "/retrieve/{username}",
            get(retrieve_handler).post(retrieve_handler),
        )
        .route("/rotations/{username}", get(rotations_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { service })
}

async fn create_handler(
    State(state): State<ApiState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::BadRequest("Invalid JSON".to_string()))?;

    let record = state
        .service
        .create_credential(&request.username, &request.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            username: record.username,
            password: record.password,
            message: "Credential created successfully".to_string(),
        }),
    ))
}

async fn retrieve_handler(
    State(state): State<ApiState>,
    Path(username): Path<String>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    let retrieval = state.service.retrieve_credential(&username).await?;

    Ok(Json(RetrieveResponse {
        username: retrieval.username,
        password: retrieval.password,
        retrieved_time: retrieval
            .retrieved_at
            .format(RETRIEVED_TIME_FORMAT)
            .to_string(),
        version: retrieval.version,
        rotation_due_at: retrieval.rotation_due_at,
    }))
}

async fn missing_username_handler() -> ApiError {
    ApiError::BadRequest("Username is required in path".to_string())
}

async fn rotations_handler(
    State(state): State<ApiState>,
    Path(username): Path<String>,
) -> Result<Json<Vec<RotationJob>>, ApiError> {
    Ok(Json(state.service.rotation_history(&username).await?))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Stores;
    use crate::config::RotationConfig;
    use crate::scheduler::RotationScheduler;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let stores = Stores::in_memory();
        let scheduler = Arc::new(RotationScheduler::new(&stores, &RotationConfig::default()));
        let service = Arc::new(VaultService::new(
            stores.credentials.clone(),
            stores.jobs.clone(),
            scheduler,
            Duration::from_secs(10),
        ));
        build_router(service)
    }

    fn create_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/create")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_returns_created() {
        let response = app()
            .oneshot(create_request(r#"{"username":"alice","password":"Init@123"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: CreateResponse = body_json(response).await;
        assert_eq!(body.username, "alice");
        assert_eq!(body.message, "Credential created successfully");
    }

    #[tokio::test]
    async fn test_duplicate_create_returns_conflict() {
        let app = app();
        let body = r#"{"username":"alice","password":"Init@123"}"#;
        let first = app.clone().oneshot(create_request(body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app.oneshot(create_request(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let error: ErrorBody = body_json(second).await;
        assert_eq!(error.error, "conflict");
    }

    #[tokio::test]
    async fn test_invalid_create_bodies_are_bad_requests() {
        for body in ["not json", r#"{"username":"alice"}"#, r#"{"username":"","password":"x"}"#] {
            let response = app().oneshot(create_request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        }
    }

    #[tokio::test]
    async fn test_create_requires_post() {
        let response = app().oneshot(get_request("/create")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_retrieve_returns_password() {
        let app = app();
        app.clone()
            .oneshot(create_request(r#"{"username":"alice","password":"Init@123"}"#))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/retrieve/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: RetrieveResponse = body_json(response).await;
        assert_eq!(body.username, "alice");
        assert_eq!(body.password, "Init@123");
        assert_eq!(body.version, 1);
        assert!(body.retrieved_time.ends_with(" UTC"));
        assert!(body.rotation_due_at.is_some());
    }

    #[tokio::test]
    async fn test_retrieve_decodes_escaped_username() {
        let app = app();
        app.clone()
            .oneshot(create_request(r#"{"username":"team/alice","password":"Init@123"}"#))
            .await
            .unwrap();

        let response = app
            .oneshot(get_request("/retrieve/team%2Falice"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: RetrieveResponse = body_json(response).await;
        assert_eq!(body.username, "team/alice");
    }

    #[tokio::test]
    async fn test_retrieve_unknown_returns_not_found() {
        let response = app().oneshot(get_request("/retrieve/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retrieve_without_username_is_bad_request() {
        let response = app().oneshot(get_request("/retrieve/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rotations_lists_scheduled_job() {
        let app = app();
        app.clone()
            .oneshot(create_request(r#"{"username":"alice","password":"Init@123"}"#))
            .await
            .unwrap();
        app.clone()
            .oneshot(get_request("/retrieve/alice"))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/rotations/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<RotationJob> = body_json(response).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].based_on_version, 1);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: HealthResponse = body_json(response).await;
        assert_eq!(body.status, "healthy");
    }
}
