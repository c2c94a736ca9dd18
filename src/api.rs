//! HTTP API for lead attribution.

use crate::config::Config;
use crate::crm::ContactDirectory;
use crate::error::AttributionError;
use crate::models::{ReengagementRequest, WhatsAppLead};
use crate::reengagement::apply_reengagement;
use crate::whatsapp::process_whatsapp_lead;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Semaphore;
use warp::{Filter, Rejection, Reply, http::StatusCode};

/// Largest JSON body accepted by the POST endpoints.
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Error and health response body.
#[derive(Serialize, Deserialize, Debug)]
struct ApiResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error,
        }
    }
}

/// Wraps an `AttributionError` so it can travel through warp as a rejection.
#[derive(Debug)]
struct ApiError(AttributionError);

impl warp::reject::Reject for ApiError {}

fn status_for(err: &AttributionError) -> StatusCode {
    match err {
        AttributionError::Malformed(_) | AttributionError::MissingIdentifier => StatusCode::BAD_REQUEST,
        AttributionError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_permit(
    semaphore: Arc<Semaphore>,
) -> impl Filter<Extract = (tokio::sync::OwnedSemaphorePermit,), Error = Rejection> + Clone {
    warp::any().and_then(move || {
        let semaphore = semaphore.clone();
        async move {
            semaphore.acquire_owned().await.map_err(|_| {
                warp::reject::custom(ApiError(AttributionError::Generic(anyhow::anyhow!(
                    "Request limiter closed"
                ))))
            })
        }
    })
}

/// Builds the full route tree.
pub(crate) fn routes<D>(
    directory: Arc<D>,
    config: Arc<Config>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone
where
    D: ContactDirectory + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
    let directory_filter = warp::any().map(move || directory.clone());
    let config_filter = warp::any().map(move || config.clone());

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&ApiResponse {
            success: true,
            message: "Lead attribution API is running".to_string(),
            error: None,
        })
    });

    let whatsapp = warp::path!("api" / "v3" / "push-whatsapp-lead")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(directory_filter.clone())
        .and(config_filter.clone())
        .and(with_permit(semaphore.clone()))
        .and_then(handle_whatsapp_lead::<D>);

    let reengagement = warp::path!("api" / "v3" / "track-reengagement")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(directory_filter)
        .and(config_filter)
        .and(with_permit(semaphore))
        .and_then(handle_reengagement::<D>);

    health
        .or(whatsapp)
        .or(reengagement)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "OPTIONS"])
                .allow_header("content-type"),
        )
        .recover(handle_rejection)
}

/// Start the API server
pub(crate) async fn start_api_server<D>(directory: Arc<D>, config: Arc<Config>) -> anyhow::Result<()>
where
    D: ContactDirectory + 'static,
{
    let port = config.server_port;
    tracing::info!("Starting API server on port {}", port);
    warp::serve(routes(directory, config)).run(([0, 0, 0, 0], port)).await;
    Ok(())
}

async fn handle_whatsapp_lead<D: ContactDirectory>(
    lead: WhatsAppLead,
    directory: Arc<D>,
    config: Arc<Config>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> Result<impl Reply, Rejection> {
    tracing::info!("Processing WhatsApp lead for course '{}'", lead.course_name);
    let outcome = process_whatsapp_lead(&lead, directory.as_ref(), &config, Utc::now())
        .await
        .map_err(|e| warp::reject::custom(ApiError(e)))?;
    Ok(warp::reply::json(&outcome))
}

async fn handle_reengagement<D: ContactDirectory>(
    request: ReengagementRequest,
    directory: Arc<D>,
    config: Arc<Config>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> Result<impl Reply, Rejection> {
    let response = apply_reengagement(directory.as_ref(), &request, &config.country_code, Utc::now())
        .await
        .map_err(|e| warp::reject::custom(ApiError(e)))?;
    Ok(warp::reply::json(&response))
}

/// Handle API rejections
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, ApiResponse::failure("Not Found", None))
    } else if let Some(ApiError(e)) = err.find::<ApiError>() {
        let status = status_for(e);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", e);
            (status, ApiResponse::failure("Server error", Some(e.to_string())))
        } else {
            (status, ApiResponse::failure(e.to_string(), None))
        }
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            ApiResponse::failure("Invalid request body", Some(e.to_string())),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ApiResponse::failure("Method not allowed", None),
        )
    } else {
        (StatusCode::BAD_REQUEST, ApiResponse::failure("Bad request", None))
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whatsapp::tests::{FakeDirectory, contact};
    use serde_json::{Value, json};

    fn api(directory: FakeDirectory) -> (Arc<FakeDirectory>, impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone) {
        let directory = Arc::new(directory);
        let filter = routes(directory.clone(), Arc::new(Config::default()));
        (directory, filter)
    }

    fn body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, filter) = api(FakeDirectory::default());
        let response = warp::test::request().method("GET").path("/health").reply(&filter).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["success"], true);
    }

    #[tokio::test]
    async fn test_push_whatsapp_lead_creates_contact() {
        let (directory, filter) = api(FakeDirectory::default());
        let response = warp::test::request()
            .method("POST")
            .path("/api/v3/push-whatsapp-lead")
            .json(&json!({
                "firstName": "Jane",
                "lastName": "Wanjiru",
                "phone": "0711486581",
                "courseName": "Film Production"
            }))
            .reply(&filter)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body(&response);
        assert_eq!(json["success"], true);
        assert_eq!(json["isNew"], true);
        assert_eq!(json["attributionData"]["utm_source"], "whatsapp");
        assert_eq!(directory.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_whatsapp_lead_validation_error() {
        let (_, filter) = api(FakeDirectory::default());
        let response = warp::test::request()
            .method("POST")
            .path("/api/v3/push-whatsapp-lead")
            .json(&json!({ "firstName": "Jane", "lastName": "", "phone": "0711486581", "courseName": "Film" }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&response)["success"], false);
    }

    #[tokio::test]
    async fn test_track_reengagement_statuses() {
        let (directory, filter) = api(FakeDirectory::with_contact(contact(8, json!({}))));

        let ok = warp::test::request()
            .method("POST")
            .path("/api/v3/track-reengagement")
            .json(&json!({
                "email": "contact8@example.com",
                "ga_client_id": "1234567890.9876543210",
                "reengagement_source": "chat"
            }))
            .reply(&filter)
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body(&ok)["contact"]["attributionUpdated"], true);
        assert_eq!(directory.updates.lock().unwrap().len(), 1);

        let missing = warp::test::request()
            .method("POST")
            .path("/api/v3/track-reengagement")
            .json(&json!({ "email": "nobody@example.com", "ga_client_id": "1.2" }))
            .reply(&filter)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = warp::test::request()
            .method("POST")
            .path("/api/v3/track-reengagement")
            .json(&json!({ "ga_client_id": "1.2" }))
            .reply(&filter)
            .await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_crm_write_failure_is_server_error() {
        let (_, filter) = api(FakeDirectory {
            fail_writes: true,
            ..FakeDirectory::default()
        });
        let response = warp::test::request()
            .method("POST")
            .path("/api/v3/push-whatsapp-lead")
            .json(&json!({ "firstName": "Jane", "lastName": "Wanjiru", "phone": "0711486581", "courseName": "Film" }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response)["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (_, filter) = api(FakeDirectory::default());
        let response = warp::test::request()
            .method("POST")
            .path("/api/v3/push-whatsapp-lead")
            .body("not json")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&response)["message"], "Invalid request body");
    }
}
