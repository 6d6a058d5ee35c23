//! Manual-review HTTP surface: thin `axum` routing and JSON
//! (de)serialization over `MetadataStore` and `ManualResolveHandler` — no
//! business logic beyond what the handler already provides.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use barcode_core::{Detection, Image};
use barcode_engine::{ManualResolveHandler, ResolveAction};
use barcode_store::MetadataStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone)]
pub struct ReviewState {
    metadata_store: Arc<dyn MetadataStore>,
    resolver: Arc<ManualResolveHandler>,
}

impl ReviewState {
    pub fn new(metadata_store: Arc<dyn MetadataStore>) -> Self {
        let resolver = Arc::new(ManualResolveHandler::new(metadata_store.clone()));
        Self { metadata_store, resolver }
    }
}

pub fn router(state: ReviewState) -> Router {
    Router::new()
        .route("/api/images/review", get(list_review_candidates))
        .route("/api/images/:image_id", get(get_image))
        .route("/api/images/:image_id/resolve", post(resolve_image))
        .route("/api/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ReviewQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    batch_id: Option<String>,
}

fn default_limit() -> u32 {
    50
}

async fn list_review_candidates(
    State(state): State<ReviewState>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Vec<Image>>, StatusCode> {
    let images = state
        .metadata_store
        .list_images_for_review(query.batch_id.as_deref(), query.limit)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to list review candidates");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(images))
}

#[derive(Debug, Serialize)]
struct ImageWithDetections {
    #[serde(flatten)]
    image: Image,
    detections: Vec<Detection>,
}

async fn get_image(
    State(state): State<ReviewState>,
    Path(image_id): Path<String>,
) -> Result<Json<ImageWithDetections>, StatusCode> {
    let image = state.metadata_store.get_image(&image_id).await.map_err(|e| {
        tracing::warn!(image_id = %image_id, error = %e, "image not found");
        StatusCode::NOT_FOUND
    })?;
    let detections = state.metadata_store.list_detections(&image_id).await.map_err(|e| {
        tracing::error!(error = %e, "failed to list detections");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(ImageWithDetections { image, detections }))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    action: String,
    detection_id: Option<Uuid>,
    reviewer: Option<String>,
}

async fn resolve_image(
    State(state): State<ReviewState>,
    Path(image_id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> Result<StatusCode, StatusCode> {
    let action = match body.action.as_str() {
        "choose" => ResolveAction::Choose,
        "no_barcode" => ResolveAction::NoBarcode,
        "skip" => ResolveAction::Skip,
        other => {
            tracing::warn!(action = %other, "unknown resolve action");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    state
        .resolver
        .resolve(&image_id, action, body.detection_id, body.reviewer)
        .await
        .map_err(|e| {
            tracing::warn!(image_id = %image_id, error = %e, "resolve failed");
            if e.retriable() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            }
        })?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    batch_id: Option<String>,
}

async fn stats(
    State(state): State<ReviewState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<barcode_store::PipelineStats>, StatusCode> {
    let stats = state.metadata_store.stats(query.batch_id.as_deref()).await.map_err(|e| {
        tracing::error!(error = %e, "failed to compute stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use barcode_core::ImageStatus;
    use barcode_store::InMemoryMetadataStore;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let router = router(ReviewState::new(store.clone()));
        (router, store)
    }

    #[tokio::test]
    async fn get_image_returns_404_for_unknown_id() {
        let (app, _store) = app();
        let response = app
            .oneshot(Request::builder().uri("/api/images/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_endpoint_returns_ok() {
        let (app, store) = app();
        store
            .insert_image(Image::new("img-1", "b1", "p.jpg"))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn resolve_with_unknown_action_is_bad_request() {
        let (app, store) = app();
        let mut image = Image::new("img-1", "b1", "p.jpg");
        image.status = ImageStatus::ManualReview;
        store.insert_image(image).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/images/img-1/resolve")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"action":"bogus"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
