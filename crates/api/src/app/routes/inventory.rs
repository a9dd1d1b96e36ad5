use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use smfg_infra::SweepOutcome;
use smfg_inventory::{ProductionRequest, ReservationRequest};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route("/:sku", get(get_product))
        .route("/:sku/productionEvent", post(create_production_event))
        .route("/:sku/reservation", post(create_reservation))
}

fn bad_body(rejection: JsonRejection) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

fn log_sweep(sku: &str, sweep: &SweepOutcome) {
    if let SweepOutcome::Aborted(e) = sweep {
        tracing::warn!(sku, error = %e, "request committed but fulfillment sweep stopped early");
    }
}

pub async fn list_products(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListProductsQuery>,
) -> axum::response::Response {
    let page = match dto::parse_page(&query) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services.get_all_products(page).await {
        Ok(products) => Json(products).into_response(),
        Err(e) => errors::allocation_error_to_response(e),
    }
}

pub async fn create_product(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateProductRequest>, JsonRejection>,
) -> axum::response::Response {
    let product = match body.map_err(bad_body).and_then(|Json(b)| b.into_product()) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services.register_product(product).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => errors::allocation_error_to_response(e),
    }
}

pub async fn get_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(sku): Path<String>,
) -> axum::response::Response {
    match services.get_product(&sku).await {
        Ok(product) => Json(product).into_response(),
        Err(e) => errors::allocation_error_to_response(e),
    }
}

pub async fn create_production_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(sku): Path<String>,
    body: Result<Json<ProductionRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(rejection) => return bad_body(rejection),
    };

    match services.produce(&sku, request).await {
        Ok(outcome) => {
            log_sweep(&sku, &outcome.sweep);
            (StatusCode::CREATED, Json(outcome.event)).into_response()
        }
        Err(e) => errors::allocation_error_to_response(e),
    }
}

pub async fn create_reservation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(sku): Path<String>,
    body: Result<Json<ReservationRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(rejection) => return bad_body(rejection),
    };

    match services.reserve(&sku, request).await {
        Ok(outcome) => {
            log_sweep(&sku, &outcome.sweep);
            (StatusCode::CREATED, Json(outcome.reservation)).into_response()
        }
        Err(e) => errors::allocation_error_to_response(e),
    }
}
