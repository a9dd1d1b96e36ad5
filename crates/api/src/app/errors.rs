use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use smfg_infra::AllocationError;

pub fn allocation_error_to_response(err: AllocationError) -> axum::response::Response {
    match err {
        AllocationError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        AllocationError::NotFound { sku } => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("product {sku} not found"),
        ),
        AllocationError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        AllocationError::AlreadyExists { sku } => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("product {sku} already exists"),
        ),
        AllocationError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        AllocationError::Storage {
            step,
            sku,
            request_id,
            source,
        } => {
            // Storage detail stays in the log; callers get the correlation context only.
            tracing::error!(step, sku = %sku, request_id = %request_id, error = %source, "storage failure");
            let mut message = format!("internal error during {step}");
            if !sku.is_empty() {
                message.push_str(&format!(" (sku {sku}"));
                if !request_id.is_empty() {
                    message.push_str(&format!(", request {request_id}"));
                }
                message.push(')');
            }
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
