use axum::http::StatusCode;
use serde::Deserialize;

use smfg_core::Page;
use smfg_inventory::Product;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Query string of `GET /inventory/v1`. Kept as text so bad numbers get a JSON 400.
#[derive(Debug, Default, Deserialize)]
pub struct ListProductsQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// Body of `POST /inventory/v1`. Counters are not accepted; new products start at zero.
#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub upc: String,
    #[serde(default)]
    pub name: String,
}

impl CreateProductRequest {
    pub fn into_product(self) -> Result<Product, axum::response::Response> {
        for (field, value) in [("sku", &self.sku), ("upc", &self.upc), ("name", &self.name)] {
            if value.trim().is_empty() {
                return Err(errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("{field} is required"),
                ));
            }
        }
        Ok(Product::new(self.sku, self.upc, self.name))
    }
}

// -------------------------
// Query parsing
// -------------------------

pub fn parse_page(query: &ListProductsQuery) -> Result<Page, axum::response::Response> {
    let limit = parse_u32("limit", query.limit.as_deref())?;
    let offset = parse_u32("offset", query.offset.as_deref())?;
    Page::new(limit, offset)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()))
}

fn parse_u32(name: &str, raw: Option<&str>) -> Result<Option<u32>, axum::response::Response> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| {
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("{name} must be a non-negative integer"),
            )
        }),
    }
}
