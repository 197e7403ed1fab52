//! HTTP API.

mod binary_cache;

use axum::Router;

pub(crate) fn get_router() -> Router {
    Router::new().merge(binary_cache::get_router())
}
