//! The two OIDC well-known documents, served over plain HTTP next to the
//! gRPC listener. TLS terminates at the fronting edge.
use std::sync::Arc;

use axum::{extract::State as AxumState, routing::get, Json, Router};
use serde_json::Value;

use crate::State;

pub fn routes(state: Arc<State>) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks", get(jwks))
        .with_state(state)
}

async fn discovery(AxumState(state): AxumState<Arc<State>>) -> Json<Value> {
    Json(state.oidc.read().discovery_document())
}

async fn jwks(AxumState(state): AxumState<Arc<State>>) -> Json<Value> {
    Json(state.oidc.read().jwks())
}
