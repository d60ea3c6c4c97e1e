//! gRPC surface of the Jumpstarter control plane.
//!
//! Three services: [`ControllerService`](controller) (exporter registration,
//! liveness and listen streams, dialing, lease CRUD),
//! [`ClientService`](client_service) (resource-style v1 CRUD with AIP
//! naming), and the [`RouterService`](router) stream splice. The OIDC
//! well-known documents are served by a small axum router next to the tonic
//! server.

pub mod auth;
pub mod client_service;
pub mod config;
pub mod controller;
pub mod convert;
pub mod listen;
pub mod oidc_http;
pub mod router;

/// Generated protobuf types for `jumpstarter.v1`.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("jumpstarter.v1");
}

/// Generated protobuf types for `jumpstarter.client.v1`.
pub mod client_proto {
    #![allow(missing_docs)]
    tonic::include_proto!("jumpstarter.client.v1");
}

use std::sync::Arc;

use jumpstarter_auth::{oidc::RotatingKeyPair, Authenticator, Authorizer, TokenService};
use jumpstarter_runtime::Ctx;
use parking_lot::RwLock;

use config::RouterEndpoint;
use listen::ListenQueues;

/// Shared state behind every RPC handler.
pub struct State {
    pub ctx: Arc<Ctx>,
    pub tokens: Arc<TokenService>,
    pub authenticator: Authenticator,
    pub authorizer: Authorizer,
    pub listen: ListenQueues,
    pub routers: Vec<RouterEndpoint>,
    pub oidc: RwLock<RotatingKeyPair>,
    /// Namespace this controller instance serves.
    pub namespace: String,
}
