//! The jumpstarter-controller binary: store, reconcilers, gRPC services and
//! the OIDC well-known endpoints in one process.
use std::sync::Arc;

use jumpstarter_auth::{oidc::RotatingKeyPair, Authenticator, TokenService};
use jumpstarter_runtime::{
    controller::{run_exporter_controller, run_lease_controller},
    Ctx,
};
use jumpstarter_server::{
    client_proto::client_service_server::ClientServiceServer, config::{Config, EnvInputs},
    controller::Controller, listen::ListenQueues, oidc_http,
    proto::controller_service_server::ControllerServiceServer,
    proto::router_service_server::RouterServiceServer, router::Router, State,
};
use jumpstarter_store::Stores;
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

const GRPC_ADDR: &str = "0.0.0.0:8082";
const HTTP_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JUMPSTARTER_CONFIG").ok())
        .unwrap_or_else(|| "/etc/jumpstarter/config.yaml".to_string());
    let config = Config::load(&config_path)?;
    let env = EnvInputs::from_env()?;

    let issuer = format!("https://{}", env.grpc_endpoint);
    let tokens = Arc::new(TokenService::new(
        issuer.clone(),
        env.controller_key.as_bytes(),
        env.router_key.as_bytes(),
    ));

    let offline_timeout: std::time::Duration = config.exporter_options.offline_timeout.into();
    let ctx = Ctx::new(
        Stores::new(),
        chrono::Duration::from_std(offline_timeout)?,
    );
    tokio::spawn(run_lease_controller(ctx.clone()));
    tokio::spawn(run_exporter_controller(ctx.clone()));

    let state = Arc::new(State {
        ctx,
        tokens: tokens.clone(),
        authenticator: Authenticator::new(config.authentication.internal.prefix.clone()),
        authorizer: config.authorizer()?,
        listen: ListenQueues::new(),
        routers: config.router.values().cloned().collect(),
        oidc: RwLock::new(RotatingKeyPair::new(issuer)?),
        namespace: env.namespace.clone(),
    });

    let http = axum::serve(
        tokio::net::TcpListener::bind(HTTP_ADDR).await?,
        oidc_http::routes(state.clone()),
    );
    tokio::spawn(async move {
        if let Err(error) = http.await {
            tracing::error!(%error, "oidc http server failed");
        }
    });

    let mut server = tonic::transport::Server::builder();
    if let Some(params) = &config.grpc.keepalive.server_params {
        server = server
            .http2_keepalive_interval(Some(params.time.into()))
            .http2_keepalive_timeout(Some(params.timeout.into()));
    }

    info!(addr = GRPC_ADDR, namespace = %env.namespace, "serving");
    server
        .add_service(ControllerServiceServer::new(Controller::new(state.clone())))
        .add_service(ClientServiceServer::new(
            jumpstarter_server::client_service::ClientApi::new(state.clone()),
        ))
        .add_service(RouterServiceServer::new(Router::new(tokens)))
        .serve(GRPC_ADDR.parse()?)
        .await?;
    Ok(())
}
