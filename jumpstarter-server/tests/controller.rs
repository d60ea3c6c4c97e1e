//! RPC-surface tests for the controller service against the in-memory store.
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use jumpstarter_auth::{oidc::RotatingKeyPair, Authenticator, Authorizer, TokenService};
use jumpstarter_core::{
    Client, Exporter, Lease, LeaseSpec, Metadata, ObjectRef, Resource, Selector,
};
use jumpstarter_runtime::Ctx;
use jumpstarter_server::{
    config::RouterEndpoint,
    controller::Controller,
    listen::ListenQueues,
    proto::{
        controller_service_server::ControllerService, DeviceReport, DialRequest, ListenRequest,
        RegisterRequest, ReleaseLeaseRequest, RequestLeaseRequest, StatusRequest,
    },
    State,
};
use jumpstarter_store::Stores;
use parking_lot::RwLock;
use tonic::{Code, Request};

const ISSUER: &str = "https://jumpstarter.example";
const NAMESPACE: &str = "lab";

fn state(routers: Vec<RouterEndpoint>) -> Arc<State> {
    Arc::new(State {
        ctx: Ctx::new(Stores::new(), chrono::Duration::seconds(90)),
        tokens: Arc::new(TokenService::new(ISSUER, b"controller-secret", b"router-secret")),
        authenticator: Authenticator::new("internal:"),
        authorizer: Authorizer::basic("internal:"),
        listen: ListenQueues::new(),
        routers,
        oidc: RwLock::new(RotatingKeyPair::new(ISSUER).unwrap()),
        namespace: NAMESPACE.to_string(),
    })
}

fn default_state() -> Arc<State> {
    state(vec![RouterEndpoint {
        endpoint: "router.example.com:8083".into(),
        labels: Default::default(),
    }])
}

fn token_for<K: Resource>(state: &State, obj: &K) -> String {
    let meta = obj.meta();
    state
        .tokens
        .mint_controller_token(
            &ObjectRef {
                kind: K::KIND.to_string(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            },
            &meta.uid,
        )
        .unwrap()
}

fn with_bearer<T>(body: T, token: &str) -> Request<T> {
    let mut request = Request::new(body);
    request
        .metadata_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    request
}

fn add_exporter(state: &State, name: &str) -> Exporter {
    state
        .ctx
        .stores
        .exporters
        .create(Exporter {
            metadata: Metadata::named(NAMESPACE, name),
            ..Default::default()
        })
        .unwrap()
}

fn add_client(state: &State, name: &str) -> Client {
    state
        .ctx
        .stores
        .clients
        .create(Client {
            metadata: Metadata::named(NAMESPACE, name),
            ..Default::default()
        })
        .unwrap()
}

/// A lease already bound to `exporter`, as the scheduler would leave it.
fn add_bound_lease(state: &State, name: &str, client: &str, exporter: &str) -> Lease {
    let created = state
        .ctx
        .stores
        .leases
        .create(Lease {
            metadata: Metadata::named(NAMESPACE, name),
            spec: LeaseSpec {
                client_ref: client.to_string(),
                selector: Selector::default(),
                duration: Some(jumpstarter_core::Duration::from_secs(3600)),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    let mut bound = created;
    bound.status.begin_time = Some(Utc::now());
    bound.status.end_time = Some(Utc::now() + chrono::Duration::hours(1));
    bound.status.exporter_ref = Some(exporter.to_string());
    state.ctx.stores.leases.update_status(bound).unwrap()
}

#[tokio::test]
async fn register_requires_a_known_exporter() {
    let state = default_state();
    let service = Controller::new(state.clone());

    let error = service
        .register(Request::new(RegisterRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::Unauthenticated);

    // A client token is not an exporter token.
    let client = add_client(&state, "ci-bot");
    let error = service
        .register(with_bearer(RegisterRequest::default(), &token_for(&state, &client)))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn register_replaces_managed_labels_and_devices() {
    let state = default_state();
    let service = Controller::new(state.clone());

    let mut exporter = add_exporter(&state, "dut-01");
    exporter
        .metadata
        .labels
        .insert("jumpstarter.dev/board".into(), "rev1".into());
    exporter.metadata.labels.insert("owner".into(), "qa".into());
    let exporter = state.ctx.stores.exporters.update(exporter).unwrap();
    let token = token_for(&state, &exporter);

    let response = service
        .register(with_bearer(
            RegisterRequest {
                labels: [("jumpstarter.dev/board".to_string(), "rev2".to_string())].into(),
                devices: vec![DeviceReport {
                    uuid: "d-1".into(),
                    parent_uuid: None,
                    labels: Default::default(),
                }],
                endpoint: "grpc://dut-01:7443".into(),
            },
            &token,
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.uuid, exporter.metadata.uid);

    let stored = state.ctx.stores.exporters.get(NAMESPACE, "dut-01").unwrap();
    assert_eq!(stored.metadata.labels["jumpstarter.dev/board"], "rev2");
    assert_eq!(stored.metadata.labels["owner"], "qa");
    assert_eq!(stored.status.devices.len(), 1);
    assert_eq!(stored.status.endpoint, "grpc://dut-01:7443");
    assert!(stored.status.last_seen.is_some());

    // Unregister clears devices but keeps the exporter addressable.
    service
        .unregister(with_bearer(Default::default(), &token))
        .await
        .unwrap();
    let stored = state.ctx.stores.exporters.get(NAMESPACE, "dut-01").unwrap();
    assert!(stored.status.devices.is_empty());
}

#[tokio::test]
async fn recreated_exporter_does_not_resurrect_old_tokens() {
    let state = default_state();
    let service = Controller::new(state.clone());

    let exporter = add_exporter(&state, "dut-01");
    let old_token = token_for(&state, &exporter);
    state.ctx.stores.exporters.delete(NAMESPACE, "dut-01").unwrap();
    add_exporter(&state, "dut-01");

    let error = service
        .register(with_bearer(RegisterRequest::default(), &old_token))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn dial_delivers_matching_ticket_to_listener() {
    let state = default_state();
    let service = Controller::new(state.clone());

    let exporter = add_exporter(&state, "dut-01");
    let client = add_client(&state, "ci-bot");
    add_bound_lease(&state, "lease-1", "ci-bot", "dut-01");

    let mut listen = service
        .listen(with_bearer(
            ListenRequest {
                lease_name: "lease-1".into(),
            },
            &token_for(&state, &exporter),
        ))
        .await
        .unwrap()
        .into_inner();

    let dial = service
        .dial(with_bearer(
            DialRequest {
                lease_name: "lease-1".into(),
            },
            &token_for(&state, &client),
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(dial.router_endpoint, "router.example.com:8083");

    let pushed = listen.next().await.unwrap().unwrap();
    assert_eq!(pushed.router_endpoint, dial.router_endpoint);
    assert_eq!(pushed.router_token, dial.router_token);

    // Both sides hold a ticket for the same stream id.
    let stream_id = state.tokens.verify_router_ticket(&dial.router_token).unwrap();
    assert_eq!(
        state.tokens.verify_router_ticket(&pushed.router_token).unwrap(),
        stream_id
    );
}

#[tokio::test]
async fn dial_is_denied_for_leases_of_other_clients() {
    let state = default_state();
    let service = Controller::new(state.clone());

    add_exporter(&state, "dut-01");
    add_client(&state, "owner");
    let outsider = add_client(&state, "outsider");
    add_bound_lease(&state, "lease-1", "owner", "dut-01");

    let error = service
        .dial(with_bearer(
            DialRequest {
                lease_name: "lease-1".into(),
            },
            &token_for(&state, &outsider),
        ))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn dial_without_routers_is_unavailable() {
    let state = state(vec![]);
    let service = Controller::new(state.clone());

    add_exporter(&state, "dut-01");
    let client = add_client(&state, "ci-bot");
    add_bound_lease(&state, "lease-1", "ci-bot", "dut-01");
    // The exporter listens so router selection is the failing step.
    let exporter = state.ctx.stores.exporters.get(NAMESPACE, "dut-01").unwrap();
    let _listen = service
        .listen(with_bearer(
            ListenRequest {
                lease_name: "lease-1".into(),
            },
            &token_for(&state, &exporter),
        ))
        .await
        .unwrap();

    let error = service
        .dial(with_bearer(
            DialRequest {
                lease_name: "lease-1".into(),
            },
            &token_for(&state, &client),
        ))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::Unavailable);
}

#[tokio::test]
async fn request_lease_validates_the_time_triple() {
    let state = default_state();
    let service = Controller::new(state.clone());
    let client = add_client(&state, "ci-bot");
    let token = token_for(&state, &client);

    let now = Utc::now();
    let error = service
        .request_lease(with_bearer(
            RequestLeaseRequest {
                duration: Some(prost_types::Duration {
                    seconds: 60,
                    nanos: 0,
                }),
                selector: None,
                begin_time: Some(prost_types::Timestamp {
                    seconds: now.timestamp(),
                    nanos: 0,
                }),
                // Inconsistent: begin + 60s != begin + 30s.
                end_time: Some(prost_types::Timestamp {
                    seconds: now.timestamp() + 30,
                    nanos: 0,
                }),
            },
            &token,
        ))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::InvalidArgument);

    let response = service
        .request_lease(with_bearer(
            RequestLeaseRequest {
                duration: Some(prost_types::Duration {
                    seconds: 60,
                    nanos: 0,
                }),
                selector: None,
                begin_time: None,
                end_time: None,
            },
            &token,
        ))
        .await
        .unwrap()
        .into_inner();
    let stored = state.ctx.stores.leases.get(NAMESPACE, &response.name).unwrap();
    assert_eq!(stored.spec.client_ref, "ci-bot");
    assert_eq!(stored.spec.duration, Some(jumpstarter_core::Duration::from_secs(60)));
}

#[tokio::test]
async fn release_is_rejected_once_ended() {
    let state = default_state();
    let service = Controller::new(state.clone());

    add_exporter(&state, "dut-01");
    let client = add_client(&state, "ci-bot");
    add_bound_lease(&state, "lease-1", "ci-bot", "dut-01");
    let token = token_for(&state, &client);

    service
        .release_lease(with_bearer(
            ReleaseLeaseRequest {
                name: "lease-1".into(),
            },
            &token,
        ))
        .await
        .unwrap();
    assert!(state.ctx.stores.leases.get(NAMESPACE, "lease-1").unwrap().spec.release);

    let mut ended = state.ctx.stores.leases.get(NAMESPACE, "lease-1").unwrap();
    ended.status.ended = true;
    state.ctx.stores.leases.update_status(ended).unwrap();

    let error = service
        .release_lease(with_bearer(
            ReleaseLeaseRequest {
                name: "lease-1".into(),
            },
            &token,
        ))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn status_stream_reports_lease_transitions() {
    let state = default_state();
    let service = Controller::new(state.clone());

    let exporter = add_exporter(&state, "dut-01");
    add_client(&state, "ci-bot");

    let mut status = service
        .status(with_bearer(StatusRequest {}, &token_for(&state, &exporter)))
        .await
        .unwrap()
        .into_inner();

    let initial = status.next().await.unwrap().unwrap();
    assert!(!initial.leased);

    // The scheduler binds a lease; the back-pointer write lands on the
    // status stream.
    add_bound_lease(&state, "lease-1", "ci-bot", "dut-01");
    let mut exporter = state.ctx.stores.exporters.get(NAMESPACE, "dut-01").unwrap();
    exporter.status.lease_ref = Some("lease-1".into());
    state.ctx.stores.exporters.update_status(exporter).unwrap();

    let frame = status.next().await.unwrap().unwrap();
    assert!(frame.leased);
    assert_eq!(frame.lease_name.as_deref(), Some("lease-1"));
    assert_eq!(frame.client_name.as_deref(), Some("ci-bot"));
}
