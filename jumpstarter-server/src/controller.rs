//! `ControllerService`: exporter registration, liveness and listen streams,
//! dialing and lease CRUD.
use std::{pin::Pin, sync::Arc, time::Duration};

use chrono::Utc;
use futures::Stream;
use jumpstarter_core::{
    conditions::{self, exporter as exporter_cond, Condition},
    time as lease_time, Lease, LeaseSpec, Metadata, MANAGED_LABEL_PREFIX,
};
use rand::Rng;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{caller_client, caller_exporter, require_lease_owner, store_status},
    convert,
    listen::PushError,
    proto::{
        controller_service_server::ControllerService, DialRequest, DialResponse, GetLeaseRequest,
        GetLeaseResponse, ListLeasesRequest, ListLeasesResponse, ListenRequest, ListenResponse,
        RegisterRequest, RegisterResponse, ReleaseLeaseRequest, ReleaseLeaseResponse,
        RequestLeaseRequest, RequestLeaseResponse, StatusRequest, StatusResponse,
        UnregisterRequest, UnregisterResponse,
    },
    State,
};

/// Heartbeat cadence of the exporter status stream.
const STATUS_TICK: Duration = Duration::from_secs(10);
/// Attempts for read-modify-write loops racing the reconciler.
const WRITE_ATTEMPTS: usize = 3;

pub struct Controller {
    state: Arc<State>,
}

impl Controller {
    pub fn new(state: Arc<State>) -> Self {
        Self { state }
    }

    /// Refresh `last_seen` for an exporter, retrying around reconciler
    /// writes.
    fn touch_exporter(state: &State, name: &str) {
        for _ in 0..WRITE_ATTEMPTS {
            let Ok(mut exporter) = state.ctx.stores.exporters.get(&state.namespace, name) else {
                return;
            };
            exporter.status.last_seen = Some(Utc::now());
            match state.ctx.stores.exporters.update_status(exporter) {
                Ok(_) => return,
                Err(jumpstarter_store::Error::Conflict { .. }) => continue,
                Err(error) => {
                    warn!(%error, exporter = name, "failed to refresh last_seen");
                    return;
                }
            }
        }
    }
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl ControllerService for Controller {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let exporter = caller_exporter(&self.state, &request)?;
        let body = request.into_inner();
        let name = exporter.metadata.name.clone();

        for _ in 0..WRITE_ATTEMPTS {
            let mut fresh = self
                .state
                .ctx
                .stores
                .exporters
                .get(&self.state.namespace, &name)
                .map_err(store_status)?;

            // Owner-managed labels are replaced wholesale; user labels stay.
            fresh
                .metadata
                .labels
                .retain(|key, _| !key.starts_with(MANAGED_LABEL_PREFIX));
            fresh.metadata.labels.extend(body.labels.clone());

            fresh.status.devices = body
                .devices
                .iter()
                .map(|d| jumpstarter_core::Device {
                    uuid: d.uuid.clone(),
                    parent_uuid: d.parent_uuid.clone(),
                    labels: d.labels.clone().into_iter().collect(),
                })
                .collect();
            if !body.endpoint.is_empty() {
                fresh.status.endpoint = body.endpoint.clone();
            }
            fresh.status.last_seen = Some(Utc::now());
            conditions::set_condition(
                &mut fresh.status.conditions,
                Condition::new(exporter_cond::REGISTERED, true, "Registered", Utc::now()),
            );

            match self.state.ctx.stores.exporters.update(fresh) {
                Ok(updated) => {
                    info!(exporter = %name, devices = body.devices.len(), "exporter registered");
                    return Ok(Response::new(RegisterResponse {
                        uuid: updated.metadata.uid,
                    }));
                }
                Err(jumpstarter_store::Error::Conflict { .. }) => continue,
                Err(error) => return Err(store_status(error)),
            }
        }
        Err(Status::aborted("conflict registering exporter"))
    }

    async fn unregister(
        &self,
        request: Request<UnregisterRequest>,
    ) -> Result<Response<UnregisterResponse>, Status> {
        let exporter = caller_exporter(&self.state, &request)?;
        let name = exporter.metadata.name.clone();

        for _ in 0..WRITE_ATTEMPTS {
            let mut fresh = self
                .state
                .ctx
                .stores
                .exporters
                .get(&self.state.namespace, &name)
                .map_err(store_status)?;
            // The exporter stays addressable; it just reports no devices.
            fresh.status.devices.clear();
            conditions::set_condition(
                &mut fresh.status.conditions,
                Condition::new(exporter_cond::REGISTERED, false, "Unregistered", Utc::now()),
            );
            match self.state.ctx.stores.exporters.update(fresh) {
                Ok(_) => {
                    info!(exporter = %name, "exporter unregistered");
                    return Ok(Response::new(UnregisterResponse {}));
                }
                Err(jumpstarter_store::Error::Conflict { .. }) => continue,
                Err(error) => return Err(store_status(error)),
            }
        }
        Err(Status::aborted("conflict unregistering exporter"))
    }

    type ListenStream = BoxStream<ListenResponse>;

    async fn listen(
        &self,
        request: Request<ListenRequest>,
    ) -> Result<Response<Self::ListenStream>, Status> {
        let exporter = caller_exporter(&self.state, &request)?;
        let lease_name = request.into_inner().lease_name;

        let lease = self
            .state
            .ctx
            .stores
            .leases
            .get(&self.state.namespace, &lease_name)
            .map_err(store_status)?;
        if lease.status.exporter_ref.as_deref() != Some(exporter.metadata.name.as_str()) {
            return Err(Status::permission_denied("lease is not held by this exporter"));
        }
        if lease.status.ended {
            return Err(Status::failed_precondition("lease already ended"));
        }

        debug!(exporter = %exporter.metadata.name, lease = %lease_name, "listen queue opened");
        let rx = self.state.listen.subscribe(&lease_name);
        let stream = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(stream) as Self::ListenStream))
    }

    type StatusStream = BoxStream<StatusResponse>;

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        let exporter = caller_exporter(&self.state, &request)?;
        let name = exporter.metadata.name.clone();
        let state = self.state.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StatusResponse, Status>>(8);
        tokio::spawn(async move {
            // Immediate refresh on connect, then the 10s heartbeat.
            Controller::touch_exporter(&state, &name);

            let frame = |lease_ref: Option<&str>| {
                let lease = lease_ref.and_then(|lease_name| {
                    state.ctx.stores.leases.get(&state.namespace, lease_name).ok()
                });
                StatusResponse {
                    leased: lease_ref.is_some(),
                    lease_name: lease_ref.map(str::to_string),
                    client_name: lease.map(|l| l.spec.client_ref),
                }
            };

            // Subscribe before snapshotting so no transition slips between
            // the initial frame and the watch.
            let mut watch = state.ctx.stores.exporters.watch();
            let mut lease_ref = state
                .ctx
                .stores
                .exporters
                .get(&state.namespace, &name)
                .ok()
                .and_then(|e| e.status.lease_ref);
            if tx.send(Ok(frame(lease_ref.as_deref()))).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval(STATUS_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => Controller::touch_exporter(&state, &name),
                    _ = tx.closed() => break,
                    event = watch.recv() => match event {
                        Ok(event) => {
                            let object = event.object();
                            if object.metadata.name != name {
                                continue;
                            }
                            if object.status.lease_ref != lease_ref {
                                lease_ref = object.status.lease_ref.clone();
                                if tx.send(Ok(frame(lease_ref.as_deref()))).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                        Err(async_broadcast::RecvError::Closed) => break,
                    },
                }
            }
            debug!(exporter = %name, "status stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::StatusStream))
    }

    async fn dial(&self, request: Request<DialRequest>) -> Result<Response<DialResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let lease_name = request.into_inner().lease_name;

        let lease = self
            .state
            .ctx
            .stores
            .leases
            .get(&self.state.namespace, &lease_name)
            .map_err(store_status)?;
        require_lease_owner(&client, &lease)?;
        if !lease.is_active() {
            return Err(Status::failed_precondition("lease is not active"));
        }

        if self.state.routers.is_empty() {
            return Err(Status::unavailable("no router configured"));
        }
        let router = &self.state.routers[rand::rng().random_range(0..self.state.routers.len())];

        let stream_id = Uuid::new_v4();
        let ticket = self
            .state
            .tokens
            .mint_router_ticket(stream_id)
            .map_err(|_| Status::internal("failed to sign router ticket"))?;
        let message = ListenResponse {
            router_endpoint: router.endpoint.clone(),
            router_token: ticket.clone(),
        };

        match self.state.listen.push(&lease_name, message) {
            Ok(()) => {}
            Err(PushError::Full) => return Err(Status::resource_exhausted("listen queue full")),
            Err(PushError::NotListening) => {
                return Err(Status::unavailable("exporter is not listening for dials"))
            }
        }

        info!(lease = %lease_name, %stream_id, router = %router.endpoint, "dial issued");
        Ok(Response::new(DialResponse {
            router_endpoint: router.endpoint.clone(),
            router_token: ticket,
        }))
    }

    async fn get_lease(
        &self,
        request: Request<GetLeaseRequest>,
    ) -> Result<Response<GetLeaseResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let name = request.into_inner().name;
        let lease = self
            .state
            .ctx
            .stores
            .leases
            .get(&self.state.namespace, &name)
            .map_err(store_status)?;
        require_lease_owner(&client, &lease)?;

        let duration = lease
            .spec
            .duration
            .ok_or_else(|| Status::internal("lease is missing a duration"))?;
        Ok(Response::new(GetLeaseResponse {
            duration: Some(convert::core_to_duration(duration)),
            selector: Some(convert::selector_to_proto(&lease.spec.selector)),
            begin_time: lease.status.begin_time.map(convert::chrono_to_timestamp),
            end_time: lease.status.end_time.map(convert::chrono_to_timestamp),
            exporter_name: lease.status.exporter_ref.clone(),
            ended: lease.status.ended,
            conditions: lease
                .status
                .conditions
                .iter()
                .map(convert::condition_to_proto)
                .collect(),
        }))
    }

    async fn request_lease(
        &self,
        request: Request<RequestLeaseRequest>,
    ) -> Result<Response<RequestLeaseResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let body = request.into_inner();

        let duration = body
            .duration
            .as_ref()
            .map(convert::duration_to_core)
            .transpose()?;
        let mut spec = LeaseSpec {
            client_ref: client.metadata.name.clone(),
            selector: convert::selector_from_proto(body.selector)?,
            duration,
            begin_time: body
                .begin_time
                .as_ref()
                .map(convert::timestamp_to_chrono)
                .transpose()?,
            end_time: body
                .end_time
                .as_ref()
                .map(convert::timestamp_to_chrono)
                .transpose()?,
            release: false,
        };
        lease_time::reconcile_time_fields(&mut spec)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        // UUIDv7 names keep lease listings in creation order.
        let name = Uuid::now_v7().to_string();
        let lease = Lease {
            metadata: Metadata::named(&self.state.namespace, &name),
            spec,
            ..Lease::default()
        };
        let created = self.state.ctx.stores.leases.create(lease).map_err(store_status)?;
        info!(lease = %created.metadata.name, client = %client.metadata.name, "lease requested");
        Ok(Response::new(RequestLeaseResponse {
            name: created.metadata.name,
        }))
    }

    async fn release_lease(
        &self,
        request: Request<ReleaseLeaseRequest>,
    ) -> Result<Response<ReleaseLeaseResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let name = request.into_inner().name;

        for _ in 0..WRITE_ATTEMPTS {
            let mut lease = self
                .state
                .ctx
                .stores
                .leases
                .get(&self.state.namespace, &name)
                .map_err(store_status)?;
            require_lease_owner(&client, &lease)?;
            if lease.status.ended {
                return Err(Status::failed_precondition("lease already ended"));
            }
            lease.spec.release = true;
            match self.state.ctx.stores.leases.update(lease) {
                Ok(_) => {
                    self.state.listen.remove(&name);
                    return Ok(Response::new(ReleaseLeaseResponse {}));
                }
                Err(jumpstarter_store::Error::Conflict { .. }) => continue,
                Err(error) => return Err(store_status(error)),
            }
        }
        Err(Status::aborted("conflict releasing lease"))
    }

    async fn list_leases(
        &self,
        request: Request<ListLeasesRequest>,
    ) -> Result<Response<ListLeasesResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let names = self
            .state
            .ctx
            .stores
            .leases
            .list(&self.state.namespace, None)
            .into_iter()
            .filter(|lease| lease.spec.client_ref == client.metadata.name)
            .map(|lease| lease.metadata.name)
            .collect();
        Ok(Response::new(ListLeasesResponse { names }))
    }
}
