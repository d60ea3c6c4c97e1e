//! `ClientService`: resource-style v1 CRUD with AIP naming.
//!
//! Resource names are `namespaces/{namespace}/exporters/{exporter}` and
//! `namespaces/{namespace}/leases/{lease}`. Lease updates honour field
//! presence: only provided members change, revalidated through the lease
//! time-field rules.
use std::sync::Arc;

use chrono::Utc;
use jumpstarter_core::{time as lease_time, Lease as CoreLease, LeaseSpec, Metadata};
use tonic::{Request, Response, Status};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::{caller_client, require_lease_owner, store_status},
    client_proto::{
        client_service_server::ClientService, CreateLeaseRequest, DeleteLeaseRequest, Device,
        Exporter, GetExporterRequest, GetLeaseRequest, Lease, ListExportersRequest,
        ListExportersResponse, ListLeasesRequest, ListLeasesResponse, UpdateLeaseRequest,
    },
    convert, State,
};

const WRITE_ATTEMPTS: usize = 3;

pub struct ClientApi {
    state: Arc<State>,
}

impl ClientApi {
    pub fn new(state: Arc<State>) -> Self {
        Self { state }
    }

    fn parse_name<'a>(&self, name: &'a str, collection: &str) -> Result<&'a str, Status> {
        match name.split('/').collect::<Vec<_>>()[..] {
            ["namespaces", namespace, c, id] if c == collection && !id.is_empty() => {
                if namespace != self.state.namespace {
                    return Err(Status::not_found(format!("unknown namespace {namespace:?}")));
                }
                Ok(id)
            }
            _ => Err(Status::invalid_argument(format!(
                "name must be namespaces/{{namespace}}/{collection}/{{id}}, got {name:?}"
            ))),
        }
    }

    fn parse_parent(&self, parent: &str) -> Result<(), Status> {
        match parent.split('/').collect::<Vec<_>>()[..] {
            ["namespaces", namespace] if namespace == self.state.namespace => Ok(()),
            ["namespaces", namespace] => {
                Err(Status::not_found(format!("unknown namespace {namespace:?}")))
            }
            _ => Err(Status::invalid_argument(format!(
                "parent must be namespaces/{{namespace}}, got {parent:?}"
            ))),
        }
    }

    fn exporter_to_proto(&self, exporter: &jumpstarter_core::Exporter) -> Exporter {
        let online = jumpstarter_runtime::exporter::is_online(
            exporter,
            Utc::now(),
            self.state.ctx.offline_timeout,
        );
        Exporter {
            name: format!(
                "namespaces/{}/exporters/{}",
                exporter.metadata.namespace, exporter.metadata.name
            ),
            labels: exporter.metadata.labels.clone().into_iter().collect(),
            devices: exporter
                .status
                .devices
                .iter()
                .map(|d| Device {
                    uuid: d.uuid.clone(),
                    parent_uuid: d.parent_uuid.clone(),
                    labels: d.labels.clone().into_iter().collect(),
                })
                .collect(),
            online,
            lease_name: exporter.status.lease_ref.clone(),
        }
    }

    fn lease_to_proto(&self, lease: &CoreLease) -> Lease {
        Lease {
            name: format!(
                "namespaces/{}/leases/{}",
                lease.metadata.namespace, lease.metadata.name
            ),
            client: lease.spec.client_ref.clone(),
            selector: lease.spec.selector.to_string(),
            duration: lease.spec.duration.map(convert::core_to_duration),
            begin_time: lease.spec.begin_time.map(convert::chrono_to_timestamp),
            end_time: lease.spec.end_time.map(convert::chrono_to_timestamp),
            effective_begin_time: lease.status.begin_time.map(convert::chrono_to_timestamp),
            effective_end_time: lease.status.end_time.map(convert::chrono_to_timestamp),
            exporter: lease.status.exporter_ref.clone(),
            ended: lease.status.ended,
            release: lease.spec.release,
        }
    }
}

#[tonic::async_trait]
impl ClientService for ClientApi {
    async fn get_exporter(
        &self,
        request: Request<GetExporterRequest>,
    ) -> Result<Response<Exporter>, Status> {
        caller_client(&self.state, &request)?;
        let name = self.parse_name(&request.get_ref().name, "exporters")?.to_string();
        let exporter = self
            .state
            .ctx
            .stores
            .exporters
            .get(&self.state.namespace, &name)
            .map_err(store_status)?;
        Ok(Response::new(self.exporter_to_proto(&exporter)))
    }

    async fn list_exporters(
        &self,
        request: Request<ListExportersRequest>,
    ) -> Result<Response<ListExportersResponse>, Status> {
        caller_client(&self.state, &request)?;
        let body = request.get_ref();
        self.parse_parent(&body.parent)?;
        let selector = convert::parse_label_selector(&body.label_selector)?;
        let exporters = self
            .state
            .ctx
            .stores
            .exporters
            .list(&self.state.namespace, Some(&selector))
            .iter()
            .map(|e| self.exporter_to_proto(e))
            .collect();
        Ok(Response::new(ListExportersResponse { exporters }))
    }

    async fn get_lease(&self, request: Request<GetLeaseRequest>) -> Result<Response<Lease>, Status> {
        let client = caller_client(&self.state, &request)?;
        let name = self.parse_name(&request.get_ref().name, "leases")?.to_string();
        let lease = self
            .state
            .ctx
            .stores
            .leases
            .get(&self.state.namespace, &name)
            .map_err(store_status)?;
        require_lease_owner(&client, &lease)?;
        Ok(Response::new(self.lease_to_proto(&lease)))
    }

    async fn list_leases(
        &self,
        request: Request<ListLeasesRequest>,
    ) -> Result<Response<ListLeasesResponse>, Status> {
        let client = caller_client(&self.state, &request)?;
        let body = request.get_ref();
        self.parse_parent(&body.parent)?;
        let selector = convert::parse_label_selector(&body.label_selector)?;
        let leases = self
            .state
            .ctx
            .stores
            .leases
            .list(&self.state.namespace, Some(&selector))
            .iter()
            .filter(|lease| lease.spec.client_ref == client.metadata.name)
            .map(|lease| self.lease_to_proto(lease))
            .collect();
        Ok(Response::new(ListLeasesResponse { leases }))
    }

    async fn create_lease(
        &self,
        request: Request<CreateLeaseRequest>,
    ) -> Result<Response<Lease>, Status> {
        let client = caller_client(&self.state, &request)?;
        let body = request.into_inner();
        self.parse_parent(&body.parent)?;
        let lease = body
            .lease
            .ok_or_else(|| Status::invalid_argument("lease is required"))?;

        let mut spec = LeaseSpec {
            client_ref: client.metadata.name.clone(),
            selector: convert::parse_label_selector(&lease.selector)?,
            duration: lease
                .duration
                .as_ref()
                .map(convert::duration_to_core)
                .transpose()?,
            begin_time: lease
                .begin_time
                .as_ref()
                .map(convert::timestamp_to_chrono)
                .transpose()?,
            end_time: lease
                .end_time
                .as_ref()
                .map(convert::timestamp_to_chrono)
                .transpose()?,
            release: false,
        };
        lease_time::reconcile_time_fields(&mut spec)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let created = self
            .state
            .ctx
            .stores
            .leases
            .create(CoreLease {
                metadata: Metadata::named(&self.state.namespace, &Uuid::now_v7().to_string()),
                spec,
                ..CoreLease::default()
            })
            .map_err(store_status)?;
        info!(lease = %created.metadata.name, client = %client.metadata.name, "lease created");
        Ok(Response::new(self.lease_to_proto(&created)))
    }

    async fn update_lease(
        &self,
        request: Request<UpdateLeaseRequest>,
    ) -> Result<Response<Lease>, Status> {
        let client = caller_client(&self.state, &request)?;
        let body = request.into_inner();
        let name = self.parse_name(&body.name, "leases")?.to_string();
        let now = Utc::now();

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
                // Ended leases are frozen; only deletion remains.
                return Err(Status::failed_precondition("lease already ended"));
            }

            if let Some(duration) = &body.duration {
                let duration = convert::duration_to_core(duration)?;
                lease.spec.duration = Some(duration);
                if body.end_time.is_none() {
                    // Re-derive the third member from the provided two.
                    lease.spec.end_time = lease.spec.begin_time.map(|b| b + duration.as_chrono());
                }
            }
            if let Some(begin) = &body.begin_time {
                lease.spec.begin_time = Some(convert::timestamp_to_chrono(begin)?);
            }
            if let Some(end) = &body.end_time {
                lease.spec.end_time = Some(convert::timestamp_to_chrono(end)?);
            }
            if let Some(release) = body.release {
                lease.spec.release = release;
            }

            lease_time::reconcile_time_fields(&mut lease.spec)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            lease_time::validate_bound_update(&lease.spec, &lease.status, now)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;

            match self.state.ctx.stores.leases.update(lease) {
                Ok(updated) => return Ok(Response::new(self.lease_to_proto(&updated))),
                Err(jumpstarter_store::Error::Conflict { .. }) => continue,
                Err(error) => return Err(store_status(error)),
            }
        }
        Err(Status::aborted("conflict updating lease"))
    }

    async fn delete_lease(
        &self,
        request: Request<DeleteLeaseRequest>,
    ) -> Result<Response<()>, Status> {
        let client = caller_client(&self.state, &request)?;
        let name = self.parse_name(&request.get_ref().name, "leases")?.to_string();

        let lease = self
            .state
            .ctx
            .stores
            .leases
            .get(&self.state.namespace, &name)
            .map_err(store_status)?;
        require_lease_owner(&client, &lease)?;

        self.state
            .ctx
            .stores
            .leases
            .delete(&self.state.namespace, &name)
            .map_err(store_status)?;
        self.state.listen.remove(&name);
        info!(lease = %name, "lease deleted");
        Ok(Response::new(()))
    }
}
