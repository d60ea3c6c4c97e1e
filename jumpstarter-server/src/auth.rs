//! Per-RPC principal resolution.
//!
//! Every handler first resolves the bearer to a principal, then to the
//! concrete `Client` or `Exporter` the principal *is*, via the configured
//! authorizer. Token verification failures are `Unauthenticated`; a resolved
//! principal that is not entitled to the target object is
//! `PermissionDenied`.
use jumpstarter_auth::UserInfo;
use jumpstarter_core::{Client, Exporter, Lease, Resource};
use tonic::{Request, Status};

use crate::State;

/// Extract the bearer token from `authorization: Bearer <jwt>` metadata.
pub fn bearer<T>(request: &Request<T>) -> Result<String, Status> {
    let value = request
        .metadata()
        .get("authorization")
        .ok_or_else(|| Status::unauthenticated("missing authorization metadata"))?
        .to_str()
        .map_err(|_| Status::unauthenticated("malformed authorization metadata"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| Status::unauthenticated("authorization metadata is not a bearer token"))
}

fn resolve_user<T>(state: &State, request: &Request<T>) -> Result<UserInfo, Status> {
    let token = bearer(request)?;
    state
        .authenticator
        .resolve(&state.tokens, &token)
        .map_err(|_| Status::unauthenticated("invalid bearer token"))
}

/// Whether `user` is the principal for `obj`, including the UID binding that
/// prevents a deleted-and-recreated object from resurrecting old tokens.
fn is_principal_for<K: Resource + serde::Serialize>(
    state: &State,
    user: &UserInfo,
    obj: &K,
    username_override: Option<&str>,
) -> bool {
    if !user.uid.is_empty() && user.uid != obj.meta().uid {
        return false;
    }
    state
        .authorizer
        .authorize(user, obj, username_override)
        .unwrap_or(false)
}

/// Resolve the calling exporter, or fail `Unauthenticated`.
pub fn caller_exporter<T>(state: &State, request: &Request<T>) -> Result<Exporter, Status> {
    let user = resolve_user(state, request)?;
    state
        .ctx
        .stores
        .exporters
        .list(&state.namespace, None)
        .into_iter()
        .find(|e| is_principal_for(state, &user, e, e.spec.username.as_deref()))
        .ok_or_else(|| Status::unauthenticated("bearer does not resolve to an exporter"))
}

/// Resolve the calling client, or fail `Unauthenticated`.
pub fn caller_client<T>(state: &State, request: &Request<T>) -> Result<Client, Status> {
    let user = resolve_user(state, request)?;
    state
        .ctx
        .stores
        .clients
        .list(&state.namespace, None)
        .into_iter()
        .find(|c| is_principal_for(state, &user, c, c.spec.username.as_deref()))
        .ok_or_else(|| Status::unauthenticated("bearer does not resolve to a client"))
}

/// The caller must own `lease`; owning means being its client.
pub fn require_lease_owner(client: &Client, lease: &Lease) -> Result<(), Status> {
    if lease.spec.client_ref != client.metadata.name {
        return Err(Status::permission_denied("lease is not held by the caller"));
    }
    Ok(())
}

/// Map store errors onto the RPC error surface.
pub fn store_status(error: jumpstarter_store::Error) -> Status {
    use jumpstarter_store::Error::*;
    match error {
        NotFound { .. } => Status::not_found(error.to_string()),
        AlreadyExists { .. } => Status::already_exists(error.to_string()),
        Conflict { .. } => Status::aborted(error.to_string()),
        MissingResourceVersion => Status::internal(error.to_string()),
    }
}
