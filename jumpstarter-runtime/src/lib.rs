//! Controller runtime for the Jumpstarter control plane.
//!
//! The heart of this crate is the lease scheduler: a level-triggered
//! reconciler that drives every [`jumpstarter_core::Lease`] toward exactly
//! one terminal outcome: `Ready` with an assigned exporter until its end
//! time, `Unsatisfiable` with a reason, or `Ended`. Around it sit the
//! access-policy engine, the exporter liveness reconciler, and the small
//! requeue scheduler and controller loop that connect store watches to
//! reconcile invocations.

pub mod controller;
pub mod exporter;
pub mod lease;
pub mod policy;
pub mod scheduler;

use std::sync::Arc;

use jumpstarter_store::Stores;
use thiserror::Error;

pub use controller::Action;
pub use policy::Admission;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error")]
    Store(#[from] jumpstarter_store::Error),

    #[error("resource error")]
    Core(#[from] jumpstarter_core::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconciler.
#[derive(Clone)]
pub struct Ctx {
    pub stores: Stores,
    /// An exporter is `Online` iff `now - last_seen < offline_timeout`.
    pub offline_timeout: chrono::Duration,
}

impl Ctx {
    pub fn new(stores: Stores, offline_timeout: chrono::Duration) -> Arc<Self> {
        Arc::new(Self {
            stores,
            offline_timeout,
        })
    }
}
