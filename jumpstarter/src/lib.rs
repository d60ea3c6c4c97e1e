//! Jumpstarter is a hardware-access control plane: clients request
//! time-bounded, exclusive use of physical test fixtures ("exporters")
//! matching label selectors, and once granted a lease, establish a
//! bidirectional byte stream to the exporter's agent through a relay.
//!
//! This crate re-exports the building blocks:
//!
//! - [`core`]: typed resources, label selectors, conditions and the lease
//!   time-field rules
//! - [`store`]: typed CRUD with optimistic concurrency and watch streams
//! - [`auth`]: token minting, principal resolution and authorization
//! - [`runtime`]: the lease scheduler, access-policy engine and controller
//!   loops
//!
//! The gRPC surface lives in the `jumpstarter-server` binary crate.
//!
//! # Example
//!
//! Drive the scheduler against the in-memory store:
//!
//! ```rust,no_run
//! use std::iter::FromIterator;
//! use jumpstarter::core::{Duration, Lease, LeaseSpec, Metadata, Selector};
//! use jumpstarter::runtime::{controller::run_lease_controller, Ctx};
//! use jumpstarter::store::Stores;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = Ctx::new(Stores::new(), chrono::Duration::seconds(90));
//!     tokio::spawn(run_lease_controller(ctx.clone()));
//!
//!     ctx.stores
//!         .leases
//!         .create(Lease {
//!             metadata: Metadata::named("lab", "my-lease"),
//!             spec: LeaseSpec {
//!                 client_ref: "ci-bot".into(),
//!                 selector: Selector::from_iter([("dut", "a")]),
//!                 duration: Some(Duration::from_secs(1800)),
//!                 ..Default::default()
//!             },
//!             ..Default::default()
//!         })
//!         .unwrap();
//! }
//! ```

pub use jumpstarter_auth as auth;
pub use jumpstarter_core as core;
pub use jumpstarter_runtime as runtime;
pub use jumpstarter_store as store;

pub use jumpstarter_core::{
    Client, Condition, Duration, Exporter, ExporterAccessPolicy, Lease, Metadata, ObjectRef,
    Resource, Selector,
};
pub use jumpstarter_runtime::{Action, Ctx};
pub use jumpstarter_store::Stores;
