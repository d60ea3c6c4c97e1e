//! Core types for the Jumpstarter control plane.
//!
//! This crate contains the typed resources stored by the controller
//! ([`Client`], [`Exporter`], [`Lease`], [`ExporterAccessPolicy`]), the label
//! [`Selector`] machinery used to match leases against exporters, status
//! [`Condition`] handling, and the lease time-field reconciliation rules.
//! It has no I/O and no runtime dependency; the store, scheduler and RPC
//! crates all build on top of it.

pub mod conditions;
pub mod duration;
pub mod error;
pub mod labels;
pub mod metadata;
pub mod resources;
pub mod time;

pub use conditions::Condition;
pub use duration::Duration;
pub use error::Error;
pub use labels::{Expression, Selector};
pub use metadata::{Metadata, ObjectRef, Resource};
pub use resources::{
    Client, ClientSpec, Device, Exporter, ExporterAccessPolicy, ExporterAccessPolicySpec,
    ExporterSpec, ExporterStatus, Lease, LeaseSpec, LeaseStatus, PolicyRule,
};

/// Label prefix owned by the controller on [`Exporter`] objects.
///
/// Labels under this prefix are replaced wholesale on registration; all other
/// labels are user-managed and left untouched.
pub const MANAGED_LABEL_PREFIX: &str = "jumpstarter.dev/";

/// API group and version for all persisted resources.
pub const API_VERSION: &str = "jumpstarter.dev/v1alpha1";
