//! Typed resources persisted through the store.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{conditions::Condition, Duration, Metadata, Resource, Selector};

macro_rules! impl_resource {
    ($ty:ident, $kind:literal) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &Metadata {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
        }
    };
}

/// A named principal that may request leases in a namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ClientSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    /// Overrides the synthesized authentication subject when set.
    ///
    /// Must be unique across clients sharing an authenticator prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl_resource!(Client, "Client");

/// A named agent fronting physical test hardware.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exporter {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ExporterSpec,
    #[serde(default)]
    pub status: ExporterStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterStatus {
    /// Device tree reported by the most recent registration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
    /// Advertised gRPC endpoint of the exporter agent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Refreshed by the status-stream heartbeat; monotonic per registration
    /// session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Weak back-pointer to the holding lease, recomputed from the lease
    /// side every reconciliation. Never authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// One node of an exporter's reported device tree.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl_resource!(Exporter, "Exporter");

/// A time-bounded exclusive binding of one client to one exporter.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub metadata: Metadata,
    pub spec: LeaseSpec,
    #[serde(default)]
    pub status: LeaseStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    /// Name of the requesting [`Client`] in the same namespace.
    pub client_ref: String,
    /// Exporter label selector.
    #[serde(default)]
    pub selector: Selector,
    /// Requested duration. Together with `begin_time`/`end_time` this forms
    /// the time triple: any two determine the third.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Set by the client to end the lease early.
    #[serde(default)]
    pub release: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Name of the assigned exporter. Never changes once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_ref: Option<String>,
    #[serde(default)]
    pub ended: bool,
    /// Priority of the admitted policy rule, recorded at binding time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Whether the admitted rule allows preemption of this lease.
    #[serde(default)]
    pub spot_access: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl_resource!(Lease, "Lease");

impl Lease {
    /// Whether this lease currently binds an exporter.
    pub fn is_active(&self) -> bool {
        self.status.exporter_ref.is_some() && !self.status.ended
    }
}

/// Ordered rule set deciding which clients may lease which exporters.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterAccessPolicy {
    pub metadata: Metadata,
    pub spec: ExporterAccessPolicySpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterAccessPolicySpec {
    /// Exporters this policy applies to.
    #[serde(default)]
    pub exporters: Selector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,
}

/// A single admission rule. `priority` totally orders rules within the
/// policies applying to an exporter set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub priority: i32,
    /// Clients admitted by this rule.
    #[serde(default)]
    pub clients: Selector,
    /// Caps the effective lease duration when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_duration: Option<Duration>,
    /// Marks granted leases as preemptible by higher-priority requests.
    #[serde(default)]
    pub spot_access: bool,
}

impl_resource!(ExporterAccessPolicy, "ExporterAccessPolicy");

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn lease_yaml_roundtrip() {
        let yaml = r#"
metadata:
  name: 0190163d-8fe4-7d06-9e23-0a1b2c3d4e5f
  namespace: lab
spec:
  clientRef: ci-bot
  selector:
    matchLabels:
      dut: a
  duration: 30m
"#;
        let lease: Lease = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(lease.spec.client_ref, "ci-bot");
        assert_eq!(lease.spec.duration, Some(Duration::from_secs(1800)));
        assert!(lease
            .spec
            .selector
            .matches(&BTreeMap::from_iter([("dut".to_string(), "a".to_string())])));
        assert!(!lease.is_active());
    }

    #[test]
    fn policy_rules_deserialize_with_defaults() {
        let yaml = r#"
metadata:
  name: lab-access
  namespace: lab
spec:
  exporters:
    matchLabels:
      pool: shared
  rules:
    - priority: 100
      clients:
        matchLabels:
          team: platform
      maximumDuration: 2h
      spotAccess: true
    - priority: 0
"#;
        let policy: ExporterAccessPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.spec.rules.len(), 2);
        assert!(policy.spec.rules[0].spot_access);
        assert_eq!(policy.spec.rules[0].maximum_duration, Some(Duration::from_secs(7200)));
        assert!(!policy.spec.rules[1].spot_access);
        assert!(policy.spec.rules[1].clients.selects_all());
    }
}
