//! The access-policy engine.
//!
//! For a lease request, collect the policies whose exporter selector matches
//! at least one candidate exporter, union their rule lists, order by
//! priority descending, and admit on the first rule whose client selector
//! matches the requesting client. Evaluation is pure: no I/O, cacheable per
//! `(client, exporter-set)`.
use jumpstarter_core::{Client, Duration, Exporter, ExporterAccessPolicy, Resource};

/// The outcome of admitting a client against the policies covering an
/// exporter set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Admission {
    pub priority: i32,
    /// Caps the effective lease duration when set.
    pub maximum_duration: Option<Duration>,
    /// Leases granted under this rule may be preempted by strictly
    /// higher-priority requests.
    pub spot_access: bool,
}

/// Admit `client` against the policies applying to `exporters`.
///
/// Returns `None` when at least one policy covers the exporters but no rule
/// matches the client. Exporters covered by no policy at all are open:
/// admission succeeds with the default (priority 0, no cap, no spot access).
pub fn admit(
    policies: &[ExporterAccessPolicy],
    client: &Client,
    exporters: &[Exporter],
) -> Option<Admission> {
    let mut rules: Vec<_> = policies
        .iter()
        .filter(|policy| {
            exporters
                .iter()
                .any(|e| policy.spec.exporters.matches(&e.meta().labels))
        })
        .flat_map(|policy| policy.spec.rules.iter())
        .collect();

    if rules.is_empty() {
        return Some(Admission::default());
    }

    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
        .iter()
        .find(|rule| rule.clients.matches(&client.meta().labels))
        .map(|rule| Admission {
            priority: rule.priority,
            maximum_duration: rule.maximum_duration,
            spot_access: rule.spot_access,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jumpstarter_core::{ExporterAccessPolicySpec, Metadata, PolicyRule, Selector};

    fn labelled_meta(ns: &str, name: &str, labels: &[(&str, &str)]) -> Metadata {
        Metadata {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Metadata::named(ns, name)
        }
    }

    fn client(labels: &[(&str, &str)]) -> Client {
        Client {
            metadata: labelled_meta("lab", "ci-bot", labels),
            ..Client::default()
        }
    }

    fn exporter(name: &str, labels: &[(&str, &str)]) -> Exporter {
        Exporter {
            metadata: labelled_meta("lab", name, labels),
            ..Exporter::default()
        }
    }

    fn policy(exporters: Selector, rules: Vec<PolicyRule>) -> ExporterAccessPolicy {
        ExporterAccessPolicy {
            metadata: Metadata::named("lab", "policy"),
            spec: ExporterAccessPolicySpec { exporters, rules },
        }
    }

    fn rule(priority: i32, clients: Selector) -> PolicyRule {
        PolicyRule {
            priority,
            clients,
            ..PolicyRule::default()
        }
    }

    #[test]
    fn unpoliced_exporters_are_open() {
        let admission = admit(&[], &client(&[]), &[exporter("e1", &[])]).unwrap();
        assert_eq!(admission, Admission::default());
    }

    #[test]
    fn policy_for_other_exporters_does_not_apply() {
        let p = policy(
            [("pool", "private")].into_iter().collect(),
            vec![rule(10, Selector::default())],
        );
        let admission = admit(&[p], &client(&[]), &[exporter("e1", &[("pool", "shared")])]).unwrap();
        assert_eq!(admission, Admission::default());
    }

    #[test]
    fn highest_priority_matching_rule_wins() {
        let p = policy(
            Selector::default(),
            vec![
                rule(0, Selector::default()),
                PolicyRule {
                    priority: 100,
                    clients: [("team", "platform")].into_iter().collect(),
                    maximum_duration: Some(Duration::from_secs(7200)),
                    spot_access: true,
                },
            ],
        );
        let admission = admit(
            &[p],
            &client(&[("team", "platform")]),
            &[exporter("e1", &[])],
        )
        .unwrap();
        assert_eq!(admission.priority, 100);
        assert_eq!(admission.maximum_duration, Some(Duration::from_secs(7200)));
        assert!(admission.spot_access);
    }

    #[test]
    fn falls_through_to_lower_priority_rule() {
        let p = policy(
            Selector::default(),
            vec![
                rule(100, [("team", "platform")].into_iter().collect()),
                rule(0, Selector::default()),
            ],
        );
        let admission = admit(&[p], &client(&[("team", "qa")]), &[exporter("e1", &[])]).unwrap();
        assert_eq!(admission.priority, 0);
    }

    #[test]
    fn no_matching_rule_denies_admission() {
        let p = policy(
            Selector::default(),
            vec![rule(10, [("team", "platform")].into_iter().collect())],
        );
        assert_eq!(admit(&[p], &client(&[("team", "qa")]), &[exporter("e1", &[])]), None);
    }

    #[test]
    fn rules_are_unioned_across_policies() {
        let open = policy(
            [("pool", "shared")].into_iter().collect(),
            vec![rule(0, Selector::default())],
        );
        let privileged = policy(
            [("pool", "shared")].into_iter().collect(),
            vec![rule(50, [("team", "platform")].into_iter().collect())],
        );
        let admission = admit(
            &[open, privileged],
            &client(&[("team", "platform")]),
            &[exporter("e1", &[("pool", "shared")])],
        )
        .unwrap();
        // The higher-priority rule from the second policy wins the union.
        assert_eq!(admission.priority, 50);
    }
}
