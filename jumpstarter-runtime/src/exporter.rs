//! Exporter liveness and back-pointer maintenance.
use chrono::{DateTime, Utc};
use jumpstarter_core::{
    conditions::{self, exporter as cond, Condition},
    Exporter,
};
use tracing::debug;

use crate::{controller::Action, Ctx, Result};

const CONFLICT_RETRY: std::time::Duration = std::time::Duration::from_millis(200);

/// An exporter is online iff its heartbeat is fresher than the configured
/// offline timeout.
pub fn is_online(exporter: &Exporter, now: DateTime<Utc>, offline_timeout: chrono::Duration) -> bool {
    exporter
        .status
        .last_seen
        .is_some_and(|last_seen| now - last_seen < offline_timeout)
}

/// Recompute derived exporter status: the `Online` condition from
/// `last_seen`, and the `lease_ref` back-pointer from the authoritative
/// lease side.
#[tracing::instrument(skip(ctx), fields(exporter = %format!("{namespace}/{name}")))]
pub async fn reconcile(ctx: &Ctx, namespace: &str, name: &str) -> Result<Action> {
    let Ok(mut exporter) = ctx.stores.exporters.get(namespace, name) else {
        return Ok(Action::await_change());
    };
    let now = Utc::now();

    let online = is_online(&exporter, now, ctx.offline_timeout);
    let mut changed = conditions::set_condition(
        &mut exporter.status.conditions,
        if online {
            Condition::new(cond::ONLINE, true, "Heartbeat", now)
        } else {
            Condition::new(cond::ONLINE, false, "Stale", now)
        },
    );

    // The back-pointer is derived, never authoritative: recompute it from
    // the lease that actually holds this exporter.
    let holder = ctx
        .stores
        .leases
        .list(namespace, None)
        .into_iter()
        .find(|lease| lease.is_active() && lease.status.exporter_ref.as_deref() == Some(name))
        .map(|lease| lease.metadata.name);
    if exporter.status.lease_ref != holder {
        debug!(from = ?exporter.status.lease_ref, to = ?holder, "repairing lease back-pointer");
        exporter.status.lease_ref = holder;
        changed = true;
    }

    if changed && ctx.stores.exporters.update_status(exporter.clone()).is_err() {
        return Ok(Action::requeue(CONFLICT_RETRY));
    }

    // While online, requeue for the moment the heartbeat would go stale.
    if online {
        if let Some(last_seen) = exporter.status.last_seen {
            let stale_at = last_seen + ctx.offline_timeout;
            let wait = (stale_at - now).to_std().unwrap_or_default();
            return Ok(Action::requeue(wait));
        }
    }
    Ok(Action::await_change())
}
