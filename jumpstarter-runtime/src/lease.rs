//! The lease scheduler.
//!
//! Level-triggered: every invocation re-derives the correct lease status
//! from the store. Each lease is driven toward exactly one terminal outcome:
//! `Ready` with an assigned exporter until its end time, `Unsatisfiable`
//! with a reason, or `Ended`. A lease never rebinds to a different exporter.
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jumpstarter_core::{
    conditions::{self, lease as cond, Condition},
    Exporter, Lease, Resource,
};
use tracing::{debug, info, warn};

use crate::{
    controller::Action,
    exporter::is_online,
    policy::{self, Admission},
    Ctx, Result,
};

pub const REASON_ASSIGNED: &str = "Assigned";
pub const REASON_WAITING: &str = "Waiting";
pub const REASON_RELEASED: &str = "Released";
pub const REASON_EXPIRED: &str = "Expired";
pub const REASON_PREEMPTED: &str = "Preempted";
pub const REASON_EXPORTER_LOST: &str = "ExporterLost";
pub const REASON_EXPORTER_OFFLINE: &str = "ExporterOffline";
pub const REASON_NO_MATCH: &str = "NoMatch";
pub const REASON_NO_ONLINE_MATCH: &str = "NoOnlineMatch";
pub const REASON_NO_POLICY_MATCH: &str = "NoPolicyMatch";
pub const REASON_CLIENT_NOT_FOUND: &str = "ClientNotFound";
pub const REASON_DURATION_EXCEEDED: &str = "DurationExceedsMaximum";

/// Retry delay after an optimistic-concurrency conflict.
const CONFLICT_RETRY: std::time::Duration = std::time::Duration::from_millis(200);
/// Fallback resync for leases parked in `Pending`.
const PENDING_RESYNC: std::time::Duration = std::time::Duration::from_secs(30);

/// Reconcile one lease by namespaced name.
#[tracing::instrument(skip(ctx), fields(lease = %format!("{namespace}/{name}")))]
pub async fn reconcile(ctx: &Ctx, namespace: &str, name: &str) -> Result<Action> {
    let Ok(lease) = ctx.stores.leases.get(namespace, name) else {
        // Deleted; the exporter reconciler clears any stale back-pointer.
        return Ok(Action::await_change());
    };
    let now = Utc::now();

    // `ended` is monotonic: nothing below may clear it.
    if lease.status.ended {
        return Ok(Action::await_change());
    }
    if lease.spec.release {
        return end_lease(ctx, lease, now, REASON_RELEASED);
    }
    match lease.status.exporter_ref.clone() {
        Some(exporter_ref) => reconcile_bound(ctx, lease, &exporter_ref, now),
        None => reconcile_pending(ctx, lease, now),
    }
}

fn reconcile_bound(ctx: &Ctx, mut lease: Lease, exporter_ref: &str, now: DateTime<Utc>) -> Result<Action> {
    let mut end_time = match lease.status.end_time {
        Some(end) => end,
        // A bound lease without an end time is malformed; expire it.
        None => now,
    };

    // An explicit shorten through the spec propagates to status.
    let mut shortened = false;
    if let Some(spec_end) = lease.spec.end_time {
        if spec_end < end_time {
            lease.status.end_time = Some(spec_end);
            end_time = spec_end;
            shortened = true;
        }
    }

    if now >= end_time {
        return end_lease(ctx, lease, now, REASON_EXPIRED);
    }

    match ctx.stores.exporters.get(&lease.metadata.namespace, exporter_ref) {
        Ok(exporter) => {
            if lease.status.spot_access && !is_online(&exporter, now, ctx.offline_timeout) {
                // Spot leases do not survive exporter loss.
                return end_lease(ctx, lease, now, REASON_EXPORTER_OFFLINE);
            }
        }
        Err(_) => return end_lease(ctx, lease, now, REASON_EXPORTER_LOST),
    }

    let mut changed = conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::READY, true, REASON_ASSIGNED, now),
    );
    changed |= conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::PENDING, false, REASON_ASSIGNED, now),
    );
    if (changed || shortened) && ctx.stores.leases.update_status(lease.clone()).is_err() {
        return Ok(Action::requeue(CONFLICT_RETRY));
    }

    let wait = (end_time - now).to_std().unwrap_or_default();
    Ok(Action::requeue(wait))
}

fn reconcile_pending(ctx: &Ctx, lease: Lease, now: DateTime<Utc>) -> Result<Action> {
    // `Unsatisfiable` is terminal; re-derivation stops here.
    if conditions::is_condition_true(&lease.status.conditions, cond::UNSATISFIABLE) {
        return Ok(Action::await_change());
    }

    // The requested window elapsed before a binding was found.
    if let Some(end) = lease.spec.end_time {
        if now >= end {
            return end_lease(ctx, lease, now, REASON_EXPIRED);
        }
    }

    // Future-dated leases wait for their window to open.
    if let Some(begin) = lease.spec.begin_time {
        if begin > now {
            let wait = (begin - now).to_std().unwrap_or_default();
            return park_pending(ctx, lease, now, REASON_WAITING, Action::requeue(wait));
        }
    }

    let namespace = lease.metadata.namespace.clone();
    let candidates = ctx.stores.exporters.list(&namespace, Some(&lease.spec.selector));
    if candidates.is_empty() {
        return mark_unsatisfiable(ctx, lease, now, REASON_NO_MATCH);
    }

    let client = match ctx.stores.clients.get(&namespace, &lease.spec.client_ref) {
        Ok(client) => client,
        Err(_) => return mark_unsatisfiable(ctx, lease, now, REASON_CLIENT_NOT_FOUND),
    };

    let policies = ctx.stores.policies.list(&namespace, None);
    let Some(admission) = policy::admit(&policies, &client, &candidates) else {
        return mark_unsatisfiable(ctx, lease, now, REASON_NO_POLICY_MATCH);
    };

    // Requested duration from the time triple; the RPC layer has already
    // derived the missing member.
    let Some(requested) = lease
        .spec
        .duration
        .map(|d| d.as_chrono())
        .or_else(|| match (lease.spec.begin_time, lease.spec.end_time) {
            (Some(begin), Some(end)) => Some(end - begin),
            _ => None,
        })
    else {
        return mark_unsatisfiable(ctx, lease, now, REASON_DURATION_EXCEEDED);
    };

    let effective = match admission.maximum_duration.map(|d| d.as_chrono()) {
        // A fixed window cannot be clamped, only rejected.
        Some(cap) if lease.spec.begin_time.is_some() && lease.spec.end_time.is_some() && requested > cap => {
            return mark_unsatisfiable(ctx, lease, now, REASON_DURATION_EXCEEDED);
        }
        Some(cap) => requested.min(cap),
        None => requested,
    };

    let online: Vec<&Exporter> = candidates
        .iter()
        .filter(|e| is_online(e, now, ctx.offline_timeout))
        .collect();
    if online.is_empty() {
        return mark_unsatisfiable(ctx, lease, now, REASON_NO_ONLINE_MATCH);
    }

    // Holdings are derived from the authoritative lease side, never from the
    // exporter back-pointer.
    let all_leases = ctx.stores.leases.list(&namespace, None);
    let held: HashSet<&str> = all_leases
        .iter()
        .filter(|l| l.is_active())
        .filter_map(|l| l.status.exporter_ref.as_deref())
        .collect();

    let mut free: Vec<(&Exporter, Admission)> = online
        .iter()
        .filter(|e| !held.contains(e.metadata.name.as_str()))
        .filter_map(|e| {
            policy::admit(&policies, &client, std::slice::from_ref(*e)).map(|a| (*e, a))
        })
        .collect();
    // Deterministic choice: highest-priority rule first, then smallest name.
    free.sort_by(|(ea, aa), (eb, ab)| {
        ab.priority
            .cmp(&aa.priority)
            .then_with(|| ea.metadata.name.cmp(&eb.metadata.name))
    });

    if !free.is_empty() {
        if !first_in_line(ctx, &lease, admission.priority, &free, &all_leases, &policies) {
            return park_pending(ctx, lease, now, REASON_WAITING, Action::requeue(PENDING_RESYNC));
        }
        for (exporter, exporter_admission) in &free {
            match try_bind(ctx, &lease, *exporter, exporter_admission, effective, now) {
                Ok(action) => return Ok(action),
                // Exporter patch conflict: drop this candidate, re-select.
                Err(()) => continue,
            }
        }
        return Ok(Action::requeue(CONFLICT_RETRY));
    }

    // No free exporter: preempt the lowest-priority spot holder strictly
    // below the requester.
    let mut victims: Vec<(&Exporter, &Lease)> = online
        .iter()
        .filter_map(|e| {
            all_leases
                .iter()
                .find(|l| l.is_active() && l.status.exporter_ref.as_deref() == Some(e.metadata.name.as_str()))
                .map(|holder| (*e, holder))
        })
        .filter(|(_, holder)| {
            holder.status.spot_access && holder.status.priority.unwrap_or_default() < admission.priority
        })
        .collect();
    victims.sort_by(|(ea, la), (eb, lb)| {
        la.status
            .priority
            .cmp(&lb.status.priority)
            .then_with(|| ea.metadata.name.cmp(&eb.metadata.name))
    });

    if let Some((exporter, victim)) = victims.first() {
        info!(
            victim = %victim.namespaced_name(),
            exporter = %exporter.metadata.name,
            "preempting spot lease"
        );
        if !try_end(ctx, (*victim).clone(), now, REASON_PREEMPTED) {
            return Ok(Action::requeue(CONFLICT_RETRY));
        }
        let exporter_admission = policy::admit(&policies, &client, std::slice::from_ref(*exporter))
            .unwrap_or(admission);
        return match try_bind(ctx, &lease, *exporter, &exporter_admission, effective, now) {
            Ok(action) => Ok(action),
            Err(()) => Ok(Action::requeue(CONFLICT_RETRY)),
        };
    }

    // Everything matching is busy; stay pending without error.
    park_pending(ctx, lease, now, REASON_WAITING, Action::requeue(PENDING_RESYNC))
}

/// Fairness: among pending leases competing for the free exporters, order by
/// (rule priority DESC, creation time ASC) and only bind while within the
/// free capacity.
fn first_in_line(
    ctx: &Ctx,
    lease: &Lease,
    priority: i32,
    free: &[(&Exporter, Admission)],
    all_leases: &[Lease],
    policies: &[jumpstarter_core::ExporterAccessPolicy],
) -> bool {
    let rank_key = |l: &Lease, p: i32| {
        (
            std::cmp::Reverse(p),
            l.metadata.creation_timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC),
            l.metadata.name.clone(),
        )
    };
    let own_key = rank_key(lease, priority);

    let ahead = all_leases
        .iter()
        .filter(|peer| {
            peer.metadata.name != lease.metadata.name
                && !peer.status.ended
                && peer.status.exporter_ref.is_none()
                && !conditions::is_condition_true(&peer.status.conditions, cond::UNSATISFIABLE)
        })
        .filter_map(|peer| {
            let matching: Vec<Exporter> = free
                .iter()
                .filter(|(e, _)| peer.spec.selector.matches(&e.metadata.labels))
                .map(|(e, _)| (*e).clone())
                .collect();
            if matching.is_empty() {
                return None;
            }
            let peer_client = ctx.stores.clients.get(&peer.metadata.namespace, &peer.spec.client_ref).ok()?;
            let peer_admission = policy::admit(policies, &peer_client, &matching)?;
            Some(rank_key(peer, peer_admission.priority))
        })
        .filter(|key| *key < own_key)
        .count();

    ahead < free.len()
}

/// Bind `lease` to `exporter`. Returns `Err(())` on an exporter patch
/// conflict so the caller can drop the candidate and re-select.
fn try_bind(
    ctx: &Ctx,
    lease: &Lease,
    exporter: &Exporter,
    admission: &Admission,
    effective: chrono::Duration,
    now: DateTime<Utc>,
) -> std::result::Result<Action, ()> {
    let mut patched = exporter.clone();
    patched.status.lease_ref = Some(lease.metadata.name.clone());
    if ctx.stores.exporters.update_status(patched).is_err() {
        debug!(exporter = %exporter.metadata.name, "exporter patch conflict, re-selecting");
        return Err(());
    }

    let begin = lease.spec.begin_time.unwrap_or(now);
    let mut end = begin + effective;
    if let Some(spec_end) = lease.spec.end_time {
        end = end.min(spec_end);
    }

    let mut bound = lease.clone();
    bound.status.begin_time = Some(begin);
    bound.status.end_time = Some(end);
    bound.status.exporter_ref = Some(exporter.metadata.name.clone());
    bound.status.priority = Some(admission.priority);
    bound.status.spot_access = admission.spot_access;
    conditions::set_condition(
        &mut bound.status.conditions,
        Condition::new(cond::PENDING, false, REASON_ASSIGNED, now),
    );
    conditions::set_condition(
        &mut bound.status.conditions,
        Condition::new(cond::READY, true, REASON_ASSIGNED, now),
    );

    if ctx.stores.leases.update_status(bound).is_err() {
        // Roll the exporter back as far as possible; its reconciler repairs
        // the rest.
        if let Ok(mut fresh) = ctx.stores.exporters.get(&exporter.metadata.namespace, &exporter.metadata.name) {
            if fresh.status.lease_ref.as_deref() == Some(lease.metadata.name.as_str()) {
                fresh.status.lease_ref = None;
                let _ = ctx.stores.exporters.update_status(fresh);
            }
        }
        return Ok(Action::requeue(CONFLICT_RETRY));
    }

    info!(exporter = %exporter.metadata.name, until = %end, "lease bound");
    let wait = (end - now).to_std().unwrap_or_default();
    Ok(Action::requeue(wait))
}

/// Mark `lease` ended. Returns false on a status-patch conflict; ending is
/// idempotent, so the caller just requeues.
fn try_end(ctx: &Ctx, mut lease: Lease, now: DateTime<Utc>, reason: &str) -> bool {
    lease.status.ended = true;
    lease.status.end_time = Some(lease.status.end_time.filter(|end| *end <= now).unwrap_or(now));
    conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::READY, false, reason, now),
    );
    conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::ENDED, true, reason, now),
    );
    if ctx.stores.leases.update_status(lease).is_err() {
        return false;
    }
    info!(reason, "lease ended");
    true
}

fn end_lease(ctx: &Ctx, lease: Lease, now: DateTime<Utc>, reason: &str) -> Result<Action> {
    if !try_end(ctx, lease.clone(), now, reason) {
        return Ok(Action::requeue(CONFLICT_RETRY));
    }

    // Free the exporter's derived back-pointer.
    if let Some(exporter_ref) = &lease.status.exporter_ref {
        if let Ok(mut exporter) = ctx.stores.exporters.get(&lease.metadata.namespace, exporter_ref) {
            if exporter.status.lease_ref.as_deref() == Some(lease.metadata.name.as_str()) {
                exporter.status.lease_ref = None;
                if ctx.stores.exporters.update_status(exporter).is_err() {
                    // The exporter reconciler recomputes the pointer anyway.
                    warn!(exporter = %exporter_ref, "conflict clearing exporter back-pointer");
                }
            }
        }
    }
    Ok(Action::await_change())
}

fn mark_unsatisfiable(ctx: &Ctx, mut lease: Lease, now: DateTime<Utc>, reason: &str) -> Result<Action> {
    let mut changed = conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::PENDING, false, reason, now),
    );
    changed |= conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::UNSATISFIABLE, true, reason, now),
    );
    if changed && ctx.stores.leases.update_status(lease).is_err() {
        return Ok(Action::requeue(CONFLICT_RETRY));
    }
    info!(reason, "lease unsatisfiable");
    Ok(Action::await_change())
}

fn park_pending(
    ctx: &Ctx,
    mut lease: Lease,
    now: DateTime<Utc>,
    reason: &str,
    action: Action,
) -> Result<Action> {
    let changed = conditions::set_condition(
        &mut lease.status.conditions,
        Condition::new(cond::PENDING, true, reason, now),
    );
    if changed && ctx.stores.leases.update_status(lease).is_err() {
        return Ok(Action::requeue(CONFLICT_RETRY));
    }
    Ok(action)
}
