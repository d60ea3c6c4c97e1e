//! Connects store watches to reconcile invocations.
//!
//! One loop per resource kind, single-writer: reconciles are serialized per
//! kind, which trivially satisfies the per-lease serialization the scheduler
//! needs. Watch events map to reconcile keys, get deduplicated through the
//! [`Scheduler`], and requeues flow back in through the same queue.
use std::{future::Future, sync::Arc, time::Duration};

use jumpstarter_core::Resource;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

use crate::{
    scheduler::{ScheduleRequest, Scheduler},
    Ctx, Result,
};

/// Result of a reconciliation attempt.
///
/// `requeue` schedules another pass even without a watch trigger, which is
/// how expiry deadlines and conflict retries are expressed. `await_change`
/// waits for the next relevant watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    #[must_use]
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Namespaced name of the object to reconcile.
pub type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.meta().namespace.clone(), obj.meta().name.clone())
}

/// Delay applied to reconcile retries after a reconciler error.
const ERROR_RETRY: Duration = Duration::from_secs(1);

/// Core loop shared by the per-kind controllers: drain trigger keys into the
/// dedup scheduler, run due reconciles one at a time, feed requeues back.
async fn run<F, Fut>(mut triggers: mpsc::UnboundedReceiver<Key>, mut reconcile: F)
where
    F: FnMut(Key) -> Fut,
    Fut: Future<Output = Result<Action>>,
{
    let mut scheduler = Scheduler::new();
    loop {
        tokio::select! {
            trigger = triggers.recv() => match trigger {
                Some(key) => scheduler.schedule(ScheduleRequest::now(key)),
                // All watch forwarders are gone: the store shut down.
                None => return,
            },
            key = scheduler.next() => {
                debug!(namespace = %key.0, name = %key.1, "reconciling");
                match reconcile(key.clone()).await {
                    Ok(action) => {
                        if let Some(delay) = action.requeue_after() {
                            scheduler.schedule(ScheduleRequest {
                                message: key,
                                run_at: Instant::now() + delay,
                            });
                        }
                    }
                    Err(error) => {
                        warn!(namespace = %key.0, name = %key.1, %error, "reconcile failed, retrying");
                        scheduler.schedule(ScheduleRequest {
                            message: key,
                            run_at: Instant::now() + ERROR_RETRY,
                        });
                    }
                }
            }
        }
    }
}

/// Keys to reconcile when a lease event fires: the lease itself plus every
/// pending peer in the namespace, which may now be able to bind.
fn lease_event_triggers(ctx: &Ctx, lease: &jumpstarter_core::Lease) -> Vec<Key> {
    let namespace = &lease.metadata.namespace;
    let mut keys = vec![key_of(lease)];
    for peer in ctx.stores.leases.list(namespace, None) {
        if !peer.status.ended && peer.status.exporter_ref.is_none() && peer.metadata.name != lease.metadata.name {
            keys.push(key_of(&peer));
        }
    }
    keys
}

/// Keys to reconcile when an exporter event fires: leases bound to it and
/// every pending lease in the namespace.
fn exporter_event_triggers(ctx: &Ctx, exporter: &jumpstarter_core::Exporter) -> Vec<Key> {
    let namespace = &exporter.metadata.namespace;
    ctx.stores
        .leases
        .list(namespace, None)
        .iter()
        .filter(|lease| {
            !lease.status.ended
                && (lease.status.exporter_ref.is_none()
                    || lease.status.exporter_ref.as_deref() == Some(exporter.metadata.name.as_str()))
        })
        .map(key_of)
        .collect()
}

/// Run the lease scheduler until the store shuts down.
pub async fn run_lease_controller(ctx: Arc<Ctx>) {
    let (tx, rx) = mpsc::unbounded_channel();

    {
        let ctx = ctx.clone();
        let tx = tx.clone();
        let mut leases = ctx.stores.leases.watch();
        tokio::spawn(async move {
            loop {
                match leases.recv().await {
                    Ok(event) => {
                        for key in lease_event_triggers(&ctx, event.object()) {
                            if tx.send(key).is_err() {
                                return;
                            }
                        }
                    }
                    // Lagged watchers lose events; the periodic requeue of
                    // pending leases recovers what was missed.
                    Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                    Err(async_broadcast::RecvError::Closed) => return,
                }
            }
        });
    }
    {
        let ctx = ctx.clone();
        let tx = tx.clone();
        let mut exporters = ctx.stores.exporters.watch();
        tokio::spawn(async move {
            loop {
                match exporters.recv().await {
                    Ok(event) => {
                        for key in exporter_event_triggers(&ctx, event.object()) {
                            if tx.send(key).is_err() {
                                return;
                            }
                        }
                    }
                    Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                    Err(async_broadcast::RecvError::Closed) => return,
                }
            }
        });
    }
    drop(tx);

    run(rx, move |key: Key| {
        let ctx = ctx.clone();
        async move { crate::lease::reconcile(&ctx, &key.0, &key.1).await }
    })
    .await;
}

/// Run the exporter liveness reconciler until the store shuts down.
pub async fn run_exporter_controller(ctx: Arc<Ctx>) {
    let (tx, rx) = mpsc::unbounded_channel();

    {
        let tx = tx.clone();
        let mut exporters = ctx.stores.exporters.watch();
        tokio::spawn(async move {
            loop {
                match exporters.recv().await {
                    Ok(event) => {
                        if tx.send(key_of(event.object())).is_err() {
                            return;
                        }
                    }
                    Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                    Err(async_broadcast::RecvError::Closed) => return,
                }
            }
        });
    }
    {
        // Lease transitions drive the derived back-pointer on the exporter.
        let tx = tx.clone();
        let mut leases = ctx.stores.leases.watch();
        tokio::spawn(async move {
            loop {
                match leases.recv().await {
                    Ok(event) => {
                        let lease = event.object();
                        if let Some(exporter_ref) = &lease.status.exporter_ref {
                            if tx
                                .send((lease.metadata.namespace.clone(), exporter_ref.clone()))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                    Err(async_broadcast::RecvError::Closed) => return,
                }
            }
        });
    }
    drop(tx);

    run(rx, move |key: Key| {
        let ctx = ctx.clone();
        async move { crate::exporter::reconcile(&ctx, &key.0, &key.1).await }
    })
    .await;
}
