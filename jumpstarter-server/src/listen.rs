//! Per-lease listen queues.
//!
//! Each lease held by an exporter opens one queue on the controller; `Dial`
//! pushes a `ListenResponse` onto it and the exporter drains it from the
//! `Listen` stream. Queues are process-local, bounded, and removed when the
//! lease ends or the exporter's stream goes away.
use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::proto::ListenResponse;

/// At most one outstanding dial per lease is expected; a little slack
/// absorbs racing dials before overflow turns into `ResourceExhausted`.
pub const QUEUE_DEPTH: usize = 8;

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// No exporter is listening for this lease.
    NotListening,
    /// The queue is full; the exporter is not draining dials.
    Full,
}

#[derive(Default)]
pub struct ListenQueues {
    queues: Mutex<HashMap<String, mpsc::Sender<ListenResponse>>>,
}

impl ListenQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the queue for `lease_name`, replacing any previous listener.
    pub fn subscribe(&self, lease_name: &str) -> mpsc::Receiver<ListenResponse> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.queues.lock().insert(lease_name.to_string(), tx);
        rx
    }

    /// Deliver one dial message to the exporter listening on `lease_name`.
    pub fn push(&self, lease_name: &str, message: ListenResponse) -> Result<(), PushError> {
        let mut queues = self.queues.lock();
        let Some(tx) = queues.get(lease_name) else {
            return Err(PushError::NotListening);
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The listen stream went away; reap the dead entry.
                queues.remove(lease_name);
                Err(PushError::NotListening)
            }
        }
    }

    /// Drop the queue, e.g. when the lease ends.
    pub fn remove(&self, lease_name: &str) {
        self.queues.lock().remove(lease_name);
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ListenResponse {
        ListenResponse {
            router_endpoint: "router.example.com:8083".into(),
            router_token: "ticket".into(),
        }
    }

    #[tokio::test]
    async fn push_reaches_subscriber() {
        let queues = ListenQueues::new();
        let mut rx = queues.subscribe("lease-1");
        queues.push("lease-1", message()).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.router_endpoint, "router.example.com:8083");
    }

    #[test]
    fn push_without_listener_fails() {
        let queues = ListenQueues::new();
        assert_eq!(queues.push("lease-1", message()), Err(PushError::NotListening));
    }

    #[test]
    fn overflow_is_reported() {
        let queues = ListenQueues::new();
        let _rx = queues.subscribe("lease-1");
        for _ in 0..QUEUE_DEPTH {
            queues.push("lease-1", message()).unwrap();
        }
        assert_eq!(queues.push("lease-1", message()), Err(PushError::Full));
    }

    #[test]
    fn dropped_listener_is_reaped() {
        let queues = ListenQueues::new();
        let rx = queues.subscribe("lease-1");
        drop(rx);
        assert_eq!(queues.push("lease-1", message()), Err(PushError::NotListening));
        assert!(queues.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_listener() {
        let queues = ListenQueues::new();
        let _old = queues.subscribe("lease-1");
        let mut new = queues.subscribe("lease-1");
        assert_eq!(queues.len(), 1);
        queues.push("lease-1", message()).unwrap();
        assert!(new.recv().await.is_some());
    }
}
