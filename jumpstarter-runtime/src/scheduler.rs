//! Delays and deduplicates reconcile requests.
use std::{collections::HashMap, hash::Hash, task::Poll};

use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to emit `message` at `run_at`.
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    pub message: T,
    pub run_at: Instant,
}

impl<T> ScheduleRequest<T> {
    pub fn now(message: T) -> Self {
        Self {
            message,
            run_at: Instant::now(),
        }
    }
}

/// A deduplicating delay queue for reconcile requests.
///
/// Each message occupies at most one slot; scheduling an already-queued
/// message keeps the earlier `run_at`. This is what lets watch storms and
/// requeue loops collapse into a single pending reconcile per object.
pub struct Scheduler<T> {
    queue: DelayQueue<T>,
    scheduled: HashMap<T, (Instant, delay_queue::Key)>,
}

impl<T: Hash + Eq + Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq + Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
        }
    }

    /// Schedule `request.message`; if already queued, the earlier `run_at`
    /// takes precedence.
    pub fn schedule(&mut self, request: ScheduleRequest<T>) {
        match self.scheduled.get_mut(&request.message) {
            Some((run_at, key)) if *run_at > request.run_at => {
                self.queue.reset_at(key, request.run_at);
                *run_at = request.run_at;
            }
            Some(_) => {}
            None => {
                let key = self.queue.insert_at(request.message.clone(), request.run_at);
                self.scheduled.insert(request.message, (request.run_at, key));
            }
        }
    }

    /// Wait for the next due message.
    ///
    /// Pends indefinitely while the queue is empty; the controller loop
    /// selects this against its watch streams, which are the only writers.
    pub async fn next(&mut self) -> T {
        futures::future::poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let message = expired.into_inner();
                self.scheduled.remove(&message);
                Poll::Ready(message)
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}
