use nexus_core::TaskEvent;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;
use uuid::Uuid;

const DEDUP_WINDOW: usize = 1024;

/// A session's event stream as seen by one observer.
///
/// Delivery upstream is at-least-once; the subscription drops events whose id
/// it has already yielded within the last 1024 events, and skips over
/// payloads it cannot decode or missed because it lagged.
pub struct Subscription {
    rx: broadcast::Receiver<Value>,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<Value>) -> Self {
        Self {
            rx,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Wait for the next unseen event. `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    if let Some(event) = self.accept(payload) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next unseen event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => {
                    if let Some(event) = self.accept(payload) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Every unseen event already buffered.
    pub fn drain(&mut self) -> Vec<TaskEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn accept(&mut self, payload: Value) -> Option<TaskEvent> {
        let event: TaskEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event");
                return None;
            }
        };
        if !self.seen.insert(event.event_id) {
            return None;
        }
        self.order.push_back(event.event_id);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        Some(event)
    }
}
