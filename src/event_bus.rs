//! Event Bus: per-user fan-out of lifecycle events to 0..N concurrent
//! dashboard subscribers, following the `broadcast::Sender<SseEvent>` +
//! `api/sse.rs` delivery pattern but one-channel-per-user instead of
//! one-channel-per-conversation, and extended with explicit per-sink miss
//! counting rather than relying entirely on axum's `KeepAlive`, which has no
//! notion of a subscriber going away.

use crate::ids::{TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    TaskCreated {
        task_id: TaskId,
        description: String,
        created_at: DateTime<Utc>,
    },
    TaskUpdate {
        task_id: TaskId,
        status: String,
        result: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    },
    ScheduleExecuted {
        task_id: String,
        run_count: u32,
        next_run: Option<DateTime<Utc>>,
    },
    StorageUpdate {
        used_bytes: u64,
        quota_bytes: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    sink: mpsc::Sender<BusEvent>,
    missed_pongs: u32,
}

/// A subscription handle returned from `subscribe`. Holding the receiver
/// keeps the subscription registered; dropping it lets the bus reclaim the
/// slot lazily on the next publish.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<BusEvent>,
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
    missed_pong_limit: u32,
}

impl EventBus {
    pub fn new(missed_pong_limit: u32) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            missed_pong_limit,
        }
    }

    pub async fn subscribe(&self, user: &UserId) -> Subscription {
        let (tx, rx) = mpsc::channel(64);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(user.as_str().to_string())
            .or_default()
            .push(Subscriber {
                id,
                sink: tx,
                missed_pongs: 0,
            });
        Subscription { id, receiver: rx }
    }

    /// Best-effort delivery to every current sink for the user, in publish
    /// order (P5). A sink whose channel is closed or full is dropped;
    /// other sinks are unaffected.
    pub async fn publish(&self, user: &UserId, event: BusEvent) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(sinks) = subscribers.get_mut(user.as_str()) else {
            return;
        };
        sinks.retain(|sub| match sub.sink.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(user_id = %user, subscription = sub.id.0, "dropping event bus sink: send failed");
                false
            }
        });
    }

    pub async fn broadcast_task_created(&self, user: &UserId, task_id: &TaskId, description: &str) {
        self.publish(
            user,
            BusEvent::TaskCreated {
                task_id: task_id.clone(),
                description: description.to_string(),
                created_at: Utc::now(),
            },
        )
        .await;
    }

    pub async fn broadcast_task_update(
        &self,
        user: &UserId,
        task_id: &TaskId,
        status: &str,
        result: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) {
        self.publish(
            user,
            BusEvent::TaskUpdate {
                task_id: task_id.clone(),
                status: status.to_string(),
                result,
                completed_at,
            },
        )
        .await;
    }

    pub async fn broadcast_schedule_executed(
        &self,
        user: &UserId,
        task_id: &str,
        run_count: u32,
        next_run: Option<DateTime<Utc>>,
    ) {
        self.publish(
            user,
            BusEvent::ScheduleExecuted {
                task_id: task_id.to_string(),
                run_count,
                next_run,
            },
        )
        .await;
    }

    pub async fn broadcast_storage_update(&self, user: &UserId, used_bytes: u64, quota_bytes: u64) {
        self.publish(user, BusEvent::StorageUpdate { used_bytes, quota_bytes })
            .await;
    }

    /// Send a ping to every sink across every user, incrementing each
    /// sink's miss counter; a sink with unanswered pings past the limit is
    /// dropped. Called on a periodic tick (default 30s) by the host's
    /// background liveness loop.
    pub async fn tick_liveness(&self) {
        let mut subscribers = self.subscribers.lock().await;
        let limit = self.missed_pong_limit;
        for sinks in subscribers.values_mut() {
            sinks.retain_mut(|sub| {
                if sub.missed_pongs >= limit {
                    tracing::debug!(subscription = sub.id.0, "dropping event bus sink: missed pongs");
                    return false;
                }
                match sub.sink.try_send(BusEvent::Ping) {
                    Ok(()) => {
                        sub.missed_pongs += 1;
                        true
                    }
                    Err(_) => false,
                }
            });
        }
        subscribers.retain(|_, sinks| !sinks.is_empty());
    }

    /// Record a pong from the given subscription, resetting its miss
    /// counter.
    pub async fn record_pong(&self, user: &UserId, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(sinks) = subscribers.get_mut(user.as_str()) {
            if let Some(sub) = sinks.iter_mut().find(|s| s.id == id) {
                sub.missed_pongs = 0;
            }
        }
    }

    pub async fn subscriber_count(&self, user: &UserId) -> usize {
        self.subscribers
            .lock()
            .await
            .get(user.as_str())
            .map_or(0, Vec::len)
    }
}
