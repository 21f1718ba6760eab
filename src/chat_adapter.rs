//! `ChatAdapter`: the external collaborator the Task Manager and Session
//! deliver user-visible effects through (§6). Consumed, not owned — a real
//! deployment wires in whatever chat transport it actually speaks; this
//! crate only defines the contract and the per-user FIFO serialization
//! §5 requires ("the authoritative serialization point for user-visible
//! effects"), the same way `QuotaGate` in `quota.rs` defines a trait the
//! core consumes plus one concrete default implementation.

use crate::ids::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub enum ChatEffect {
    SendText(String),
    SendFile { path: PathBuf, caption: Option<String> },
    React { message_ref: String, emoji: Option<String> },
    SetTyping,
    NotifyMenuCommandSet(Vec<String>),
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn send_text(&self, user: &UserId, body: &str);
    async fn send_file(&self, user: &UserId, path: &Path, caption: Option<&str>);
    async fn react(&self, user: &UserId, message_ref: &str, emoji: Option<&str>);
    async fn set_typing(&self, user: &UserId);
    async fn notify_menu_command_set(&self, user: &UserId, commands: &[String]);
}

/// Adapter that only logs — suitable when no chat transport is wired in
/// yet (tests, local development) and as the fallback the rest of the
/// crate can always depend on.
pub struct LoggingChatAdapter;

#[async_trait]
impl ChatAdapter for LoggingChatAdapter {
    async fn send_text(&self, user: &UserId, body: &str) {
        tracing::info!(user_id = %user, len = body.len(), "chat adapter: send_text");
    }

    async fn send_file(&self, user: &UserId, path: &Path, caption: Option<&str>) {
        tracing::info!(user_id = %user, path = %path.display(), ?caption, "chat adapter: send_file");
    }

    async fn react(&self, user: &UserId, message_ref: &str, emoji: Option<&str>) {
        tracing::info!(user_id = %user, message_ref, ?emoji, "chat adapter: react");
    }

    async fn set_typing(&self, user: &UserId) {
        tracing::debug!(user_id = %user, "chat adapter: set_typing");
    }

    async fn notify_menu_command_set(&self, user: &UserId, commands: &[String]) {
        tracing::info!(user_id = %user, ?commands, "chat adapter: notify_menu_command_set");
    }
}

/// Wraps any `ChatAdapter` with a per-user FIFO queue so that effects
/// enqueued for one user are delivered to the underlying adapter strictly
/// in enqueue order (P5), even when multiple callers (Task Manager,
/// Scheduler, Session) enqueue concurrently. One background task per user
/// drains its queue; adapter failures are logged and do not propagate to
/// the enqueuing caller (§6 "Adapter failures are logged and do not fail
/// the originating task").
pub struct SerializedChatAdapter {
    inner: Arc<dyn ChatAdapter>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<ChatEffect>>>,
}

impl SerializedChatAdapter {
    pub fn new(inner: Arc<dyn ChatAdapter>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            queues: Mutex::new(HashMap::new()),
        })
    }

    async fn sender_for(self: &Arc<Self>, user: &UserId) -> mpsc::UnboundedSender<ChatEffect> {
        let mut queues = self.queues.lock().await;
        if let Some(tx) = queues.get(user.as_str()) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatEffect>();
        let inner = self.inner.clone();
        let user_owned = user.clone();
        tokio::spawn(async move {
            while let Some(effect) = rx.recv().await {
                deliver(&inner, &user_owned, effect).await;
            }
        });
        queues.insert(user.as_str().to_string(), tx.clone());
        tx
    }

    pub async fn enqueue(self: &Arc<Self>, user: &UserId, effect: ChatEffect) {
        let tx = self.sender_for(user).await;
        if tx.send(effect).is_err() {
            tracing::warn!(user_id = %user, "chat adapter queue closed unexpectedly");
        }
    }
}

async fn deliver(inner: &Arc<dyn ChatAdapter>, user: &UserId, effect: ChatEffect) {
    match effect {
        ChatEffect::SendText(body) => inner.send_text(user, &body).await,
        ChatEffect::SendFile { path, caption } => {
            inner.send_file(user, &path, caption.as_deref()).await;
        }
        ChatEffect::React { message_ref, emoji } => {
            inner.react(user, &message_ref, emoji.as_deref()).await;
        }
        ChatEffect::SetTyping => inner.set_typing(user).await,
        ChatEffect::NotifyMenuCommandSet(commands) => {
            inner.notify_menu_command_set(user, &commands).await;
        }
    }
}
