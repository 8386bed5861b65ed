//! Human-in-the-loop confirmation gate
//!
//! Every failure mode of a confirmation (timeout, nobody listening, responder
//! dropped) resolves to a denial.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait ConfirmationService: Send + Sync {
    /// Ask whether `action` may proceed. `true` means approved.
    async fn request(&self, action: &str, details: &BTreeMap<String, String>) -> bool;
}

/// Fixed answer for non-interactive and CI contexts
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm {
    approve: bool,
}

impl AutoConfirm {
    pub fn approve() -> Self {
        Self { approve: true }
    }

    pub fn deny() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl ConfirmationService for AutoConfirm {
    async fn request(&self, action: &str, _details: &BTreeMap<String, String>) -> bool {
        debug!(action, approved = self.approve, "auto confirmation");
        self.approve
    }
}

/// A confirmation waiting for a decision. Answer it exactly once.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub id: Uuid,
    pub action: String,
    pub details: BTreeMap<String, String>,
    pub requested_at: DateTime<Utc>,
    responder: oneshot::Sender<bool>,
}

impl PendingConfirmation {
    pub fn approve(self) {
        self.respond(true);
    }

    pub fn deny(self) {
        self.respond(false);
    }

    pub fn respond(self, approved: bool) {
        // requester may have timed out already
        let _ = self.responder.send(approved);
    }
}

/// Receiving side of a [`ChannelConfirmation`]
#[derive(Debug)]
pub struct ConfirmationInbox {
    rx: mpsc::Receiver<PendingConfirmation>,
}

impl ConfirmationInbox {
    /// Next pending confirmation, or `None` once every service handle is gone
    pub async fn recv(&mut self) -> Option<PendingConfirmation> {
        self.rx.recv().await
    }
}

/// Delivers requests to an external decision maker and waits, bounded by
/// `timeout`, for the answer
#[derive(Debug, Clone)]
pub struct ChannelConfirmation {
    tx: mpsc::Sender<PendingConfirmation>,
    timeout: Duration,
}

impl ChannelConfirmation {
    pub fn new(timeout: Duration) -> (Self, ConfirmationInbox) {
        let (tx, rx) = mpsc::channel(16);
        (Self { tx, timeout }, ConfirmationInbox { rx })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ConfirmationService for ChannelConfirmation {
    async fn request(&self, action: &str, details: &BTreeMap<String, String>) -> bool {
        let (responder, decision) = oneshot::channel();
        let pending = PendingConfirmation {
            id: Uuid::new_v4(),
            action: action.to_string(),
            details: details.clone(),
            requested_at: Utc::now(),
            responder,
        };
        let id = pending.id;

        let wait = async {
            if self.tx.send(pending).await.is_err() {
                warn!(%id, action, "no confirmation listener, denying");
                return false;
            }
            match decision.await {
                Ok(approved) => approved,
                Err(_) => {
                    warn!(%id, action, "confirmation dropped without an answer, denying");
                    false
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(approved) => {
                info!(%id, action, approved, "confirmation resolved");
                approved
            }
            Err(_) => {
                warn!(%id, action, timeout_secs = self.timeout.as_secs(), "confirmation timed out, denying");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> BTreeMap<String, String> {
        BTreeMap::from([("risk_level".to_string(), "HIGH".to_string())])
    }

    #[tokio::test]
    async fn test_auto_confirm() {
        assert!(AutoConfirm::approve().request("execute_code", &details()).await);
        assert!(!AutoConfirm::deny().request("execute_code", &details()).await);
    }

    #[tokio::test]
    async fn test_channel_approve() {
        let (service, mut inbox) = ChannelConfirmation::new(Duration::from_secs(5));
        let responder = tokio::spawn(async move {
            let pending = inbox.recv().await.unwrap();
            assert_eq!(pending.action, "execute_code");
            assert_eq!(pending.details["risk_level"], "HIGH");
            pending.approve();
        });
        assert!(service.request("execute_code", &details()).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_deny() {
        let (service, mut inbox) = ChannelConfirmation::new(Duration::from_secs(5));
        tokio::spawn(async move {
            if let Some(pending) = inbox.recv().await {
                pending.deny();
            }
        });
        assert!(!service.request("execute_code", &details()).await);
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let (service, mut inbox) = ChannelConfirmation::new(Duration::from_millis(100));
        let holder = tokio::spawn(async move {
            // receive but never answer
            let pending = inbox.recv().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(pending);
        });
        let started = std::time::Instant::now();
        assert!(!service.request("execute_code", &details()).await);
        assert!(started.elapsed() < Duration::from_millis(900));
        holder.abort();
    }

    #[tokio::test]
    async fn test_dropped_responder_denies() {
        let (service, mut inbox) = ChannelConfirmation::new(Duration::from_secs(5));
        tokio::spawn(async move {
            let pending = inbox.recv().await;
            drop(pending);
        });
        assert!(!service.request("execute_code", &details()).await);
    }

    #[tokio::test]
    async fn test_closed_inbox_denies() {
        let (service, inbox) = ChannelConfirmation::new(Duration::from_secs(5));
        drop(inbox);
        assert!(!service.request("execute_code", &details()).await);
    }
}
