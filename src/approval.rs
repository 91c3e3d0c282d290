//! Approval Manager (C5): pending-approval rendezvous and session memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::events::{Event, EventPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResult {
    Approved,
    ApprovedRemember,
    Denied,
    DeniedRemember,
    Timeout,
}

impl ApprovalResult {
    pub fn approved(self) -> bool {
        matches!(self, ApprovalResult::Approved | ApprovalResult::ApprovedRemember)
    }

    pub fn remember(self) -> bool {
        matches!(
            self,
            ApprovalResult::ApprovedRemember | ApprovalResult::DeniedRemember
        )
    }
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: String,
    pub command: String,
    pub rule_name: String,
    pub reason: String,
    pub timeout: Duration,
    pub created_at: Instant,
    pub working_dir: Option<String>,
    pub client_pid: Option<u32>,
}

struct Waiting {
    info: PendingApproval,
    resolver: oneshot::Sender<ApprovalResult>,
}

/// Registers pending approvals, resolves them via `approve`/`deny`, and
/// times them out if nobody does. A coarse lock guards the pending map;
/// under the daemon's single-threaded cooperative model it's never
/// contended but must still exist for correctness (§5).
pub struct ApprovalManager {
    publisher: EventPublisher,
    pending: Arc<Mutex<HashMap<String, Waiting>>>,
}

impl ApprovalManager {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a waiter, publishes `approval_needed`, starts a timeout
    /// task, and awaits resolution. Returns once `approve`, `deny`, or
    /// the timeout resolves the waiter.
    pub async fn request_approval(
        &self,
        command: &str,
        rule_name: &str,
        reason: &str,
        timeout: Duration,
        working_dir: Option<String>,
        client_pid: Option<u32>,
    ) -> ApprovalResult {
        let approval_id = uuid::Uuid::new_v4().to_string();
        self.request_approval_with_id(approval_id, command, rule_name, reason, timeout, working_dir, client_pid)
            .await
            .1
    }

    /// Same as `request_approval`, but lets the caller supply the id up
    /// front (so it can be handed to the client in an intermediate
    /// response before the approval resolves). Returns the id alongside
    /// the eventual result.
    pub async fn request_approval_with_id(
        &self,
        approval_id: String,
        command: &str,
        rule_name: &str,
        reason: &str,
        timeout: Duration,
        working_dir: Option<String>,
        client_pid: Option<u32>,
    ) -> (String, ApprovalResult) {
        let (tx, rx) = oneshot::channel();

        let info = PendingApproval {
            approval_id: approval_id.clone(),
            command: command.to_string(),
            rule_name: rule_name.to_string(),
            reason: reason.to_string(),
            timeout,
            created_at: Instant::now(),
            working_dir: working_dir.clone(),
            client_pid,
        };

        self.pending
            .lock()
            .await
            .insert(approval_id.clone(), Waiting { info, resolver: tx });

        self.publisher
            .publish(Event::approval_needed(
                &approval_id,
                command,
                rule_name,
                reason,
                working_dir.as_deref(),
                client_pid,
            ))
            .await;

        let pending = self.pending.clone();
        let publisher = self.publisher.clone();
        let timeout_id = approval_id.clone();
        let timeout_wd = working_dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let removed = pending.lock().await.remove(&timeout_id);
            if let Some(waiting) = removed {
                // Publish before resolving the waiter so no monitor can
                // observe the final response before the resolved event.
                publisher
                    .publish(Event::approval_resolved(
                        &timeout_id,
                        false,
                        Some("Approval timed out"),
                        timeout_wd.as_deref(),
                        None,
                    ))
                    .await;
                let _ = waiting.resolver.send(ApprovalResult::Timeout);
            }
        });

        let result = rx.await.unwrap_or(ApprovalResult::Timeout);
        (approval_id, result)
    }

    pub async fn approve(&self, approval_id: &str, remember: bool) -> bool {
        self.resolve(approval_id, true, None, remember).await
    }

    pub async fn deny(&self, approval_id: &str, reason: Option<String>, remember: bool) -> bool {
        self.resolve(approval_id, false, reason, remember).await
    }

    async fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
        remember: bool,
    ) -> bool {
        let removed = self.pending.lock().await.remove(approval_id);
        let Some(waiting) = removed else {
            return false;
        };

        self.publisher
            .publish(Event::approval_resolved(
                approval_id,
                approved,
                reason.as_deref(),
                waiting.info.working_dir.as_deref(),
                waiting.info.client_pid,
            ))
            .await;

        let result = match (approved, remember) {
            (true, true) => ApprovalResult::ApprovedRemember,
            (true, false) => ApprovalResult::Approved,
            (false, true) => ApprovalResult::DeniedRemember,
            (false, false) => ApprovalResult::Denied,
        };
        waiting.resolver.send(result).is_ok()
    }

    pub async fn list_pending(&self) -> Vec<PendingApproval> {
        self.pending.lock().await.values().map(|w| w.info.clone()).collect()
    }

    pub async fn get_pending(&self, approval_id: &str) -> Option<PendingApproval> {
        self.pending.lock().await.get(approval_id).map(|w| w.info.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

// Session memory ---------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    pub rule_name: String,
    pub base_command: String,
}

impl MemoryKey {
    pub fn new(rule_name: impl Into<String>, base_command: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            base_command: base_command.into(),
        }
    }
}

/// In-process, TTL-scoped memory of recently approved/denied
/// (rule, base_command) pairs. Never persisted; lost on daemon restart.
pub struct SessionMemory {
    ttl: Duration,
    approved: std::sync::Mutex<HashMap<MemoryKey, Instant>>,
    denied: std::sync::Mutex<HashMap<MemoryKey, Instant>>,
}

impl SessionMemory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            approved: std::sync::Mutex::new(HashMap::new()),
            denied: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, at: Instant) -> bool {
        self.ttl != Duration::ZERO && at.elapsed() >= self.ttl
    }

    pub fn is_pre_approved(&self, key: &MemoryKey) -> bool {
        let mut approved = self.approved.lock().unwrap();
        match approved.get(key) {
            Some(&at) if self.expired(at) => {
                approved.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn is_pre_denied(&self, key: &MemoryKey) -> bool {
        let mut denied = self.denied.lock().unwrap();
        match denied.get(key) {
            Some(&at) if self.expired(at) => {
                denied.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn remember_approval(&self, key: MemoryKey) {
        self.denied.lock().unwrap().remove(&key);
        self.approved.lock().unwrap().insert(key, Instant::now());
    }

    pub fn remember_denial(&self, key: MemoryKey) {
        self.approved.lock().unwrap().remove(&key);
        self.denied.lock().unwrap().insert(key, Instant::now());
    }

    pub fn clear(&self) {
        self.approved.lock().unwrap().clear();
        self.denied.lock().unwrap().clear();
    }

    pub fn stats(&self) -> (usize, usize) {
        (
            self.approved.lock().unwrap().len(),
            self.denied.lock().unwrap().len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn publisher() -> EventPublisher {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn approve_resolves_waiter_as_approved() {
        let manager = ApprovalManager::new(publisher());
        let manager = Arc::new(manager);
        let m2 = manager.clone();

        let handle = tokio::spawn(async move {
            m2.request_approval("git push --force", "r1", "reason", Duration::from_secs(5), None, None)
                .await
        });

        // give the request time to register
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = manager.list_pending().await;
        assert_eq!(pending.len(), 1);

        let ok = manager.approve(&pending[0].approval_id, true).await;
        assert!(ok);
        let result = handle.await.unwrap();
        assert_eq!(result, ApprovalResult::ApprovedRemember);
    }

    #[tokio::test]
    async fn deny_resolves_waiter_as_denied() {
        let manager = Arc::new(ApprovalManager::new(publisher()));
        let m2 = manager.clone();
        let handle = tokio::spawn(async move {
            m2.request_approval("rm -rf x", "r2", "reason", Duration::from_secs(5), None, None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = manager.list_pending().await;
        manager.deny(&pending[0].approval_id, Some("no".into()), false).await;
        assert_eq!(handle.await.unwrap(), ApprovalResult::Denied);
    }

    #[tokio::test]
    async fn timeout_resolves_when_nobody_responds() {
        let manager = Arc::new(ApprovalManager::new(publisher()));
        let result = manager
            .request_approval("rm -rf x", "r3", "reason", Duration::from_millis(30), None, None)
            .await;
        assert_eq!(result, ApprovalResult::Timeout);
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn resolve_on_unknown_id_returns_false() {
        let manager = ApprovalManager::new(publisher());
        assert!(!manager.approve("nonexistent", false).await);
        assert!(!manager.deny("nonexistent", None, false).await);
    }

    #[test]
    fn session_memory_expires_after_ttl() {
        let memory = SessionMemory::new(Duration::from_millis(20));
        let key = MemoryKey::new("r1", "git");
        memory.remember_approval(key.clone());
        assert!(memory.is_pre_approved(&key));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!memory.is_pre_approved(&key));
    }

    #[test]
    fn session_memory_zero_ttl_never_expires() {
        let memory = SessionMemory::new(Duration::ZERO);
        let key = MemoryKey::new("r1", "git");
        memory.remember_approval(key.clone());
        std::thread::sleep(Duration::from_millis(10));
        assert!(memory.is_pre_approved(&key));
    }

    #[test]
    fn remembering_approval_clears_prior_denial() {
        let memory = SessionMemory::new(Duration::from_secs(60));
        let key = MemoryKey::new("r1", "git");
        memory.remember_denial(key.clone());
        assert!(memory.is_pre_denied(&key));
        memory.remember_approval(key.clone());
        assert!(!memory.is_pre_denied(&key));
        assert!(memory.is_pre_approved(&key));
    }
}
