//! Peer registry
//!
//! Authoritative set of connected peers. Exactly one peer may hold the
//! `extension` role; registering a second extension evicts the first.
//! Consumers must treat `snapshot()` as the only source of truth and never
//! cache peer existence across frames.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::util::unix_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    #[serde(rename = "mcp-client")]
    McpClient,
    #[serde(rename = "extension")]
    Extension,
}

/// One registered peer, as published in `_client_list_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub role: PeerRole,
    pub capabilities: Vec<String>,
    #[serde(rename = "connectedAt")]
    pub connected_at: u64,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Outcome of a registration, including any extension peer it displaced.
#[derive(Debug)]
pub struct Registration {
    pub peer: PeerInfo,
    pub evicted_extension: Option<String>,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A requested id is honored when free (pull peers
    /// re-register under their old id across heartbeats); otherwise a fresh
    /// uuid is assigned. A new extension replaces any existing one.
    pub fn register(
        &self,
        requested_id: Option<String>,
        role: PeerRole,
        capabilities: Vec<String>,
        metadata: Value,
    ) -> Result<Registration, BridgeError> {
        let mut peers = self.peers.write();

        let id = match requested_id {
            Some(id) if !id.trim().is_empty() => {
                if let Some(existing) = peers.get(&id) {
                    if existing.role != role {
                        return Err(BridgeError::InvalidParams(format!(
                            "peer id {id} is already registered with a different role"
                        )));
                    }
                }
                id
            }
            _ => Uuid::new_v4().to_string(),
        };

        let mut evicted_extension = None;
        if role == PeerRole::Extension {
            let prior: Vec<String> = peers
                .values()
                .filter(|p| p.role == PeerRole::Extension && p.id != id)
                .map(|p| p.id.clone())
                .collect();
            for old in prior {
                peers.remove(&old);
                info!("[REGISTRY] Extension {} replaced by {}", old, id);
                evicted_extension = Some(old);
            }
        }

        let now = unix_ms();
        let peer = PeerInfo {
            id: id.clone(),
            role,
            capabilities,
            connected_at: peers.get(&id).map(|p| p.connected_at).unwrap_or(now),
            last_activity_at: now,
            metadata,
        };
        peers.insert(id, peer.clone());

        Ok(Registration { peer, evicted_extension })
    }

    pub fn unregister(&self, peer_id: &str) -> bool {
        let removed = self.peers.write().remove(peer_id).is_some();
        if removed {
            info!("[REGISTRY] Peer {} unregistered", peer_id);
        }
        removed
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Snapshot of all peers, ordered by connection time for stable output.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| (p.connected_at, p.id.clone()));
        peers
    }

    pub fn find_by_role(&self, role: PeerRole) -> Option<PeerInfo> {
        self.peers.read().values().find(|p| p.role == role).cloned()
    }

    pub fn extension_id(&self) -> Option<String> {
        self.find_by_role(PeerRole::Extension).map(|p| p.id)
    }

    pub fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_activity_at = unix_ms();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register_simple(registry: &PeerRegistry, role: PeerRole) -> PeerInfo {
        registry
            .register(None, role, vec![], Value::Null)
            .unwrap()
            .peer
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = PeerRegistry::new();
        let a = register_simple(&registry, PeerRole::McpClient);
        let b = register_simple(&registry, PeerRole::McpClient);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_second_extension_replaces_first() {
        let registry = PeerRegistry::new();
        let first = register_simple(&registry, PeerRole::Extension);
        let reg = registry
            .register(None, PeerRole::Extension, vec!["tabs".into()], Value::Null)
            .unwrap();
        assert_eq!(reg.evicted_extension.as_deref(), Some(first.id.as_str()));
        assert!(!registry.contains(&first.id));
        assert_eq!(registry.extension_id(), Some(reg.peer.id.clone()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_requested_id_is_honored_for_reregistration() {
        let registry = PeerRegistry::new();
        let reg = registry
            .register(Some("pull-ext".into()), PeerRole::Extension, vec![], Value::Null)
            .unwrap();
        assert_eq!(reg.peer.id, "pull-ext");

        // re-registration under the same id keeps connected_at
        let again = registry
            .register(Some("pull-ext".into()), PeerRole::Extension, vec![], Value::Null)
            .unwrap();
        assert_eq!(again.peer.connected_at, reg.peer.connected_at);
        assert!(again.evicted_extension.is_none());
    }

    #[test]
    fn test_requested_id_with_conflicting_role_is_rejected() {
        let registry = PeerRegistry::new();
        registry
            .register(Some("p1".into()), PeerRole::McpClient, vec![], Value::Null)
            .unwrap();
        let err = registry
            .register(Some("p1".into()), PeerRole::Extension, vec![], Value::Null)
            .unwrap_err();
        assert_eq!(err.error_type(), "InvalidParams");
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let registry = PeerRegistry::new();
        registry
            .register(None, PeerRole::McpClient, vec!["tools".into()], json!({"name": "ide"}))
            .unwrap();
        let snapshot = registry.snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value[0]["connectedAt"].is_u64());
        assert!(value[0]["lastActivityAt"].is_u64());
        assert_eq!(value[0]["role"], "mcp-client");
    }

    #[test]
    fn test_touch_updates_activity() {
        let registry = PeerRegistry::new();
        let peer = register_simple(&registry, PeerRole::McpClient);
        let before = registry.get(&peer.id).unwrap().last_activity_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch(&peer.id);
        let after = registry.get(&peer.id).unwrap().last_activity_at;
        assert!(after >= before);
    }
}
