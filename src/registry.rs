use crate::ad::SessionId;
use crate::error::{AdError, Result};
use crate::session::{AdSession, SessionState};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct RegistryEntry {
    id: SessionId,
    session: Weak<AdSession>,
}

impl RegistryEntry {
    fn live(&self) -> Option<Arc<AdSession>> {
        self.session.upgrade().filter(|session| !session.is_terminal())
    }
}

/// Live sessions keyed by placement. At most one per placement.
///
/// Holds weak references: a session dropped by the embedder frees its
/// placement without unregistering.
#[derive(Default)]
pub struct AdSessionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl AdSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session's placement. Fails if another live session holds it.
    pub fn register(&self, session: &Arc<AdSession>) -> Result<()> {
        let placement = session.placement().to_string();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&placement) {
            if existing.id != session.id() && existing.live().is_some() {
                return Err(AdError::DuplicatePlacement(placement));
            }
        }

        debug!("Registered {} on {}", session.id(), placement);
        entries.insert(
            placement,
            RegistryEntry {
                id: session.id(),
                session: Arc::downgrade(session),
            },
        );
        Ok(())
    }

    /// Release `placement` if it is still held by session `id`. Idempotent.
    pub fn unregister(&self, placement: &str, id: SessionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(placement) {
            Some(entry) if entry.id == id => {
                entries.remove(placement);
                debug!("Unregistered {} from {}", id, placement);
                true
            }
            _ => false,
        }
    }

    /// The live session on `placement`, if any
    pub fn get(&self, placement: &str) -> Option<Arc<AdSession>> {
        let entries = self.entries.lock();
        entries.get(placement).and_then(RegistryEntry::live)
    }

    pub fn contains(&self, placement: &str) -> bool {
        self.get(placement).is_some()
    }

    /// Whether `placement` holds a session that is ready to show
    pub fn is_loaded(&self, placement: &str) -> bool {
        self.get(placement)
            .is_some_and(|session| session.state() == SessionState::Ready)
    }

    pub fn live_placements(&self) -> Vec<String> {
        let mut placements: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.live().is_some())
            .map(|(placement, _)| placement.clone())
            .collect();
        placements.sort();
        placements
    }

    pub fn live_sessions(&self) -> Vec<Arc<AdSession>> {
        let entries = self.entries.lock();
        entries.values().filter_map(RegistryEntry::live).collect()
    }

    pub fn len(&self) -> usize {
        self.live_placements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
