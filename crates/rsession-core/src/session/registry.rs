//! Process-wide set of open sessions.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{SessionId, SessionWrapper};

/// What [`SessionRegistry::clean_all`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Sessions closed without error.
    pub closed: usize,
    /// Sessions whose close reported an error (still unregistered).
    pub failed: usize,
}

/// Live sessions in registration order.
///
/// Holds weak references: the registry tracks sessions, it does not keep
/// them alive.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<Vec<(SessionId, Weak<SessionWrapper>)>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: &Arc<SessionWrapper>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|(id, _)| *id == session.id()) {
            return;
        }
        entries.push((session.id(), Arc::downgrade(session)));
        tracing::debug!("registered session {} ({} live)", session.id(), entries.len());
    }

    pub fn unregister(&self, id: SessionId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(entry, _)| *entry != id);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(entry, _)| *entry == id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids, oldest first.
    pub fn snapshot_ids(&self) -> Vec<SessionId> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Close every registered session, newest first.
    ///
    /// Works on a snapshot so sessions can unregister themselves while this
    /// runs. A failing close is logged and the next session is still
    /// attempted; every snapshotted entry is removed at the end.
    pub fn clean_all(&self) -> CleanupSummary {
        let snapshot: Vec<(SessionId, Weak<SessionWrapper>)> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut summary = CleanupSummary::default();
        for (id, weak) in snapshot.iter().rev() {
            let Some(session) = weak.upgrade() else {
                continue;
            };
            match session.close(true) {
                Ok(()) => summary.closed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!("cleanup of session {} failed: {}", id, e);
                }
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(id, weak)| {
            weak.strong_count() > 0 && !snapshot.iter().any(|(closed, _)| closed == id)
        });

        if summary.closed + summary.failed > 0 {
            tracing::info!(
                "cleaned up {} session(s), {} with errors",
                summary.closed + summary.failed,
                summary.failed
            );
        }
        summary
    }
}
