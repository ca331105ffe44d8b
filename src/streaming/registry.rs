use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, RunpadError};

struct InputSlot {
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
    generation: u64,
}

/// Outcome of handing a line of input to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDelivery {
    Delivered,
    /// No execution of that session is registered.
    NoActiveSession,
    /// A previous line has not been read yet.
    SlotOccupied,
}

/// Process-wide map of session id to its single-line input slot.
#[derive(Default)]
pub struct SessionRegistry {
    slots: DashMap<String, InputSlot>,
    generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the input slot of `session_id` for one execution.
    ///
    /// The slot lives until the returned guard drops.
    pub fn register(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<(SessionGuard, mpsc::Receiver<String>)> {
        let (sender, receiver) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        match self.slots.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RunpadError::SessionBusy {
                    id: session_id.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InputSlot {
                    sender,
                    cancel: cancel.clone(),
                    generation,
                });
            }
        }

        debug!(session = %session_id, "Registered input slot");
        let guard = SessionGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            generation,
            cancel,
        };
        Ok((guard, receiver))
    }

    pub fn provide_input(&self, session_id: &str, text: impl Into<String>) -> InputDelivery {
        let Some(slot) = self.slots.get(session_id) else {
            return InputDelivery::NoActiveSession;
        };
        match slot.sender.try_send(text.into()) {
            Ok(()) => InputDelivery::Delivered,
            Err(TrySendError::Full(_)) => InputDelivery::SlotOccupied,
            Err(TrySendError::Closed(_)) => InputDelivery::NoActiveSession,
        }
    }

    /// Abort the session's execution and any pending read. Returns whether one was running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.slots.get(session_id) {
            Some(slot) => {
                info!(session = %session_id, "Cancelling session");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.slots.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.slots.len()
    }
}

/// Keeps a session's input slot registered; removes it on drop.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .slots
            .remove_if(&self.session_id, |_, slot| slot.generation == generation);
        debug!(session = %self.session_id, "Unregistered input slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_input_before_read_is_kept() {
        let registry = SessionRegistry::new();
        let (_guard, mut rx) = registry.register("s1").unwrap();
        assert_eq!(registry.provide_input("s1", "x"), InputDelivery::Delivered);
        assert_eq!(rx.recv().await.as_deref(), Some("x"));
    }

    #[test]
    fn test_one_pending_line_per_session() {
        let registry = SessionRegistry::new();
        let (_guard, _rx) = registry.register("s1").unwrap();
        assert_eq!(registry.provide_input("s1", "a"), InputDelivery::Delivered);
        assert_eq!(registry.provide_input("s1", "b"), InputDelivery::SlotOccupied);
    }

    #[test]
    fn test_unregister_makes_input_a_no_op() {
        let registry = SessionRegistry::new();
        let (guard, _rx) = registry.register("s1").unwrap();
        drop(guard);
        assert!(!registry.is_active("s1"));
        assert_eq!(registry.provide_input("s1", "x"), InputDelivery::NoActiveSession);
    }

    #[test]
    fn test_double_register_is_busy() {
        let registry = SessionRegistry::new();
        let (_guard, _rx) = registry.register("s1").unwrap();
        assert!(matches!(
            registry.register("s1"),
            Err(RunpadError::SessionBusy { .. })
        ));
        let (_other, _rx2) = registry.register("s2").unwrap();
        assert_eq!(registry.active_sessions(), 2);
    }

    #[test]
    fn test_stale_guard_keeps_newer_slot() {
        let registry = SessionRegistry::new();
        let (first, _rx) = registry.register("s1").unwrap();
        drop(first);
        let (_second, _rx2) = registry.register("s1").unwrap();
        assert!(registry.is_active("s1"));
    }

    #[test]
    fn test_cancel_trips_token() {
        let registry = SessionRegistry::new();
        let (guard, _rx) = registry.register("s1").unwrap();
        assert!(registry.cancel("s1"));
        assert!(guard.cancel_token().is_cancelled());
        assert!(!registry.cancel("missing"));
    }
}
