//! Shared session table.
//!
//! The registry is the only state shared between concurrently running
//! session loops. Every operation takes the map lock briefly; no lock is
//! held across generation or execution.
//!
//! Writes go through a [`SessionWriter`], handed out once per session by
//! [`SessionRegistry::claim`]. Once a session is terminal the writer
//! refuses further changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    Iteration, Session, SessionFilter, SessionId, SessionStatus, SessionSummary, TerminalReason,
};
use super::request::{SessionLimits, TaskRequest, ValidatedTask};
use crate::error::{CodeloopError, Result};

struct Slot {
    session: Session,
    cancel: Arc<AtomicBool>,
    claimed: bool,
}

/// Lock-protected map of sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    slots: Arc<RwLock<HashMap<SessionId, Slot>>>,
    limits: SessionLimits,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry applying `limits` to new requests.
    #[must_use]
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            limits,
        }
    }

    /// Defaults and bounds applied by [`create`](Self::create).
    #[must_use]
    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Validate `request` and store a new session.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::Validation`] for malformed input; nothing is
    /// stored in that case.
    pub async fn create(&self, request: &TaskRequest) -> Result<SessionId> {
        let task = request.validate(&self.limits)?;
        Ok(self.insert(task).await)
    }

    /// Store a session for an already validated task.
    pub async fn insert(&self, task: ValidatedTask) -> SessionId {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(session_id.clone(), task);
        info!(
            session_id = %session_id,
            language = %session.language,
            max_iterations = session.max_iterations,
            quality_threshold = session.quality_threshold,
            "Session created"
        );
        self.slots.write().await.insert(
            session_id.clone(),
            Slot {
                session,
                cancel: Arc::new(AtomicBool::new(false)),
                claimed: false,
            },
        );
        session_id
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.slots
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.session.clone())
            .ok_or_else(|| CodeloopError::not_found(session_id))
    }

    /// Summaries of sessions passing `filter`, oldest first.
    pub async fn list(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let slots = self.slots.read().await;
        let mut summaries: Vec<SessionSummary> = slots
            .values()
            .filter(|slot| filter.matches(&slot.session))
            .map(|slot| slot.session.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Raise the cooperative cancellation flag.
    ///
    /// The owning loop observes it at its next validation boundary. Status
    /// is not changed here. Cancelling a terminal session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(session_id)
            .ok_or_else(|| CodeloopError::not_found(session_id))?;
        if !slot.session.is_terminal() {
            slot.cancel.store(true, Ordering::SeqCst);
            info!(session_id, "Cancellation requested");
        }
        Ok(())
    }

    /// Remove a terminal session and return it.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids and
    /// [`CodeloopError::InvalidState`] while the session is still running.
    pub async fn delete(&self, session_id: &str) -> Result<Session> {
        let mut slots = self.slots.write().await;
        match slots.get(session_id) {
            None => return Err(CodeloopError::not_found(session_id)),
            Some(slot) if !slot.session.is_terminal() => {
                return Err(CodeloopError::invalid_state(
                    session_id,
                    format!("cannot delete while {}", slot.session.status),
                ));
            }
            Some(_) => {}
        }
        debug!(session_id, "Session deleted");
        slots
            .remove(session_id)
            .map(|slot| slot.session)
            .ok_or_else(|| CodeloopError::not_found(session_id))
    }

    /// Take exclusive write ownership of a session.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for unknown ids and
    /// [`CodeloopError::InvalidState`] if the session already has an owner
    /// or is terminal.
    pub async fn claim(&self, session_id: &str) -> Result<SessionWriter> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(session_id)
            .ok_or_else(|| CodeloopError::not_found(session_id))?;
        if slot.claimed {
            return Err(CodeloopError::invalid_state(
                session_id,
                "already owned by a running loop",
            ));
        }
        if slot.session.is_terminal() {
            return Err(CodeloopError::invalid_state(session_id, "already terminal"));
        }
        slot.claimed = true;
        Ok(SessionWriter {
            registry: self.clone(),
            session_id: session_id.to_string(),
            cancel: slot.cancel.clone(),
        })
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether no sessions are stored.
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Apply `f` to a live session.
    async fn update<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(session_id)
            .ok_or_else(|| CodeloopError::not_found(session_id))?;
        if slot.session.is_terminal() {
            return Err(CodeloopError::invalid_state(
                session_id,
                format!("is {} and can no longer change", slot.session.status),
            ));
        }
        f(&mut slot.session)
    }
}

/// Exclusive write handle for one session.
pub struct SessionWriter {
    registry: SessionRegistry,
    session_id: SessionId,
    cancel: Arc<AtomicBool>,
}

impl SessionWriter {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Current state of the owned session.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] if the session vanished.
    pub async fn snapshot(&self) -> Result<Session> {
        self.registry.get(&self.session_id).await
    }

    /// Move to a non-terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::InvalidState`] for terminal targets or a
    /// session that already terminated.
    pub async fn set_status(&self, status: SessionStatus) -> Result<()> {
        if status.is_terminal() {
            return Err(CodeloopError::invalid_state(
                &self.session_id,
                "terminal status must be set through finish()",
            ));
        }
        self.registry
            .update(&self.session_id, |session| {
                debug!(
                    session_id = %session.session_id,
                    from = %session.status,
                    to = %status,
                    "Status change"
                );
                session.status = status;
                Ok(())
            })
            .await
    }

    /// Append a finished iteration.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::InvalidState`] when the iteration budget is
    /// already spent or the session is terminal.
    pub async fn append_iteration(&self, iteration: Iteration) -> Result<()> {
        self.registry
            .update(&self.session_id, |session| {
                if session.total_iterations() >= session.max_iterations {
                    return Err(CodeloopError::invalid_state(
                        &session.session_id,
                        format!("iteration budget of {} exhausted", session.max_iterations),
                    ));
                }
                session.iterations.push(iteration);
                Ok(())
            })
            .await
    }

    /// Freeze the session with `reason`.
    ///
    /// The final code and report come from the last iteration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::InvalidState`] if already terminal.
    pub async fn finish(
        &self,
        reason: TerminalReason,
        error_message: Option<String>,
    ) -> Result<Session> {
        self.registry
            .update(&self.session_id, |session| {
                if let Some(last) = session.iterations.last() {
                    session.final_code = Some(last.generated_code.clone());
                    session.final_report = Some(last.report.clone());
                }
                session.status = reason.status();
                session.terminal_reason = Some(reason);
                session.error_message = error_message;
                session.finished_at = Some(Utc::now());
                info!(
                    session_id = %session.session_id,
                    status = %session.status,
                    reason = %reason,
                    iterations = session.total_iterations(),
                    "Session finished"
                );
                Ok(session.clone())
            })
            .await
    }
}
