//! Client-side reconciliation of local edits with the server's revisions.
//!
//! The client keeps its view of the document as three changesets:
//!
//! ```text
//!   A  acknowledged server state   (based on "", end = server doc)
//!   X  submitted, awaiting ack     (A.end -> X.end)
//!   Y  local, not yet submitted    (X.end -> Y.end)
//!
//!   view = A ∘ X ∘ Y
//! ```
//!
//! Incoming server changesets are folded in with [`follow`] so the view
//! converges with every other client without losing local work.
//!
//! Phases:
//!
//! ```text
//!   Disconnected ──connect──▶ AwaitingHead ──head──▶ Synced ◀──ack── AwaitingAck
//!                                                     │  ▲ ──send──▶
//!                                               gap   ▼  │ fast-forward
//!                                                  CatchingUp
//! ```

use crate::changeset::{compose, follow, ChangeSet, ChangeSetError};
use crate::edit::EditEvent;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("document is not synced (phase {0:?})")]
    NotSynced(Phase),
    #[error("received an acknowledgement with nothing in flight")]
    UnexpectedAck,
    #[error("received a fast-forward without requesting one")]
    UnexpectedFastForward,
    #[error("acknowledgement for revision {got}, expected {expected}")]
    AckOutOfOrder { expected: usize, got: usize },
    #[error("no acknowledgement after {0} send intervals")]
    AckTimeout(u32),
    #[error(transparent)]
    Algebra(#[from] ChangeSetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    AwaitingHead,
    Synced,
    /// An update is in flight; `ticks` counts send intervals since it left
    AwaitingAck { ticks: u32 },
    /// Waiting for a fast-forward after a revision gap
    CatchingUp,
}

/// An update ready to be sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingUpdate {
    pub change_set: ChangeSet,
    /// Revision the changeset is based on
    pub revision_number: usize,
}

/// What folding in a server message did to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The view changed; `delta` turns the previous view into `text`
    Applied { delta: ChangeSet, text: String },
    /// The in-flight update was committed
    Acknowledged { revision_number: usize },
    /// A revision arrived out of sequence; ask the server to fast-forward
    /// from `from_revision`
    FastForwardNeeded { from_revision: usize },
    /// A gap was seen while an update is in flight; catch up after the ack
    Deferred,
    /// Duplicate or superseded message
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ClientDocument {
    phase: Phase,
    revision: usize,
    acknowledged: ChangeSet,
    in_flight: ChangeSet,
    pending: ChangeSet,
    gap_after_ack: bool,
    loaded: bool,
    ack_timeout_ticks: u32,
}

impl ClientDocument {
    pub fn new(ack_timeout_ticks: u32) -> Self {
        Self {
            phase: Phase::Disconnected,
            revision: 0,
            acknowledged: ChangeSet::identity(0),
            in_flight: ChangeSet::identity(0),
            pending: ChangeSet::identity(0),
            gap_after_ack: false,
            loaded: false,
            ack_timeout_ticks,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last server revision folded into the acknowledged state.
    pub fn revision(&self) -> usize {
        self.revision
    }

    pub fn acknowledged(&self) -> &ChangeSet {
        &self.acknowledged
    }

    pub fn in_flight(&self) -> &ChangeSet {
        &self.in_flight
    }

    pub fn pending(&self) -> &ChangeSet {
        &self.pending
    }

    /// `A ∘ X ∘ Y`, based on the empty document.
    pub fn view(&self) -> Result<ChangeSet, ChangeSetError> {
        compose(&self.acknowledged, &compose(&self.in_flight, &self.pending)?)
    }

    /// The text the user currently sees.
    pub fn text(&self) -> Result<String, ChangeSetError> {
        Ok(self.view()?.inserted_text().to_string())
    }

    fn has_head(&self) -> bool {
        matches!(
            self.phase,
            Phase::Synced | Phase::AwaitingAck { .. } | Phase::CatchingUp
        )
    }

    /// Whether a head has ever been received. Local edits are accepted from
    /// then on, also while offline; they are sent once reconnected.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The transport connected and asked for the document head.
    pub fn connect(&mut self) {
        self.phase = Phase::AwaitingHead;
        self.gap_after_ack = false;
    }

    pub fn disconnect(&mut self) {
        self.phase = Phase::Disconnected;
    }

    /// Adopt the server's document at `revision`.
    ///
    /// Unsent local edits survive when they are still based on the same
    /// server state; otherwise they are dropped with a warning.
    pub fn receive_head(&mut self, head: ChangeSet, revision: usize) -> Result<String, ReconcileError> {
        if head.start_len() != 0 {
            return Err(ChangeSetError::BaseLengthMismatch {
                expected: 0,
                actual: head.start_len(),
            }
            .into());
        }

        let resumable = self.in_flight.is_identity()
            && revision == self.revision
            && head == self.acknowledged;
        if !resumable && !(self.in_flight.is_identity() && self.pending.is_identity()) {
            log::warn!("Discarding unsent local edits: server state moved to revision {revision}");
        }

        let end_len = head.end_len();
        if !resumable {
            self.pending = ChangeSet::identity(end_len);
        }
        self.acknowledged = head;
        self.in_flight = ChangeSet::identity(end_len);
        self.revision = revision;
        self.gap_after_ack = false;
        self.loaded = true;
        self.phase = Phase::Synced;

        Ok(self.text()?)
    }

    /// Record a local edit against the current view.
    ///
    /// A malformed event is logged and skipped, leaving the document as it
    /// was; `Ok(None)` reports that. On success the applied changeset is
    /// returned.
    pub fn local_edit(&mut self, event: &EditEvent) -> Result<Option<ChangeSet>, ReconcileError> {
        if !self.loaded {
            return Err(ReconcileError::NotSynced(self.phase));
        }
        let text = self.text()?;
        let change_set = match event.to_changeset(&text) {
            Ok(cs) => cs,
            Err(e) => {
                log::warn!("Ignoring edit: {e}");
                return Ok(None);
            }
        };
        self.pending = compose(&self.pending, &change_set)?;
        Ok(Some(change_set))
    }

    /// Called once per send interval. Hands out the pending edits when
    /// nothing is in flight.
    pub fn take_outgoing(&mut self) -> Result<Option<OutgoingUpdate>, ReconcileError> {
        match self.phase {
            Phase::Synced => {
                if self.pending.is_identity() {
                    return Ok(None);
                }
                let end_len = self.pending.end_len();
                self.in_flight = std::mem::replace(&mut self.pending, ChangeSet::identity(end_len));
                self.phase = Phase::AwaitingAck { ticks: 0 };
                Ok(Some(OutgoingUpdate {
                    change_set: self.in_flight.clone(),
                    revision_number: self.revision,
                }))
            }
            Phase::AwaitingAck { ticks } => {
                let ticks = ticks + 1;
                self.phase = Phase::AwaitingAck { ticks };
                if ticks >= self.ack_timeout_ticks {
                    return Err(ReconcileError::AckTimeout(ticks));
                }
                Ok(None)
            }
            Phase::Disconnected | Phase::AwaitingHead | Phase::CatchingUp => Ok(None),
        }
    }

    /// The server committed the in-flight update as `revision`.
    pub fn acknowledge(&mut self, revision: usize) -> Result<Reconciled, ReconcileError> {
        if !matches!(self.phase, Phase::AwaitingAck { .. }) {
            return Err(ReconcileError::UnexpectedAck);
        }
        let expected = self.revision + 1;
        if revision != expected {
            return Err(ReconcileError::AckOutOfOrder {
                expected,
                got: revision,
            });
        }

        self.acknowledged = compose(&self.acknowledged, &self.in_flight)?;
        self.in_flight = ChangeSet::identity(self.acknowledged.end_len());
        self.revision = revision;

        if std::mem::take(&mut self.gap_after_ack) {
            self.phase = Phase::CatchingUp;
            return Ok(Reconciled::FastForwardNeeded {
                from_revision: revision,
            });
        }
        self.phase = Phase::Synced;
        Ok(Reconciled::Acknowledged {
            revision_number: revision,
        })
    }

    /// Fold in a revision authored by another client.
    pub fn apply_server_update(
        &mut self,
        change_set: &ChangeSet,
        revision: usize,
    ) -> Result<Reconciled, ReconcileError> {
        if !self.has_head() {
            return Err(ReconcileError::NotSynced(self.phase));
        }
        if revision <= self.revision {
            log::debug!("Ignoring duplicate revision {revision}");
            return Ok(Reconciled::Ignored);
        }

        match self.phase {
            Phase::CatchingUp => {
                log::debug!("Ignoring revision {revision} while catching up");
                Ok(Reconciled::Ignored)
            }
            _ if revision != self.revision + 1 => {
                if let Phase::AwaitingAck { .. } = self.phase {
                    log::debug!("Revision gap {} -> {revision}, deferred", self.revision);
                    self.gap_after_ack = true;
                    return Ok(Reconciled::Deferred);
                }
                log::debug!("Revision gap {} -> {revision}, fast-forwarding", self.revision);
                self.phase = Phase::CatchingUp;
                Ok(Reconciled::FastForwardNeeded {
                    from_revision: self.revision,
                })
            }
            _ => {
                let reconciled = self.fold(change_set)?;
                self.revision = revision;
                Ok(reconciled)
            }
        }
    }

    /// Fold in the answer to a fast-forward request.
    pub fn apply_fast_forward(
        &mut self,
        change_set: &ChangeSet,
        revision: usize,
    ) -> Result<Reconciled, ReconcileError> {
        if self.phase != Phase::CatchingUp {
            return Err(ReconcileError::UnexpectedFastForward);
        }
        let reconciled = if revision <= self.revision {
            Reconciled::Ignored
        } else {
            self.fold(change_set)?
        };
        self.revision = self.revision.max(revision);
        self.phase = Phase::Synced;
        Ok(reconciled)
    }

    /// Incorporate server changeset `s`, based on `A.end`:
    ///
    /// ```text
    ///   A' = A ∘ s
    ///   X' = follow(s, X)
    ///   Y' = follow(follow(X, s), Y)
    ///   D  = follow(Y, follow(X, s))     (view -> view')
    /// ```
    fn fold(&mut self, s: &ChangeSet) -> Result<Reconciled, ReconcileError> {
        let view = self.view()?;
        let acknowledged = compose(&self.acknowledged, s)?;
        let in_flight = follow(s, &self.in_flight)?;
        let s_after_x = follow(&self.in_flight, s)?;
        let pending = follow(&s_after_x, &self.pending)?;
        let delta = follow(&self.pending, &s_after_x)?;
        let text = compose(&view, &delta)?.inserted_text().to_string();

        self.acknowledged = acknowledged;
        self.in_flight = in_flight;
        self.pending = pending;

        Ok(Reconciled::Applied { delta, text })
    }
}
