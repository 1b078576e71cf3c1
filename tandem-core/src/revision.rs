//! Server-side document state: the revision log and per-client cursors.
//!
//! ```text
//!   revisions:  [0: identity] [1: cs] [2: cs] ... [head]
//!                                ▲               ▲
//!   cursors:         client A ───┘   client B ───┘
//!
//!   head_text = compose(rev 1, rev 2, ..., rev head)   (based on "")
//! ```
//!
//! An update based on an older revision is rebased with [`follow`] over
//! every revision the client has not seen before it joins the log.

use crate::changeset::{compose, follow, ChangeSet, ChangeSetError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier a client picks for itself when it connects.
pub type ClientId = Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("revision {revision} is ahead of head revision {head}")]
    RevisionAhead { revision: usize, head: usize },
    #[error("cannot rebase over revision {revision}: {source}")]
    Rebase {
        revision: usize,
        #[source]
        source: ChangeSetError,
    },
    #[error("cannot integrate update into head text: {0}")]
    Integrate(#[source] ChangeSetError),
}

/// One entry of the revision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub change_set: ChangeSet,
    /// `None` for the initial revision
    pub source_client_id: Option<ClientId>,
    pub revision_number: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCursor {
    pub id: ClientId,
    pub last_known_revision: usize,
}

/// A changeset together with the revision it brings its receiver to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrated {
    pub change_set: ChangeSet,
    pub revision_number: usize,
}

/// Authoritative state of one document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    revisions: Vec<RevisionRecord>,
    head_text: ChangeSet,
    cursors: HashMap<ClientId, ClientCursor>,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentState {
    pub fn new() -> Self {
        Self {
            revisions: vec![RevisionRecord {
                change_set: ChangeSet::identity(0),
                source_client_id: None,
                revision_number: 0,
            }],
            head_text: ChangeSet::identity(0),
            cursors: HashMap::new(),
        }
    }

    pub fn head_revision(&self) -> usize {
        self.revisions.len() - 1
    }

    /// Every revision composed onto the empty document.
    pub fn head_text(&self) -> &ChangeSet {
        &self.head_text
    }

    /// Current document contents.
    pub fn text(&self) -> &str {
        self.head_text.inserted_text()
    }

    pub fn revisions(&self) -> &[RevisionRecord] {
        &self.revisions
    }

    pub fn revision(&self, number: usize) -> Option<&RevisionRecord> {
        self.revisions.get(number)
    }

    pub fn cursor(&self, id: &ClientId) -> Option<&ClientCursor> {
        self.cursors.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.cursors.len()
    }

    /// Register a client at the head revision and return that revision.
    /// Registering an already known client moves its cursor to head.
    pub fn add_client(&mut self, id: ClientId) -> usize {
        let head = self.head_revision();
        self.cursors.insert(
            id,
            ClientCursor {
                id,
                last_known_revision: head,
            },
        );
        log::debug!("Client {id} joined at revision {head}");
        head
    }

    pub fn remove_client(&mut self, id: &ClientId) -> Option<ClientCursor> {
        let removed = self.cursors.remove(id);
        if removed.is_some() {
            log::debug!("Client {id} left");
        }
        removed
    }

    /// Integrate `change_set`, authored by `id` against `base_revision`.
    ///
    /// The update is rebased over revisions `base_revision + 1 ..= head`,
    /// appended to the log and composed into the head text. Every cursor
    /// moves to the new revision. Nothing changes if any step fails.
    pub fn update_state(
        &mut self,
        id: ClientId,
        change_set: ChangeSet,
        base_revision: usize,
    ) -> Result<Integrated, RevisionError> {
        let head = self.head_revision();
        if !self.cursors.contains_key(&id) {
            return Err(RevisionError::UnknownClient(id));
        }
        if base_revision > head {
            return Err(RevisionError::RevisionAhead {
                revision: base_revision,
                head,
            });
        }

        let mut rebased = change_set;
        for record in &self.revisions[base_revision + 1..] {
            rebased = follow(&record.change_set, &rebased).map_err(|source| {
                RevisionError::Rebase {
                    revision: record.revision_number,
                    source,
                }
            })?;
        }
        let head_text = compose(&self.head_text, &rebased).map_err(RevisionError::Integrate)?;

        let revision_number = head + 1;
        self.revisions.push(RevisionRecord {
            change_set: rebased.clone(),
            source_client_id: Some(id),
            revision_number,
        });
        self.head_text = head_text;
        for cursor in self.cursors.values_mut() {
            cursor.last_known_revision = revision_number;
        }

        log::debug!(
            "Revision {revision_number} from {id} (based on {base_revision}, {} chars)",
            self.head_text.end_len()
        );

        Ok(Integrated {
            change_set: rebased,
            revision_number,
        })
    }

    /// Everything after `known_revision` as one changeset, bringing the
    /// client from that revision to head.
    pub fn fast_forward(
        &mut self,
        id: ClientId,
        known_revision: usize,
    ) -> Result<Integrated, RevisionError> {
        let head = self.head_revision();
        if known_revision > head {
            return Err(RevisionError::RevisionAhead {
                revision: known_revision,
                head,
            });
        }
        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or(RevisionError::UnknownClient(id))?;

        let mut revisions = self.revisions[known_revision + 1..].iter();
        let change_set = match revisions.next() {
            None => ChangeSet::identity(self.head_text.end_len()),
            Some(first) => {
                let mut combined = first.change_set.clone();
                for record in revisions {
                    combined = compose(&combined, &record.change_set)
                        .map_err(RevisionError::Integrate)?;
                }
                combined
            }
        };

        cursor.last_known_revision = head;
        log::debug!("Fast-forward {id} from {known_revision} to {head}");

        Ok(Integrated {
            change_set,
            revision_number: head,
        })
    }

    /// Record that `id` has folded in revision `revision`.
    pub fn acknowledge(&mut self, id: ClientId, revision: usize) -> Result<(), RevisionError> {
        let head = self.head_revision();
        if revision > head {
            return Err(RevisionError::RevisionAhead { revision, head });
        }
        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or(RevisionError::UnknownClient(id))?;
        cursor.last_known_revision = revision;
        Ok(())
    }
}
