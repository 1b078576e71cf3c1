//! Per-document session actor.
//!
//! ```text
//!   connection ─┐  Command (mpsc)   ┌──────────────────┐  RevisionEvent
//!   connection ─┼─────────────────► │ DocumentSession  │ ───────────────► BroadcastGroup
//!   connection ─┘ ◄──────────────── │  DocumentState   │   (in order)
//!                   reply (oneshot) └──────────────────┘
//! ```
//!
//! One task owns the [`DocumentState`]; every mutation is a message to it,
//! so updates are integrated strictly one at a time and each revision is
//! published before the next update is looked at.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use tandem_core::{ChangeSet, ClientId, DocumentState, Integrated, RevisionError};

use crate::broadcast::{BroadcastGroup, RevisionEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("document {doc_id} is full ({max_clients} clients)")]
    DocumentFull { doc_id: Uuid, max_clients: usize },
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error("session for document {0} has shut down")]
    Closed(Uuid),
}

/// Per-document session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Events a connection may fall behind before it is dropped
    pub broadcast_capacity: usize,
    /// Commands queued for the actor before senders wait
    pub mailbox_capacity: usize,
    pub max_clients: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            mailbox_capacity: 64,
            max_clients: 100,
        }
    }
}

/// What a client gets when it joins: the head and a subscription that
/// starts right after it.
#[derive(Debug)]
pub struct Joined {
    pub head: ChangeSet,
    pub revision_number: usize,
    pub events: broadcast::Receiver<Arc<RevisionEvent>>,
    /// Identifies this join; only the matching leave unregisters the client
    pub ticket: u64,
}

enum Command {
    Join {
        client_id: ClientId,
        reply: oneshot::Sender<Result<Joined, SessionError>>,
    },
    Leave {
        client_id: ClientId,
        ticket: u64,
        reply: oneshot::Sender<()>,
    },
    GetDocument {
        reply: oneshot::Sender<(ChangeSet, usize)>,
    },
    Update {
        client_id: ClientId,
        change_set: ChangeSet,
        revision_number: usize,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    FastForward {
        client_id: ClientId,
        revision_number: usize,
        reply: oneshot::Sender<Result<Integrated, SessionError>>,
    },
    Ack {
        client_id: ClientId,
        revision_number: usize,
    },
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct DocumentHandle {
    doc_id: Uuid,
    commands: mpsc::Sender<Command>,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentHandle {
    /// Start the session task for `doc_id` with an empty document.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn(doc_id: Uuid, config: &SessionConfig) -> Self {
        let (commands, mailbox) = mpsc::channel(config.mailbox_capacity);
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let session = DocumentSession {
            doc_id,
            state: DocumentState::new(),
            mailbox,
            broadcast: broadcast.clone(),
            max_clients: config.max_clients,
            tickets: HashMap::new(),
            next_ticket: 0,
        };
        tokio::spawn(session.run());

        Self {
            doc_id,
            commands,
            broadcast,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed(self.doc_id))?;
        response.await.map_err(|_| SessionError::Closed(self.doc_id))
    }

    /// Register `client_id` at the head revision.
    pub async fn join(&self, client_id: ClientId) -> Result<Joined, SessionError> {
        self.request(|reply| Command::Join { client_id, reply })
            .await?
    }

    /// Unregister `client_id` if `ticket` is still its latest join. A leave
    /// from a connection the client has already replaced does nothing.
    pub async fn leave(&self, client_id: ClientId, ticket: u64) {
        if self
            .request(|reply| Command::Leave {
                client_id,
                ticket,
                reply,
            })
            .await
            .is_err()
        {
            log::debug!("Leave for {client_id} after session {} closed", self.doc_id);
        }
    }

    /// Head text and revision, without registering a client.
    pub async fn document(&self) -> Result<(ChangeSet, usize), SessionError> {
        self.request(|reply| Command::GetDocument { reply }).await
    }

    /// Integrate an update and return its revision number. The revision
    /// has been published by the time this returns.
    pub async fn update(
        &self,
        client_id: ClientId,
        change_set: ChangeSet,
        revision_number: usize,
    ) -> Result<usize, SessionError> {
        self.request(|reply| Command::Update {
            client_id,
            change_set,
            revision_number,
            reply,
        })
        .await?
    }

    pub async fn fast_forward(
        &self,
        client_id: ClientId,
        revision_number: usize,
    ) -> Result<Integrated, SessionError> {
        self.request(|reply| Command::FastForward {
            client_id,
            revision_number,
            reply,
        })
        .await?
    }

    pub async fn acknowledge(&self, client_id: ClientId, revision_number: usize) -> Result<(), SessionError> {
        self.commands
            .send(Command::Ack {
                client_id,
                revision_number,
            })
            .await
            .map_err(|_| SessionError::Closed(self.doc_id))
    }

    pub async fn client_count(&self) -> usize {
        self.broadcast.peer_count().await
    }
}

struct DocumentSession {
    doc_id: Uuid,
    state: DocumentState,
    mailbox: mpsc::Receiver<Command>,
    broadcast: Arc<BroadcastGroup>,
    max_clients: usize,
    tickets: HashMap<ClientId, u64>,
    next_ticket: u64,
}

impl DocumentSession {
    async fn run(mut self) {
        while let Some(command) = self.mailbox.recv().await {
            self.handle(command).await;
        }
        log::debug!(
            "Session {} stopped at revision {}",
            self.doc_id,
            self.state.head_revision()
        );
    }

    async fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the connection went away; the
        // state change still stands.
        match command {
            Command::Join { client_id, reply } => {
                let _ = reply.send(self.join(client_id).await);
            }
            Command::Leave {
                client_id,
                ticket,
                reply,
            } => {
                if self.tickets.get(&client_id) == Some(&ticket) {
                    self.tickets.remove(&client_id);
                    self.state.remove_client(&client_id);
                    self.broadcast.remove_peer(&client_id).await;
                } else {
                    log::debug!("Stale leave for {client_id} on {}", self.doc_id);
                }
                let _ = reply.send(());
            }
            Command::GetDocument { reply } => {
                let _ = reply.send((self.state.head_text().clone(), self.state.head_revision()));
            }
            Command::Update {
                client_id,
                change_set,
                revision_number,
                reply,
            } => {
                let result = self
                    .state
                    .update_state(client_id, change_set, revision_number)
                    .map(|integrated| {
                        let revision_number = integrated.revision_number;
                        self.broadcast.publish(RevisionEvent {
                            origin: client_id,
                            revision_number,
                            change_set: integrated.change_set,
                        });
                        revision_number
                    })
                    .map_err(SessionError::from);
                if let Err(e) = &result {
                    log::warn!("Rejected update from {client_id} on {}: {e}", self.doc_id);
                }
                let _ = reply.send(result);
            }
            Command::FastForward {
                client_id,
                revision_number,
                reply,
            } => {
                let result = self
                    .state
                    .fast_forward(client_id, revision_number)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Ack {
                client_id,
                revision_number,
            } => {
                if let Err(e) = self.state.acknowledge(client_id, revision_number) {
                    log::debug!("Ignoring ack from {client_id}: {e}");
                }
            }
        }
    }

    async fn join(&mut self, client_id: ClientId) -> Result<Joined, SessionError> {
        if self.state.cursor(&client_id).is_none() && self.state.client_count() >= self.max_clients {
            return Err(SessionError::DocumentFull {
                doc_id: self.doc_id,
                max_clients: self.max_clients,
            });
        }
        let revision_number = self.state.add_client(client_id);
        let events = self.broadcast.add_peer(client_id).await;
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.tickets.insert(client_id, ticket);
        log::info!(
            "Client {client_id} joined document {} at revision {revision_number}",
            self.doc_id
        );
        Ok(Joined {
            head: self.state.head_text().clone(),
            revision_number,
            events,
            ticket,
        })
    }
}
