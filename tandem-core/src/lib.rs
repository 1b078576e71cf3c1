//! # tandem-core
//!
//! Operational-transformation core of the Tandem collaborative text editor.
//! Everything here is synchronous and transport-agnostic; the networking
//! lives in `tandem-collab`.
//!
//! ## Modules
//!
//! - [`changeset`]: the changeset algebra (compress, compose, follow)
//! - [`revision`]: the server's revision log and client cursors
//! - [`edit`]: editor events to changesets
//! - [`reconcile`]: the client's acknowledged / in-flight / pending state

pub mod changeset;
pub mod edit;
pub mod reconcile;
pub mod revision;

pub use changeset::{
    compose, compose_or_identity, compress, expand, follow, follow_or_identity, ChangeSet,
    ChangeSetError, Op,
};
pub use edit::{EditError, EditEvent, EditPosition};
pub use reconcile::{ClientDocument, OutgoingUpdate, Phase, ReconcileError, Reconciled};
pub use revision::{ClientCursor, ClientId, DocumentState, Integrated, RevisionError, RevisionRecord};
