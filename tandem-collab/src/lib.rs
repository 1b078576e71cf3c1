//! # tandem-collab: real-time collaboration layer for Tandem
//!
//! WebSocket transport for the operational-transformation core in
//! `tandem-core`: a document server and an editing client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket     ┌──────────────┐
//! │ SyncClient   │ ◄───────────────► │ SyncServer   │
//! │ (per editor) │    JSON messages  │ (central)    │
//! └──────┬───────┘                   └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌──────────────┐                   ┌──────────────┐
//! │ClientDocument│                   │DocumentSession│
//! │ (A, X, Y)    │                   │ (revision log)│
//! └──────────────┘                   └──────┬───────┘
//!                                           │
//!                                   ┌───────┴───────┐
//!                                   │ BroadcastGroup│
//!                                   │ (ordered)     │
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`broadcast`]: ordered per-document fan-out and the room table
//! - [`session`]: the per-document actor owning the revision log
//! - [`server`]: WebSocket document server
//! - [`client`]: WebSocket editing client

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, RevisionEvent, RoomManager};
pub use client::{fetch_document, ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use protocol::{Message, ProtocolError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{DocumentHandle, Joined, SessionConfig, SessionError};
