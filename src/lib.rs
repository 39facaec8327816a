//! Server-side connector tracking.
//!
//! # Conceptual overview
//! A web UI built on this crate lives on the server: a tree of stateful widgets whose state is
//! mirrored to a browser client over request/response round trips. This crate keeps track of
//! which parts of that tree the client knows about and which parts need to be sent again.
//!
//! ## Connectors
//! Anything with a client-side counterpart is a connector. Connectors form a tree below a
//! session root; each has an id that is assigned once, a visibility flag, and a shared state
//! that is encoded to JSON when sent. Implement [`Connector`] by embedding a [`ConnectorBase`]
//! and using the [`impl_connector`] macro, or use the general-purpose [`Node`].
//!
//! ## Tracking
//! The [`ConnectorTracker`] of a session maps ids to connectors and keeps three pieces of
//! bookkeeping per connector:
//!
//! - whether the client has received its initial state (uninitialized connectors get their
//!   full state),
//! - whether it is dirty, i.e. changed since the last response,
//! - the state that was last sent (its diff state), so later responses only carry what changed.
//!
//! Invisible connectors are not synchronized. Marking a tree dirty skips invisible subtrees;
//! when they become visible again, the parent’s tree is marked dirty once more.
//!
//! ## Round trips
//! A [`Session`] owns the root and the tracker behind an exclusive lock. Widgets mark
//! themselves dirty as they change; once a request has been handled,
//! [`Session::write_response`] collects the [`Changes`] for the client. If the client throws its
//! state away (e.g. a page reload), it sends [`ClientEvent::Reload`] and the next response
//! contains everything again.

mod config;
#[macro_use]
mod connector;
mod error;
pub mod hierarchy;
mod node;
mod session;
pub mod stream;
pub mod sync;
mod tracker;

pub use config::SessionConfig;
pub use connector::{Connector, ConnectorBase, ConnectorId, ConnectorRef};
pub use error::{ConfigError, TrackerError};
pub use node::Node;
pub use session::{ClientEvent, ClientEvents, Session, SessionId, SessionStatus};
pub use sync::{Changes, StateUpdate};
pub use tracker::{ConnectorTracker, HierarchyProblem, ListenerId};

#[doc(hidden)]
pub use serde_json as __serde_json;
