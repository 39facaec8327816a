use crate::config::SessionConfig;
use crate::connector::ConnectorRef;
use crate::error::TrackerError;
use crate::hierarchy::{self, same};
use crate::sync::{self, Changes};
use crate::tracker::ConnectorTracker;
use crossbeam::channel::{self, Receiver, SendError, Sender, TryRecvError};
use log::info;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies a session.
///
/// (this is just a UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> SessionId {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Things the client tells the session outside of regular state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client discarded its representation (e.g. a page reload) and needs everything again.
    Reload,
    /// The client went away.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

/// Sends client events to a session from any thread.
#[derive(Debug, Clone)]
pub struct ClientEvents(Sender<ClientEvent>);

impl ClientEvents {
    pub fn send(&self, event: ClientEvent) -> Result<(), SendError<ClientEvent>> {
        self.0.send(event)
    }
}

/// Owns one session’s connector tree and its tracker.
///
/// All access to the tracker goes through an exclusive lock. Client events may be queued from
/// any thread; they are applied in [`poll`](Self::poll).
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    root: ConnectorRef,
    tracker: Mutex<ConnectorTracker>,
    event_sender: Sender<ClientEvent>,
    event_recv: Receiver<ClientEvent>,
    closed: AtomicBool,
}

impl Session {
    /// Creates a new session and registers the whole tree below `root`.
    ///
    /// Everything starts out dirty and uninitialized, so the first response contains the full
    /// tree.
    pub fn new(root: ConnectorRef, config: SessionConfig) -> Result<Session, TrackerError> {
        let mut tracker = ConnectorTracker::new(Arc::clone(&root));
        for connector in hierarchy::descendants(&root) {
            tracker.register(&connector)?;
        }

        let (event_sender, event_recv) = channel::unbounded();
        let id = SessionId::new();
        info!("created session {} with {} connectors", id, tracker.len());

        Ok(Session {
            id,
            config,
            root,
            tracker: Mutex::new(tracker),
            event_sender,
            event_recv,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn root(&self) -> &ConnectorRef {
        &self.root
    }

    /// Locks the tracker.
    pub fn lock(&self) -> MutexGuard<'_, ConnectorTracker> {
        self.tracker.lock()
    }

    /// Returns a handle for queueing client events.
    pub fn client_events(&self) -> ClientEvents {
        ClientEvents(self.event_sender.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Adds `child` (with its subtree) below `parent`.
    ///
    /// A child that is already part of this session is moved. Otherwise its subtree is
    /// registered; if any connector conflicts, the ones registered so far are rolled back and
    /// the child is left unattached.
    pub fn attach(&self, parent: &ConnectorRef, child: &ConnectorRef) -> Result<(), TrackerError> {
        let mut tracker = self.tracker.lock();
        if !tracker.contains(parent) {
            return Err(TrackerError::InvalidHierarchy {
                reason: format!("{} is not attached", hierarchy::describe(&**parent)),
            });
        }
        if hierarchy::is_reachable_from(parent, child) {
            return Err(TrackerError::InvalidHierarchy {
                reason: format!(
                    "{} cannot become a descendant of itself",
                    hierarchy::describe(&**child)
                ),
            });
        }

        let previous = child.parent();
        if !tracker.contains(child) {
            let mut registered = Vec::new();
            for connector in hierarchy::descendants(child) {
                match tracker.register(&connector) {
                    Ok(_) => registered.push(connector),
                    Err(err) => {
                        for connector in registered.iter().rev() {
                            tracker.unregister(connector)?;
                        }
                        return Err(err);
                    }
                }
            }
        }

        hierarchy::add_child(parent, child);
        if let Some(previous) = previous {
            if !same(&previous, parent) && tracker.contains(&previous) {
                tracker.mark_dirty(&previous)?;
            }
        }
        tracker.mark_dirty(parent)?;
        tracker.mark_tree_dirty(child)
    }

    /// Removes `child` and its subtree from the session.
    pub fn detach(&self, child: &ConnectorRef) -> Result<(), TrackerError> {
        if same(child, &self.root) {
            return Err(TrackerError::InvalidHierarchy {
                reason: "the session root cannot be detached".to_owned(),
            });
        }

        let mut tracker = self.tracker.lock();
        for connector in hierarchy::descendants(child).iter().rev() {
            tracker.unregister(connector)?;
        }
        if let Some(parent) = hierarchy::detach_from_parent(child) {
            if tracker.contains(&parent) {
                tracker.mark_dirty(&parent)?;
            }
        }
        Ok(())
    }

    /// Applies all queued client events.
    pub fn poll(&self) -> Result<SessionStatus, TrackerError> {
        let mut tracker = self.tracker.lock();
        loop {
            match self.event_recv.try_recv() {
                Ok(event) => self.handle_event(&mut tracker, event)?,
                // the session holds a sender itself, so the channel never disconnects
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if self.is_closed() {
            Ok(SessionStatus::Closed)
        } else {
            Ok(SessionStatus::Open)
        }
    }

    fn handle_event(
        &self,
        tracker: &mut ConnectorTracker,
        event: ClientEvent,
    ) -> Result<(), TrackerError> {
        match event {
            ClientEvent::Reload => {
                info!("session {}: client reloaded, resending everything", self.id);
                tracker.mark_all_connectors_dirty()?;
                tracker.reset_all_client_state();
            }
            ClientEvent::Disconnect => {
                info!("session {}: client disconnected", self.id);
                self.closed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Writes the changes for the next response.
    pub fn write_response(&self) -> Result<Changes, TrackerError> {
        let mut tracker = self.tracker.lock();
        if self.config.check_hierarchy {
            tracker.check_hierarchy();
        }
        sync::write_changes(&mut tracker, self.config.force_cleanup)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("root", &self.root.connector_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
