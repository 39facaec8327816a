use crate::connector::{ConnectorId, ConnectorRef};
use crate::error::TrackerError;
use crate::hierarchy::{self, describe, is_reachable_from, is_visible_to_client, same};
use crate::stream::{StreamVariable, StreamVariables};
use core::fmt;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Refers to a registered dirty listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type DirtyListener = Box<dyn FnMut(&ConnectorRef) + Send>;

/// A disagreement between parent and child links found by
/// [`ConnectorTracker::check_hierarchy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyProblem {
    /// `parent` lists `child` as a child, but the child names another parent.
    ParentMismatch {
        parent: String,
        child: String,
        claimed_parent: Option<String>,
    },
    /// A registered connector that the walk from the root never reached.
    Dangling {
        connector: String,
        claimed_parent: Option<String>,
    },
}

impl fmt::Display for HierarchyProblem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let or_none = |s: &Option<String>| s.clone().unwrap_or_else(|| "(none)".to_owned());
        match self {
            HierarchyProblem::ParentMismatch {
                parent,
                child,
                claimed_parent,
            } => write!(
                f,
                "{} claims that {} is its child, but the child claims {} is its parent",
                parent,
                child,
                or_none(claimed_parent)
            ),
            HierarchyProblem::Dangling {
                connector,
                claimed_parent: Some(parent),
            } => write!(
                f,
                "{} claims that {} is its parent, but the parent does not acknowledge the parenthood",
                connector, parent
            ),
            HierarchyProblem::Dangling {
                connector,
                claimed_parent: None,
            } => write!(
                f,
                "{} is registered but has no parent and is not the root",
                connector
            ),
        }
    }
}

/// Keeps track of the connectors of one session and their synchronization state.
///
/// Every connector attached below the session root is registered here under its id. The tracker
/// remembers which connectors the client has never seen (uninitialized), which need to be sent
/// again (dirty), and the state that was last sent for each connector (diff state).
///
/// The tracker does no locking of its own; the owner must serialize access, as
/// [`Session`](crate::Session) does.
pub struct ConnectorTracker {
    root: ConnectorRef,
    connectors: HashMap<ConnectorId, ConnectorRef>,
    dirty: HashMap<ConnectorId, ConnectorRef>,
    uninitialized: HashSet<ConnectorId>,
    /// Unregistered after the client learned about them; dropped on the next cleanup.
    pending_removal: HashSet<ConnectorId>,
    /// Removals from a response that failed to be written.
    unsent_removals: Vec<ConnectorId>,
    diff_states: HashMap<ConnectorId, Value>,
    stream_variables: StreamVariables,
    dirty_listeners: Vec<(ListenerId, DirtyListener)>,
    next_listener_id: u64,
    next_connector_id: u64,
    writing_response: bool,
    sync_id: u64,
}

impl ConnectorTracker {
    /// Creates an empty tracker for the tree below `root`.
    ///
    /// The root itself is not registered.
    pub fn new(root: ConnectorRef) -> ConnectorTracker {
        ConnectorTracker {
            root,
            connectors: HashMap::new(),
            dirty: HashMap::new(),
            uninitialized: HashSet::new(),
            pending_removal: HashSet::new(),
            unsent_removals: Vec::new(),
            diff_states: HashMap::new(),
            stream_variables: StreamVariables::default(),
            dirty_listeners: Vec::new(),
            next_listener_id: 0,
            next_connector_id: 0,
            writing_response: false,
            sync_id: 0,
        }
    }

    pub fn root(&self) -> &ConnectorRef {
        &self.root
    }

    // ---------------------------------------------------------------------------
    // identity registry
    // ---------------------------------------------------------------------------

    /// Registers a connector, assigning it an id if it has none.
    ///
    /// Registering the instance that is already registered under its id only logs a warning.
    /// A connector that was unregistered but not cleaned up yet is revived. A newly registered
    /// connector is uninitialized and dirty.
    pub fn register(&mut self, connector: &ConnectorRef) -> Result<ConnectorId, TrackerError> {
        let id = match connector.connector_id() {
            Some(id) => id,
            None => {
                let fresh = self.generate_id();
                connector.base().assign_id(fresh).clone()
            }
        };

        let existing = self.connectors.get(&id).cloned();
        match existing {
            None => {
                self.connectors.insert(id.clone(), Arc::clone(connector));
                self.uninitialized.insert(id.clone());
                debug!("registered {}", describe(&**connector));
            }
            Some(existing) if !same(&existing, connector) => {
                return Err(TrackerError::ConflictingRegistration { id });
            }
            Some(_) => {
                if self.pending_removal.remove(&id) {
                    debug!("re-registered {}", describe(&**connector));
                } else {
                    warn!(
                        "an already registered connector was registered again: {}",
                        describe(&**connector)
                    );
                    return Ok(id);
                }
            }
        }

        self.dirty.insert(id.clone(), Arc::clone(connector));
        Ok(id)
    }

    /// Unregisters a connector.
    ///
    /// Its diff state is dropped right away. If the client has seen the connector, the entry
    /// is kept (hidden from [`lookup`](Self::lookup)) until the next cleanup so the removal can
    /// be reported; otherwise it is dropped immediately.
    ///
    /// Unregistering an unknown connector logs a warning and does nothing.
    pub fn unregister(&mut self, connector: &ConnectorRef) -> Result<(), TrackerError> {
        let Some(id) = connector.connector_id() else {
            warn!(
                "tried to unregister {} which has never been registered",
                describe(&**connector)
            );
            return Ok(());
        };

        match self.connectors.get(&id) {
            None => {
                warn!(
                    "tried to unregister {} which is not registered",
                    describe(&**connector)
                );
                return Ok(());
            }
            Some(existing) if !same(existing, connector) => {
                return Err(TrackerError::ForeignConnector { id });
            }
            Some(_) => {}
        }

        if self.pending_removal.contains(&id) {
            warn!(
                "unregistered {} that was already unregistered",
                describe(&**connector)
            );
            return Ok(());
        }

        self.dirty.remove(&id);
        self.diff_states.remove(&id);
        if self.uninitialized.contains(&id) {
            // the client never knew about it
            self.remove_entry(&id);
        } else {
            self.pending_removal.insert(id);
        }
        debug!("unregistered {}", describe(&**connector));
        Ok(())
    }

    /// Finds a registered connector by id.
    pub fn lookup(&self, id: &str) -> Option<ConnectorRef> {
        if self.pending_removal.contains(id) {
            return None;
        }
        self.connectors.get(id).cloned()
    }

    /// Returns true if this very instance is registered (and not pending removal).
    pub fn contains(&self, connector: &ConnectorRef) -> bool {
        connector
            .connector_id()
            .and_then(|id| self.lookup(id.as_str()))
            .map_or(false, |c| same(&c, connector))
    }

    /// Number of registered connectors, excluding those pending removal.
    pub fn len(&self) -> usize {
        self.connectors.len() - self.pending_removal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered connectors, sorted by id.
    pub fn connectors(&self) -> Vec<ConnectorRef> {
        let mut ids: Vec<_> = self
            .connectors
            .keys()
            .filter(|id| !self.pending_removal.contains(*id))
            .collect();
        ids.sort();
        ids.into_iter().map(|id| Arc::clone(&self.connectors[id])).collect()
    }

    /// Removes registered connectors that can no longer be reached from the root.
    ///
    /// Detaching a connector should unregister it, so anything found here was missed; each
    /// removal is logged as a warning. Returns the removed ids.
    pub fn sweep(&mut self) -> Vec<ConnectorId> {
        let mut orphans: Vec<ConnectorId> = self
            .connectors
            .iter()
            .filter(|(id, _)| !self.pending_removal.contains(*id))
            .filter(|(_, c)| !is_reachable_from(c, &self.root))
            .map(|(id, _)| id.clone())
            .collect();
        orphans.sort();

        for id in &orphans {
            if let Some(connector) = self.connectors.get(id) {
                warn!(
                    "sweep unregistered {}; this should have been done when it was detached",
                    describe(&**connector)
                );
            }
            self.remove_entry(id);
        }
        orphans
    }

    /// Cleans up after a request: drops pending removals and stream variables of gone
    /// connectors, sweeps orphans, and resets connectors that the client has seen but can no
    /// longer see, so their full state is sent when they reappear.
    ///
    /// Does nothing unless forced or something is dirty. Returns the removed ids the client
    /// knew about.
    pub fn clean_connector_map(&mut self, force: bool) -> Vec<ConnectorId> {
        if !force && self.dirty.is_empty() && self.unsent_removals.is_empty() {
            return Vec::new();
        }

        let mut removed: Vec<ConnectorId> = self.pending_removal.drain().collect();
        for id in &removed {
            self.remove_entry(id);
        }
        // an id that was taken again since is not gone for the client
        let connectors = &self.connectors;
        removed.extend(
            self.unsent_removals
                .drain(..)
                .filter(|id| !connectors.contains_key(id)),
        );

        let unseen = self.uninitialized.clone();
        removed.extend(self.sweep().into_iter().filter(|id| !unseen.contains(id)));
        removed.sort();
        removed.dedup();

        let connectors = &self.connectors;
        self.stream_variables
            .retain_connectors(|id| connectors.contains_key(id));

        let hidden: Vec<ConnectorId> = self
            .connectors
            .iter()
            .filter(|(id, _)| !self.uninitialized.contains(*id))
            .filter(|(_, c)| !is_visible_to_client(c))
            .map(|(id, _)| id.clone())
            .collect();
        for id in hidden {
            debug!("removed state for {} as it is not visible", id);
            self.diff_states.remove(&id);
            self.uninitialized.insert(id);
        }

        removed
    }

    /// Hands back removals that could not be sent; the next cleanup reports them again.
    pub(crate) fn restore_removals(&mut self, removed: Vec<ConnectorId>) {
        self.unsent_removals.extend(removed);
    }

    /// Walks the tree from the root and reports links that disagree, plus registered
    /// connectors the walk does not reach. Each problem is logged as a warning.
    pub fn check_hierarchy(&self) -> Vec<HierarchyProblem> {
        let mut problems = Vec::new();
        let mut dangling: HashSet<&ConnectorId> = self
            .connectors
            .keys()
            .filter(|id| !self.pending_removal.contains(*id))
            .collect();

        let mut stack = vec![Arc::clone(&self.root)];
        let mut visited = HashSet::new();
        while let Some(connector) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&connector) as *const ()) {
                continue;
            }
            if let Some(id) = connector.connector_id() {
                dangling.remove(&id);
            }
            for child in connector.children() {
                let claimed = child.parent();
                if !claimed.as_ref().map_or(false, |p| same(p, &connector)) {
                    problems.push(HierarchyProblem::ParentMismatch {
                        parent: hierarchy::connector_string(&*connector),
                        child: hierarchy::connector_string(&*child),
                        claimed_parent: claimed.map(|p| hierarchy::connector_string(&*p)),
                    });
                }
                stack.push(child);
            }
        }

        let mut dangling: Vec<_> = dangling.into_iter().collect();
        dangling.sort();
        for id in dangling {
            let connector = &self.connectors[id];
            problems.push(HierarchyProblem::Dangling {
                connector: hierarchy::connector_string(&**connector),
                claimed_parent: connector
                    .parent()
                    .map(|p| hierarchy::connector_string(&*p)),
            });
        }

        for problem in &problems {
            warn!("{}", problem);
        }
        problems
    }

    fn generate_id(&mut self) -> ConnectorId {
        loop {
            let id = ConnectorId::new(self.next_connector_id.to_string());
            self.next_connector_id += 1;
            if !self.connectors.contains_key(&id) {
                return id;
            }
        }
    }

    fn remove_entry(&mut self, id: &ConnectorId) {
        self.connectors.remove(id);
        self.uninitialized.remove(id);
        self.pending_removal.remove(id);
        self.diff_states.remove(id);
        self.dirty.remove(id);
    }

    // ---------------------------------------------------------------------------
    // lifecycle flags
    // ---------------------------------------------------------------------------

    /// Returns true if the client has received the connector’s initial state.
    pub fn is_initialized(&self, connector: &ConnectorRef) -> bool {
        match connector.connector_id() {
            Some(id) => self.connectors.contains_key(&id) && !self.uninitialized.contains(&id),
            None => false,
        }
    }

    pub fn mark_initialized(&mut self, connector: &ConnectorRef) {
        if let Some(id) = connector.connector_id() {
            self.uninitialized.remove(&id);
        }
    }

    pub fn mark_uninitialized(&mut self, connector: &ConnectorRef) {
        match connector.connector_id() {
            Some(id) if self.connectors.contains_key(&id) => {
                self.uninitialized.insert(id);
            }
            _ => debug!(
                "ignoring mark_uninitialized for unregistered {}",
                describe(&**connector)
            ),
        }
    }

    /// Forgets everything the client knows: every connector becomes uninitialized and the diff
    /// state cache is cleared. Connectors waiting to be reported as removed are dropped, since
    /// the client no longer has them.
    ///
    /// Used when the client-side representation has been discarded, e.g. on a page reload.
    pub fn reset_all_client_state(&mut self) {
        let pending: Vec<ConnectorId> = self.pending_removal.drain().collect();
        for id in &pending {
            self.remove_entry(id);
        }
        self.unsent_removals.clear();
        self.uninitialized.extend(self.connectors.keys().cloned());
        self.diff_states.clear();
        debug!("all client sides are now uninitialized");
    }

    // ---------------------------------------------------------------------------
    // diff state cache
    // ---------------------------------------------------------------------------

    /// The state last sent to the client for this connector.
    pub fn snapshot(&self, connector: &ConnectorRef) -> Option<&Value> {
        let id = connector.connector_id()?;
        if self.pending_removal.contains(&id) {
            return None;
        }
        self.diff_states.get(&id)
    }

    pub fn set_snapshot(
        &mut self,
        connector: &ConnectorRef,
        state: Value,
    ) -> Result<(), TrackerError> {
        let id = self.registered_id(connector)?;
        self.diff_states.insert(id, state);
        Ok(())
    }

    fn registered_id(&self, connector: &ConnectorRef) -> Result<ConnectorId, TrackerError> {
        let id = connector
            .connector_id()
            .ok_or_else(|| TrackerError::MissingId {
                connector: describe(&**connector),
            })?;
        if self.contains(connector) {
            Ok(id)
        } else {
            Err(TrackerError::NotRegistered { id })
        }
    }

    // ---------------------------------------------------------------------------
    // dirty tracking
    // ---------------------------------------------------------------------------

    /// Marks a connector as needing synchronization. Idempotent.
    ///
    /// Dirty listeners are notified when the connector was clean before.
    pub fn mark_dirty(&mut self, connector: &ConnectorRef) -> Result<(), TrackerError> {
        if self.writing_response {
            return Err(TrackerError::DirtyWhileWriting {
                connector: describe(&**connector),
            });
        }
        let id = connector
            .connector_id()
            .ok_or_else(|| TrackerError::MissingId {
                connector: describe(&**connector),
            })?;
        if self.dirty.contains_key(&id) {
            return Ok(());
        }

        debug!("{} is now dirty", describe(&**connector));
        for (_, listener) in &mut self.dirty_listeners {
            listener(connector);
        }
        self.dirty.insert(id, Arc::clone(connector));
        Ok(())
    }

    pub fn mark_clean(&mut self, connector: &ConnectorRef) {
        if let Some(id) = connector.connector_id() {
            if self.dirty.remove(&id).is_some() {
                debug!("{} is no longer dirty", describe(&**connector));
            }
        }
    }

    pub fn is_dirty(&self, connector: &ConnectorRef) -> bool {
        connector
            .connector_id()
            .map_or(false, |id| self.dirty.contains_key(&id))
    }

    /// Marks `root` dirty, then every visible descendant, skipping the subtrees of invisible
    /// connectors.
    ///
    /// `root` itself is marked even if it is invisible, so it can tell the client about its own
    /// visibility; its subtree is skipped in that case. Descendants without an id are skipped
    /// with a warning, their children are still visited.
    pub fn mark_tree_dirty(&mut self, root: &ConnectorRef) -> Result<(), TrackerError> {
        self.mark_dirty(root)?;
        if root.is_visible() {
            for child in root.children() {
                self.mark_visible_dirty(&child)?;
            }
        }
        Ok(())
    }

    fn mark_visible_dirty(&mut self, connector: &ConnectorRef) -> Result<(), TrackerError> {
        if !connector.is_visible() {
            return Ok(());
        }
        if connector.connector_id().is_some() {
            self.mark_dirty(connector)?;
        } else {
            warn!(
                "skipping {} while marking a tree dirty; it has never been registered",
                describe(&**connector)
            );
        }
        for child in connector.children() {
            self.mark_visible_dirty(&child)?;
        }
        Ok(())
    }

    /// Marks every visible connector below the session root dirty.
    pub fn mark_all_connectors_dirty(&mut self) -> Result<(), TrackerError> {
        let root = Arc::clone(&self.root);
        self.mark_visible_dirty(&root)?;
        debug!("all connectors are now dirty");
        Ok(())
    }

    pub fn mark_all_connectors_clean(&mut self) {
        self.dirty.clear();
        debug!("all connectors are now clean");
    }

    /// All dirty connectors, sorted by id, including invisible ones.
    pub fn dirty_connectors(&self) -> Vec<ConnectorRef> {
        let mut dirty: Vec<_> = self.dirty.iter().collect();
        dirty.sort_by(|a, b| a.0.cmp(b.0));
        dirty.into_iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    pub fn has_dirty_connectors(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Dirty connectors that the client can currently see.
    pub fn dirty_visible_connectors(&self) -> Vec<ConnectorRef> {
        self.dirty_connectors()
            .into_iter()
            .filter(is_visible_to_client)
            .collect()
    }

    /// Registers a callback that is invoked whenever a clean connector becomes dirty.
    pub fn add_dirty_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ConnectorRef) + Send + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.dirty_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_dirty_listener(&mut self, id: ListenerId) -> bool {
        let len = self.dirty_listeners.len();
        self.dirty_listeners.retain(|(i, _)| *i != id);
        self.dirty_listeners.len() != len
    }

    // ---------------------------------------------------------------------------
    // response lifecycle
    // ---------------------------------------------------------------------------

    pub fn is_writing_response(&self) -> bool {
        self.writing_response
    }

    /// Sets whether a response is being written; connectors cannot be marked dirty meanwhile.
    ///
    /// Finishing a response bumps the sync id.
    pub fn set_writing_response(&mut self, writing: bool) -> Result<(), TrackerError> {
        if self.writing_response == writing {
            return Err(TrackerError::WritingStateUnchanged { writing });
        }
        if !writing {
            // the client is not expected to know about anything that happens after this
            self.sync_id += 1;
        }
        self.writing_response = writing;
        Ok(())
    }

    /// Number of responses written so far.
    pub fn current_sync_id(&self) -> u64 {
        self.sync_id
    }

    // ---------------------------------------------------------------------------
    // stream variables
    // ---------------------------------------------------------------------------

    pub fn add_stream_variable(
        &mut self,
        connector_id: &str,
        name: &str,
        variable: Arc<dyn StreamVariable>,
    ) -> Result<(), TrackerError> {
        if self.lookup(connector_id).is_none() {
            return Err(TrackerError::NotRegistered {
                id: connector_id.into(),
            });
        }
        self.stream_variables
            .add(connector_id.into(), name, variable);
        Ok(())
    }

    pub fn stream_variable(&self, connector_id: &str, name: &str) -> Option<Arc<dyn StreamVariable>> {
        self.stream_variables.get(connector_id, name)
    }

    /// The security key the client must present to stream into the variable.
    pub fn seckey(&self, connector_id: &str, name: &str) -> Option<&str> {
        self.stream_variables.seckey(connector_id, name)
    }

    pub fn clean_stream_variable(&mut self, connector_id: &str, name: &str) -> bool {
        self.stream_variables.remove(connector_id, name)
    }
}

impl fmt::Debug for ConnectorTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectorTracker")
            .field("root", &self.root.connector_id())
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("dirty", &self.dirty.keys().collect::<Vec<_>>())
            .field("uninitialized", &self.uninitialized)
            .field("pending_removal", &self.pending_removal)
            .field("unsent_removals", &self.unsent_removals)
            .field("diff_states", &self.diff_states.len())
            .field("stream_variables", &self.stream_variables)
            .field("dirty_listeners", &self.dirty_listeners.len())
            .field("writing_response", &self.writing_response)
            .field("sync_id", &self.sync_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::add_child;
    use crate::node::Node;
    use parking_lot::Mutex;
    use serde_json::json;

    fn ids(connectors: &[ConnectorRef]) -> Vec<String> {
        let mut ids: Vec<_> = connectors
            .iter()
            .map(|c| c.connector_id().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn tree() -> (ConnectorTracker, ConnectorRef, ConnectorRef, ConnectorRef) {
        let root: ConnectorRef = Node::with_id("Ui", "a");
        let b: ConnectorRef = Node::with_id("Layout", "b");
        let c: ConnectorRef = Node::with_id("Button", "c");
        add_child(&root, &b);
        add_child(&b, &c);
        let mut tracker = ConnectorTracker::new(Arc::clone(&root));
        for connector in [&root, &b, &c] {
            tracker.register(connector).unwrap();
        }
        tracker.mark_all_connectors_clean();
        (tracker, root, b, c)
    }

    #[test]
    fn register_assigns_sequential_ids() {
        let root: ConnectorRef = Node::new("Ui");
        let child: ConnectorRef = Node::new("Label");
        let mut tracker = ConnectorTracker::new(Arc::clone(&root));

        assert_eq!(tracker.register(&root).unwrap().as_str(), "0");
        assert_eq!(tracker.register(&child).unwrap().as_str(), "1");
        assert_eq!(child.connector_id().unwrap().as_str(), "1");
    }

    #[test]
    fn generated_ids_skip_taken_ones() {
        let root: ConnectorRef = Node::with_id("Ui", "0");
        let child: ConnectorRef = Node::new("Label");
        let mut tracker = ConnectorTracker::new(Arc::clone(&root));
        tracker.register(&root).unwrap();
        assert_eq!(tracker.register(&child).unwrap().as_str(), "1");
    }

    #[test]
    fn new_connectors_are_dirty_and_uninitialized() {
        let root: ConnectorRef = Node::new("Ui");
        let mut tracker = ConnectorTracker::new(Arc::clone(&root));
        tracker.register(&root).unwrap();
        assert!(tracker.is_dirty(&root));
        assert!(!tracker.is_initialized(&root));
    }

    #[test]
    fn unregister_initialized_connector_is_deferred() {
        let (mut tracker, _root, b, c) = tree();
        tracker.mark_initialized(&c);
        tracker.set_snapshot(&c, json!({ "caption": "ok" })).unwrap();

        tracker.unregister(&c).unwrap();
        assert!(tracker.lookup("c").is_none());
        assert!(tracker.snapshot(&c).is_none());
        assert!(!tracker.contains(&c));
        assert_eq!(tracker.len(), 2);

        // quick re-attach revives it without a conflict
        tracker.register(&c).unwrap();
        assert!(tracker.contains(&c));
        assert!(tracker.is_dirty(&c));

        tracker.unregister(&b).unwrap();
        tracker.unregister(&b).unwrap();
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn unregister_foreign_instance_fails() {
        let (mut tracker, _root, _b, c) = tree();
        let impostor: ConnectorRef = Node::with_id("Button", "c");
        let err = tracker.unregister(&impostor).unwrap_err();
        assert!(matches!(err, TrackerError::ForeignConnector { .. }), "got: {err}");
        assert!(tracker.contains(&c));
    }

    #[test]
    fn clean_connector_map_reports_removals() {
        let (mut tracker, root, b, c) = tree();
        tracker.mark_initialized(&b);
        tracker.mark_initialized(&c);

        tracker.unregister(&c).unwrap();
        // nothing dirty, nothing forced
        assert!(tracker.clean_connector_map(false).is_empty());

        tracker.mark_dirty(&root).unwrap();
        let removed = tracker.clean_connector_map(false);
        assert_eq!(removed, [ConnectorId::from("c")]);
        assert!(tracker.lookup("c").is_none());

        // a fresh instance may now take the id
        let replacement: ConnectorRef = Node::with_id("Button", "c");
        tracker.register(&replacement).unwrap();
    }

    #[test]
    fn clean_connector_map_resets_hidden_connectors() {
        let (mut tracker, _root, b, c) = tree();
        tracker.mark_initialized(&b);
        tracker.mark_initialized(&c);
        tracker.set_snapshot(&c, json!({})).unwrap();

        b.base().set_visible(false);
        tracker.clean_connector_map(true);

        assert!(!tracker.is_initialized(&b));
        assert!(!tracker.is_initialized(&c));
        assert!(tracker.snapshot(&c).is_none());
        assert!(tracker.contains(&c), "hidden connectors stay registered");
    }

    #[test]
    fn clean_connector_map_drops_orphaned_stream_variables() {
        #[derive(Debug)]
        struct Discard;
        impl StreamVariable for Discard {
            fn on_chunk(&self, _: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (mut tracker, _root, b, c) = tree();
        tracker
            .add_stream_variable("c", "upload", Arc::new(Discard))
            .unwrap();
        assert!(tracker.seckey("c", "upload").is_some());

        hierarchy::detach_from_parent(&c);
        tracker.unregister(&c).unwrap();
        tracker.mark_dirty(&b).unwrap();
        tracker.clean_connector_map(false);

        assert!(tracker.stream_variable("c", "upload").is_none());
        let err = tracker
            .add_stream_variable("c", "upload", Arc::new(Discard))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotRegistered { .. }));
    }

    #[test]
    fn sweep_removes_unreachable_connectors() {
        let (mut tracker, _root, b, c) = tree();
        hierarchy::detach_from_parent(&b);

        let removed = tracker.sweep();
        assert_eq!(removed, [ConnectorId::from("b"), ConnectorId::from("c")]);
        assert!(tracker.lookup("b").is_none());
        assert!(!tracker.is_dirty(&c));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.sweep().is_empty(), "a second sweep finds nothing");
    }

    #[test]
    fn check_hierarchy_finds_broken_links() {
        let (mut tracker, root, b, _c) = tree();
        assert!(tracker.check_hierarchy().is_empty());

        // b lists d as a child, but d thinks it is parentless
        let d: ConnectorRef = Node::with_id("Label", "d");
        b.base().push_child(Arc::clone(&d));
        tracker.register(&d).unwrap();

        // e claims root as its parent, but root does not list it
        let e: ConnectorRef = Node::with_id("Label", "e");
        e.base().set_parent(Some(&root));
        tracker.register(&e).unwrap();

        let problems = tracker.check_hierarchy();
        assert_eq!(
            problems,
            [
                HierarchyProblem::ParentMismatch {
                    parent: "Layout(b)".to_owned(),
                    child: "Label(d)".to_owned(),
                    claimed_parent: None,
                },
                HierarchyProblem::Dangling {
                    connector: "Label(e)".to_owned(),
                    claimed_parent: Some("Ui(a)".to_owned()),
                },
            ]
        );
        assert!(problems[1].to_string().contains("does not acknowledge"));
    }

    #[test]
    fn reset_all_client_state() {
        let (mut tracker, root, b, c) = tree();
        for connector in [&root, &b, &c] {
            tracker.mark_initialized(connector);
            tracker.set_snapshot(connector, json!({ "x": 1 })).unwrap();
        }

        tracker.reset_all_client_state();
        for connector in [&root, &b, &c] {
            assert!(!tracker.is_initialized(connector));
            assert!(tracker.snapshot(connector).is_none());
        }
    }

    #[test]
    fn set_snapshot_requires_registration() {
        let (mut tracker, ..) = tree();
        let stranger: ConnectorRef = Node::with_id("Label", "z");
        let err = tracker.set_snapshot(&stranger, json!({})).unwrap_err();
        assert!(matches!(err, TrackerError::NotRegistered { .. }));

        let unnamed: ConnectorRef = Node::new("Label");
        let err = tracker.set_snapshot(&unnamed, json!({})).unwrap_err();
        assert!(matches!(err, TrackerError::MissingId { .. }));
    }

    #[test]
    fn mark_tree_dirty_marks_invisible_target() {
        let (mut tracker, _root, b, c) = tree();
        b.base().set_visible(false);

        tracker.mark_tree_dirty(&b).unwrap();
        assert!(tracker.is_dirty(&b), "the target is marked even when invisible");
        assert!(!tracker.is_dirty(&c), "its subtree is skipped");

        tracker.mark_all_connectors_clean();
        tracker.mark_all_connectors_dirty().unwrap();
        assert_eq!(ids(&tracker.dirty_connectors()), ["a"]);
    }

    #[test]
    fn dirty_visible_connectors_filters_hidden() {
        let (mut tracker, root, b, c) = tree();
        tracker.mark_dirty(&root).unwrap();
        tracker.mark_dirty(&c).unwrap();
        b.base().set_visible(false);

        assert_eq!(ids(&tracker.dirty_connectors()), ["a", "c"]);
        assert_eq!(ids(&tracker.dirty_visible_connectors()), ["a"]);
        assert!(tracker.has_dirty_connectors());

        tracker.mark_clean(&root);
        tracker.mark_clean(&c);
        assert!(!tracker.has_dirty_connectors());
    }

    #[test]
    fn dirty_listeners_fire_on_transition_only() {
        let (mut tracker, root, b, _c) = tree();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = tracker.add_dirty_listener(move |c| {
            sink.lock().push(c.connector_id().unwrap().to_string());
        });

        tracker.mark_dirty(&root).unwrap();
        tracker.mark_dirty(&root).unwrap();
        tracker.mark_dirty(&b).unwrap();
        assert_eq!(*seen.lock(), ["a", "b"]);

        assert!(tracker.remove_dirty_listener(listener));
        assert!(!tracker.remove_dirty_listener(listener));
        tracker.mark_all_connectors_clean();
        tracker.mark_dirty(&root).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn writing_response_blocks_dirty_marking() {
        let (mut tracker, root, ..) = tree();
        assert_eq!(tracker.current_sync_id(), 0);

        tracker.set_writing_response(true).unwrap();
        let err = tracker.mark_dirty(&root).unwrap_err();
        assert!(matches!(err, TrackerError::DirtyWhileWriting { .. }));
        let err = tracker.set_writing_response(true).unwrap_err();
        assert!(matches!(err, TrackerError::WritingStateUnchanged { writing: true }));

        tracker.set_writing_response(false).unwrap();
        assert_eq!(tracker.current_sync_id(), 1);
        tracker.mark_dirty(&root).unwrap();
    }

    #[test]
    fn mark_dirty_needs_an_id() {
        let (mut tracker, ..) = tree();
        let unnamed: ConnectorRef = Node::new("Label");
        let err = tracker.mark_dirty(&unnamed).unwrap_err();
        assert!(matches!(err, TrackerError::MissingId { .. }));
    }

    #[test]
    fn parentless_orphan_is_described_without_a_parent() {
        let (mut tracker, ..) = tree();
        let stray: ConnectorRef = Node::with_id("Label", "s");
        tracker.register(&stray).unwrap();

        let problems = tracker.check_hierarchy();
        assert_eq!(
            problems,
            [HierarchyProblem::Dangling {
                connector: "Label(s)".to_owned(),
                claimed_parent: None,
            }]
        );
        assert_eq!(
            problems[0].to_string(),
            "Label(s) is registered but has no parent and is not the root"
        );
    }

    #[test]
    fn mark_tree_dirty_skips_connectors_without_id() {
        let (mut tracker, root, b, _c) = tree();
        let unnamed: ConnectorRef = Node::new("Panel");
        let inner: ConnectorRef = Node::with_id("Label", "i");
        add_child(&b, &unnamed);
        add_child(&unnamed, &inner);
        tracker.register(&inner).unwrap();
        tracker.mark_all_connectors_clean();

        tracker.mark_tree_dirty(&root).unwrap();
        assert_eq!(ids(&tracker.dirty_connectors()), ["a", "b", "c", "i"]);
    }

    #[test]
    fn reset_all_client_state_forgets_pending_removals() {
        let (mut tracker, root, _b, c) = tree();
        tracker.mark_initialized(&c);
        hierarchy::detach_from_parent(&c);
        tracker.unregister(&c).unwrap();

        tracker.reset_all_client_state();
        tracker.mark_dirty(&root).unwrap();
        assert!(tracker.clean_connector_map(false).is_empty());

        let replacement: ConnectorRef = Node::with_id("Button", "c");
        tracker.register(&replacement).unwrap();
    }

    #[test]
    fn restored_removals_are_reported_by_the_next_cleanup() {
        let (mut tracker, root, _b, c) = tree();
        tracker.mark_initialized(&c);
        hierarchy::detach_from_parent(&c);
        tracker.unregister(&c).unwrap();
        tracker.mark_dirty(&root).unwrap();

        let removed = tracker.clean_connector_map(false);
        assert_eq!(removed, [ConnectorId::from("c")]);
        tracker.restore_removals(removed);
        tracker.mark_all_connectors_clean();

        assert_eq!(tracker.clean_connector_map(false), [ConnectorId::from("c")]);
        assert!(tracker.clean_connector_map(false).is_empty());
    }
}
