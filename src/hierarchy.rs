//! Parent/child links between connectors.
//!
//! These helpers edit the links stored in each connector’s [`ConnectorBase`]; connectors that
//! override `children` or `parent` manage their own links.
//!
//! [`ConnectorBase`]: crate::ConnectorBase

use crate::connector::{Connector, ConnectorRef};
use std::collections::HashSet;
use std::sync::Arc;

/// Returns true if both handles point at the same connector instance.
pub fn same(a: &ConnectorRef, b: &ConnectorRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Makes `child` the last child of `parent`, removing it from its previous parent first.
///
/// Returns false and changes nothing if `parent` is `child` or one of its descendants.
pub fn add_child(parent: &ConnectorRef, child: &ConnectorRef) -> bool {
    if is_reachable_from(parent, child) {
        return false;
    }
    if let Some(previous) = child.parent() {
        if same(&previous, parent) {
            return true;
        }
        previous.base().remove_child(child);
    }
    child.base().set_parent(Some(parent));
    parent.base().push_child(Arc::clone(child));
    true
}

/// Removes `child` from `parent`. Returns false if it was not a child of `parent`.
pub fn remove_child(parent: &ConnectorRef, child: &ConnectorRef) -> bool {
    let removed = parent.base().remove_child(child);
    if removed {
        child.base().set_parent(None);
    }
    removed
}

/// Unlinks a connector from its parent and returns the former parent.
pub fn detach_from_parent(child: &ConnectorRef) -> Option<ConnectorRef> {
    let parent = child.parent()?;
    remove_child(&parent, child);
    Some(parent)
}

/// Collects a connector and all of its descendants, depth-first, parents before children.
pub fn descendants(root: &ConnectorRef) -> Vec<ConnectorRef> {
    let mut result = Vec::new();
    collect_descendants(root, &mut result);
    result
}

fn collect_descendants(connector: &ConnectorRef, result: &mut Vec<ConnectorRef>) {
    result.push(Arc::clone(connector));
    for child in connector.children() {
        collect_descendants(&child, result);
    }
}

/// Returns true if following parent links from `connector` leads to `root`.
pub fn is_reachable_from(connector: &ConnectorRef, root: &ConnectorRef) -> bool {
    // guards against parent cycles
    let mut seen = HashSet::new();
    let mut current = Some(Arc::clone(connector));
    while let Some(c) = current {
        if same(&c, root) {
            return true;
        }
        if !seen.insert(Arc::as_ptr(&c) as *const ()) {
            return false;
        }
        current = c.parent();
    }
    false
}

/// A connector is visible to the client if it and all of its ancestors are visible.
pub fn is_visible_to_client(connector: &ConnectorRef) -> bool {
    let mut current = Some(Arc::clone(connector));
    while let Some(c) = current {
        if !c.is_visible() {
            return false;
        }
        current = c.parent();
    }
    true
}

/// `Type(id)`, or `Type(?)` for connectors that have no id yet.
pub fn connector_string(connector: &dyn Connector) -> String {
    match connector.connector_id() {
        Some(id) => format!("{}({})", connector.type_name(), id),
        None => format!("{}(?)", connector.type_name()),
    }
}

/// Describes a connector and its parent for log messages.
pub fn describe(connector: &dyn Connector) -> String {
    match connector.parent() {
        Some(parent) => format!(
            "{} (parent: {})",
            connector_string(connector),
            connector_string(&*parent)
        ),
        None => connector_string(connector),
    }
}
