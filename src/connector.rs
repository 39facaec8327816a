use core::any::Any;
use core::borrow::Borrow;
use core::fmt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Identifies a connector within one session.
///
/// Ids are opaque to the client; they are assigned once and never change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(String);

impl ConnectorId {
    pub fn new(id: impl Into<String>) -> ConnectorId {
        ConnectorId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectorId {
    fn from(id: &str) -> Self {
        ConnectorId(id.to_owned())
    }
}

impl From<String> for ConnectorId {
    fn from(id: String) -> Self {
        ConnectorId(id)
    }
}

/// Shared handle to a connector.
///
/// Two handles refer to the same connector if they point at the same allocation; see
/// [`hierarchy::same`](crate::hierarchy::same).
pub type ConnectorRef = Arc<dyn Connector>;

/// Implements the `Connector` trait for a struct that embeds a [`ConnectorBase`].
///
/// The optional `state` field must be a `parking_lot::RwLock` around a `Serialize` value; it
/// becomes the connector’s shared state.
///
/// Syntax:
///
/// ```text
/// impl_connector! {
///     StructName;
///     base: base_field;
///     state: state_field;    (optional)
///     (put extra items like is_visible() here, using normal rust syntax)
/// }
/// ```
#[macro_export]
macro_rules! impl_connector {
    (
        $(#[$attr:meta])*
        $struct:ty;
        base: $base:ident;
        state: $state:ident;
        $($extra:tt)*
    ) => {
        $(#[$attr])*
        impl $crate::Connector for $struct {
            fn base(&self) -> &$crate::ConnectorBase {
                &self.$base
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            fn state(
                &self,
            ) -> ::core::result::Result<$crate::__serde_json::Value, $crate::__serde_json::Error> {
                $crate::__serde_json::to_value(&*self.$state.read())
            }

            $($extra)*
        }
    };
    (
        $(#[$attr:meta])*
        $struct:ty;
        base: $base:ident;
        $($extra:tt)*
    ) => {
        $(#[$attr])*
        impl $crate::Connector for $struct {
            fn base(&self) -> &$crate::ConnectorBase {
                &self.$base
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            $($extra)*
        }
    };
}

/// A server-side object with a client-side counterpart.
///
/// Connectors form a tree below the session root. The tracker only ever looks at a connector
/// through this trait: its id, its place in the tree, whether it is visible, and its shared
/// state. Everything else (layout, business rules, rendering) belongs to the implementor.
///
/// This trait should probably be implemented using the [`impl_connector`] macro.
pub trait Connector: Any + fmt::Debug + Send + Sync {
    /// Id, visibility and hierarchy storage.
    fn base(&self) -> &ConnectorBase;

    /// For downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Encodes the shared state that is mirrored to the client.
    fn state(&self) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    /// Type name reported to the client and used in log messages.
    fn type_name(&self) -> &str {
        short_type_name(core::any::type_name::<Self>())
    }

    fn connector_id(&self) -> Option<ConnectorId> {
        self.base().id().cloned()
    }

    fn parent(&self) -> Option<ConnectorRef> {
        self.base().parent()
    }

    fn children(&self) -> Vec<ConnectorRef> {
        self.base().children()
    }

    /// Invisible connectors and their subtrees are not synchronized.
    fn is_visible(&self) -> bool {
        self.base().is_visible()
    }
}

/// Strips the module path (but not generic arguments) from a type name.
fn short_type_name(name: &str) -> &str {
    let end = name.find('<').unwrap_or(name.len());
    let start = name[..end].rfind("::").map_or(0, |i| i + 2);
    &name[start..]
}

/// Per-connector bookkeeping embedded in every connector.
pub struct ConnectorBase {
    id: OnceLock<ConnectorId>,
    visible: AtomicBool,
    parent: RwLock<Option<Weak<dyn Connector>>>,
    children: RwLock<Vec<ConnectorRef>>,
}

impl ConnectorBase {
    /// Creates a visible, parentless base without an id; the tracker assigns one on
    /// registration.
    pub fn new() -> ConnectorBase {
        ConnectorBase {
            id: OnceLock::new(),
            visible: AtomicBool::new(true),
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
        }
    }

    /// Creates a base with a preassigned id.
    pub fn with_id(id: impl Into<ConnectorId>) -> ConnectorBase {
        let base = ConnectorBase::new();
        let _ = base.id.set(id.into());
        base
    }

    pub fn id(&self) -> Option<&ConnectorId> {
        self.id.get()
    }

    /// Sets the id unless one is already set, and returns the id in effect.
    pub(crate) fn assign_id(&self, id: ConnectorId) -> &ConnectorId {
        self.id.get_or_init(|| id)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Changes visibility.
    ///
    /// The tracker is not notified; callers should mark the parent’s tree dirty afterwards.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    pub fn parent(&self) -> Option<ConnectorRef> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<ConnectorRef> {
        self.children.read().clone()
    }

    pub(crate) fn set_parent(&self, parent: Option<&ConnectorRef>) {
        *self.parent.write() = parent.map(Arc::downgrade);
    }

    pub(crate) fn push_child(&self, child: ConnectorRef) {
        self.children.write().push(child);
    }

    pub(crate) fn remove_child(&self, child: &ConnectorRef) -> bool {
        let mut children = self.children.write();
        match children
            .iter()
            .position(|c| crate::hierarchy::same(c, child))
        {
            Some(pos) => {
                children.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Default for ConnectorBase {
    fn default() -> Self {
        ConnectorBase::new()
    }
}

impl fmt::Debug for ConnectorBase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let children: Vec<_> = self
            .children
            .read()
            .iter()
            .map(|c| c.connector_id())
            .collect();
        f.debug_struct("ConnectorBase")
            .field("id", &self.id.get())
            .field("visible", &self.is_visible())
            .field("parent", &self.parent().and_then(|p| p.connector_id()))
            .field("children", &children)
            .finish()
    }
}
