use crate::connector::{ConnectorBase, ConnectorId};
use crate::impl_connector;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A general-purpose connector whose shared state is a JSON object.
///
/// Useful for containers that carry no state of their own, and for prototyping widgets before
/// they get a dedicated type.
#[derive(Debug)]
pub struct Node {
    base: ConnectorBase,
    kind: String,
    state: RwLock<Map<String, Value>>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Arc<Node> {
        Arc::new(Node {
            base: ConnectorBase::new(),
            kind: kind.into(),
            state: RwLock::new(Map::new()),
        })
    }

    pub fn with_id(kind: impl Into<String>, id: impl Into<ConnectorId>) -> Arc<Node> {
        Arc::new(Node {
            base: ConnectorBase::with_id(id),
            kind: kind.into(),
            state: RwLock::new(Map::new()),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Sets a state property and returns the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.state.write().insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.state.write().remove(key)
    }

    pub fn set_visible(&self, visible: bool) {
        self.base.set_visible(visible);
    }
}

impl_connector! {
    Node;
    base: base;
    state: state;

    fn type_name(&self) -> &str {
        &self.kind
    }
}

#[test]
fn test_node_state() {
    use crate::Connector;

    let node = Node::new("Slider");
    assert_eq!(node.type_name(), "Slider");
    assert_eq!(node.state().unwrap(), Value::Object(Map::new()));

    assert_eq!(node.set("value", 3), None);
    assert_eq!(node.set("value", 4), Some(Value::from(3)));
    node.set("max", 10);
    assert_eq!(node.get("value"), Some(Value::from(4)));
    assert_eq!(
        node.state().unwrap(),
        serde_json::json!({ "value": 4, "max": 10 })
    );

    assert_eq!(node.remove("max"), Some(Value::from(10)));
    assert_eq!(node.get("max"), None);
}
