//! Writing a synchronization response.
//!
//! One response carries the state changes of every dirty connector the client can see, plus
//! the ids of connectors the client should forget.

use crate::connector::{ConnectorId, ConnectorRef};
use crate::error::TrackerError;
use crate::tracker::ConnectorTracker;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

/// The changes sent to the client in one round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Changes {
    /// Sync id after this response; the client echoes it back.
    pub sync_id: u64,
    pub updates: Vec<StateUpdate>,
    pub removed: Vec<ConnectorId>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removed.is_empty()
    }
}

/// New state for one connector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub id: ConnectorId,
    #[serde(rename = "type")]
    pub type_name: String,
    /// True if this is the first state the client gets for the connector; `state` is then
    /// complete. Otherwise `state` only holds the properties that changed.
    pub initial: bool,
    pub state: Value,
}

/// Computes what changed between the last sent state and the current one.
///
/// Objects are compared property by property and removed properties are sent as `null`. Other
/// values are sent whole when they differ. Returns `None` if nothing changed.
pub fn diff_state(previous: Option<&Value>, current: &Value) -> Option<Value> {
    match (previous, current) {
        (Some(Value::Object(previous)), Value::Object(current)) => {
            let mut changed: Map<String, Value> = current
                .iter()
                .filter(|(key, value)| previous.get(*key) != Some(*value))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            for key in previous.keys() {
                if !current.contains_key(key) {
                    changed.insert(key.clone(), Value::Null);
                }
            }
            if changed.is_empty() {
                None
            } else {
                Some(Value::Object(changed))
            }
        }
        (Some(previous), current) if previous == current => None,
        (_, current) => Some(current.clone()),
    }
}

/// Writes one response: cleans up the connector map, encodes the state of every dirty visible
/// connector, and marks everything clean.
///
/// Uninitialized connectors get their full state and become initialized. The diff state of each
/// written connector is replaced by its current state.
///
/// If any state fails to encode, nothing is committed: snapshots, initialization flags and the
/// dirty set are left as they were, and the removals are kept, so the next response retries.
pub fn write_changes(
    tracker: &mut ConnectorTracker,
    force_cleanup: bool,
) -> Result<Changes, TrackerError> {
    let removed = tracker.clean_connector_map(force_cleanup);

    tracker.set_writing_response(true)?;
    let encoded = match encode_dirty(tracker) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracker.restore_removals(removed);
            tracker.set_writing_response(false)?;
            return Err(err);
        }
    };

    let mut updates = Vec::with_capacity(encoded.len());
    for Encoded {
        connector,
        id,
        state,
        initial,
    } in encoded
    {
        let diff = if initial {
            Some(state.clone())
        } else {
            diff_state(tracker.snapshot(&connector), &state)
        };
        tracker.set_snapshot(&connector, state)?;
        tracker.mark_initialized(&connector);

        if let Some(state) = diff {
            updates.push(StateUpdate {
                id,
                type_name: connector.type_name().to_owned(),
                initial,
                state,
            });
        }
    }
    tracker.mark_all_connectors_clean();
    tracker.set_writing_response(false)?;

    debug!(
        "wrote {} state updates and {} removals",
        updates.len(),
        removed.len()
    );
    Ok(Changes {
        sync_id: tracker.current_sync_id(),
        updates,
        removed,
    })
}

struct Encoded {
    connector: ConnectorRef,
    id: ConnectorId,
    state: Value,
    initial: bool,
}

fn encode_dirty(tracker: &ConnectorTracker) -> Result<Vec<Encoded>, TrackerError> {
    let dirty: Vec<ConnectorRef> = tracker
        .dirty_visible_connectors()
        .into_iter()
        .filter(|c| tracker.contains(c))
        .collect();

    let mut encoded = Vec::with_capacity(dirty.len());
    for connector in dirty {
        let Some(id) = connector.connector_id() else {
            continue;
        };
        let state = connector
            .state()
            .map_err(|source| TrackerError::State {
                id: id.clone(),
                source,
            })?;
        let initial = !tracker.is_initialized(&connector);
        encoded.push(Encoded {
            connector,
            id,
            state,
            initial,
        });
    }
    Ok(encoded)
}
