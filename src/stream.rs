//! Stream variables: named upload receivers owned by connectors.
//!
//! The client may only stream into a variable if it presents the variable’s security key, which
//! is handed out together with the owning connector’s state.

use crate::connector::ConnectorId;
use core::fmt;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use uuid::Uuid;

/// Metadata about an upload in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingEvent {
    pub file_name: String,
    pub mime_type: String,
    /// Total length, if the client announced it.
    pub content_length: Option<u64>,
    pub bytes_received: u64,
}

/// Receives streamed bytes for a connector.
pub trait StreamVariable: fmt::Debug + Send + Sync {
    /// Receives the next chunk of data.
    fn on_chunk(&self, chunk: &[u8]) -> io::Result<()>;

    /// Whether `on_progress` should be called after every chunk.
    fn listen_progress(&self) -> bool {
        false
    }

    fn streaming_started(&self, event: &StreamingEvent) {
        let _ = event;
    }

    fn on_progress(&self, event: &StreamingEvent) {
        let _ = event;
    }

    fn streaming_finished(&self, event: &StreamingEvent) {
        let _ = event;
    }

    fn streaming_failed(&self, event: &StreamingEvent, error: &io::Error) {
        let _ = (event, error);
    }

    /// Polled between chunks; returning true aborts the upload.
    fn is_interrupted(&self) -> bool {
        false
    }
}

const CHUNK_SIZE: usize = 4096;

/// Feeds `reader` into `variable`, chunk by chunk, reporting progress and the final outcome.
///
/// Returns the number of bytes delivered. An interrupt fails the upload with
/// `io::ErrorKind::Interrupted`.
pub fn stream_to(
    variable: &dyn StreamVariable,
    file_name: &str,
    mime_type: &str,
    content_length: Option<u64>,
    mut reader: impl Read,
) -> io::Result<u64> {
    let mut event = StreamingEvent {
        file_name: file_name.to_owned(),
        mime_type: mime_type.to_owned(),
        content_length,
        bytes_received: 0,
    };
    variable.streaming_started(&event);

    let mut buf = [0; CHUNK_SIZE];
    let result = loop {
        if variable.is_interrupted() {
            break Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "upload interrupted by receiver",
            ));
        }
        let len = match reader.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => break Err(err),
        };
        if let Err(err) = variable.on_chunk(&buf[..len]) {
            break Err(err);
        }
        event.bytes_received += len as u64;
        if variable.listen_progress() {
            variable.on_progress(&event);
        }
    };

    match result {
        Ok(()) => {
            variable.streaming_finished(&event);
            Ok(event.bytes_received)
        }
        Err(err) => {
            variable.streaming_failed(&event, &err);
            Err(err)
        }
    }
}

struct Entry {
    variable: Arc<dyn StreamVariable>,
    seckey: String,
}

/// Stream variables by owning connector and name.
#[derive(Default)]
pub(crate) struct StreamVariables {
    by_connector: HashMap<ConnectorId, HashMap<String, Entry>>,
}

impl StreamVariables {
    /// Adds or replaces a variable. Re-adding the same variable keeps its security key.
    pub(crate) fn add(&mut self, id: ConnectorId, name: &str, variable: Arc<dyn StreamVariable>) {
        let by_name = self.by_connector.entry(id).or_default();
        match by_name.get_mut(name) {
            Some(entry) if same_variable(&entry.variable, &variable) => {}
            Some(entry) => {
                entry.variable = variable;
                entry.seckey = Uuid::new_v4().to_string();
            }
            None => {
                by_name.insert(
                    name.to_owned(),
                    Entry {
                        variable,
                        seckey: Uuid::new_v4().to_string(),
                    },
                );
            }
        }
    }

    pub(crate) fn get(&self, id: &str, name: &str) -> Option<Arc<dyn StreamVariable>> {
        self.by_connector
            .get(id)
            .and_then(|by_name| by_name.get(name))
            .map(|entry| Arc::clone(&entry.variable))
    }

    pub(crate) fn seckey(&self, id: &str, name: &str) -> Option<&str> {
        self.by_connector
            .get(id)
            .and_then(|by_name| by_name.get(name))
            .map(|entry| entry.seckey.as_str())
    }

    pub(crate) fn remove(&mut self, id: &str, name: &str) -> bool {
        let Some(by_name) = self.by_connector.get_mut(id) else {
            return false;
        };
        let removed = by_name.remove(name).is_some();
        if by_name.is_empty() {
            self.by_connector.remove(id);
        }
        removed
    }

    /// Drops all variables of connectors for which `keep` returns false.
    pub(crate) fn retain_connectors(&mut self, mut keep: impl FnMut(&ConnectorId) -> bool) {
        self.by_connector.retain(|id, _| keep(id));
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.by_connector.is_empty()
    }
}

impl fmt::Debug for StreamVariables {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(
                self.by_connector
                    .iter()
                    .map(|(id, by_name)| (id, by_name.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}

fn same_variable(a: &Arc<dyn StreamVariable>, b: &Arc<dyn StreamVariable>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Sink {
        data: Mutex<Vec<u8>>,
        progress: Mutex<Vec<u64>>,
        finished: Mutex<bool>,
        failed: Mutex<bool>,
        interrupt_after: Option<usize>,
    }

    impl StreamVariable for Sink {
        fn on_chunk(&self, chunk: &[u8]) -> io::Result<()> {
            self.data.lock().extend_from_slice(chunk);
            Ok(())
        }
        fn listen_progress(&self) -> bool {
            true
        }
        fn on_progress(&self, event: &StreamingEvent) {
            self.progress.lock().push(event.bytes_received);
        }
        fn streaming_finished(&self, _: &StreamingEvent) {
            *self.finished.lock() = true;
        }
        fn streaming_failed(&self, _: &StreamingEvent, _: &io::Error) {
            *self.failed.lock() = true;
        }
        fn is_interrupted(&self) -> bool {
            self.interrupt_after
                .map_or(false, |n| self.data.lock().len() >= n)
        }
    }

    #[test]
    fn streams_all_bytes() {
        let sink = Sink::default();
        let payload = vec![7u8; CHUNK_SIZE + 10];
        let n = stream_to(&sink, "a.bin", "application/octet-stream", None, &payload[..]).unwrap();

        assert_eq!(n, payload.len() as u64);
        assert_eq!(*sink.data.lock(), payload);
        assert_eq!(*sink.progress.lock(), [CHUNK_SIZE as u64, payload.len() as u64]);
        assert!(*sink.finished.lock());
        assert!(!*sink.failed.lock());
    }

    #[test]
    fn interrupt_fails_upload() {
        let sink = Sink {
            interrupt_after: Some(1),
            ..Sink::default()
        };
        let payload = vec![1u8; CHUNK_SIZE * 3];
        let err = stream_to(&sink, "a.bin", "application/octet-stream", None, &payload[..])
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(sink.data.lock().len(), CHUNK_SIZE);
        assert!(*sink.failed.lock());
        assert!(!*sink.finished.lock());
    }

    #[test]
    fn seckeys_follow_variable_identity() {
        let mut vars = StreamVariables::default();
        let a: Arc<dyn StreamVariable> = Arc::new(Sink::default());
        let b: Arc<dyn StreamVariable> = Arc::new(Sink::default());

        vars.add("1".into(), "upload", Arc::clone(&a));
        let key = vars.seckey("1", "upload").unwrap().to_owned();
        assert!(Uuid::parse_str(&key).is_ok());

        vars.add("1".into(), "upload", Arc::clone(&a));
        assert_eq!(vars.seckey("1", "upload"), Some(key.as_str()));

        vars.add("1".into(), "upload", b);
        assert_ne!(vars.seckey("1", "upload"), Some(key.as_str()));

        assert!(vars.remove("1", "upload"));
        assert!(!vars.remove("1", "upload"));
        assert!(vars.is_empty());
    }
}
