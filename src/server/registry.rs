//! The process-wide registry that maps advertised names to the connections
//! publishing them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::server::session::Publisher;

/// Why a designator failed to resolve to a publisher.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum LookupError {
    /// No connection currently publishes under the name.
    #[error("Slave {0} not found")]
    NotFound(String),
    /// Fewer publishers share the name than the index requires.
    #[error("Invalid index {index} for slave {name}")]
    BadIndex {
        /// The name that was looked up.
        name: String,
        /// The out of range index.
        index: u32,
    },
}

/// Maps every advertised name to the publishers listening under it, newest
/// first. A connection appears here, under each of its names, exactly while
/// it owns at least one virtual listener.
///
/// All operations take the one internal lock for their whole duration and
/// never suspend while holding it; callers must not keep the returned
/// [`Publisher`] handles across their own suspension points when consistency
/// with the registry matters.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    names: Mutex<HashMap<String, Vec<Arc<Publisher>>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Prepends the publisher under each of its names: index 0 always refers
    /// to the most recent publisher of a name.
    pub fn register(&self, publisher: &Arc<Publisher>) {
        let mut names = self.names.lock().unwrap();
        for name in &publisher.names {
            names.entry(name.clone()).or_default().insert(0, Arc::clone(publisher));
        }
    }

    /// Removes the publisher under each of its names, preserving the order of
    /// the remaining entries. Unknown publishers are left alone.
    pub fn unregister(&self, publisher: &Arc<Publisher>) {
        let mut names = self.names.lock().unwrap();
        for name in &publisher.names {
            if let Some(list) = names.get_mut(name) {
                list.retain(|registered| !Arc::ptr_eq(registered, publisher));
                if list.is_empty() {
                    names.remove(name);
                }
            }
        }
    }

    /// Resolves a name and index to a publisher.
    pub fn lookup(&self, name: &str, index: u32) -> Result<Arc<Publisher>, LookupError> {
        let names = self.names.lock().unwrap();
        let list = names.get(name).ok_or_else(|| LookupError::NotFound(name.to_string()))?;
        list.get(index as usize).cloned().ok_or_else(|| LookupError::BadIndex {
            name: name.to_string(),
            index,
        })
    }

    /// The distinct publishers currently registered, in no particular order.
    pub fn publishers(&self) -> Vec<Arc<Publisher>> {
        let names = self.names.lock().unwrap();
        let mut distinct: Vec<Arc<Publisher>> = Vec::new();
        for publisher in names.values().flatten() {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, publisher)) {
                distinct.push(Arc::clone(publisher));
            }
        }
        distinct
    }
}
