//! One-shot subscriptions on module exports

use crate::module::{Exports, ModuleId};
use rhai::Map;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type Predicate = Rc<dyn Fn(&Exports) -> bool>;
pub type Callback = Box<dyn FnOnce(&Exports) -> anyhow::Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    id: SubscriptionId,
    predicate: Predicate,
    callback: Callback,
}

#[derive(Default)]
struct TableState {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Shared handle to the process-wide subscription table.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    state: Rc<RefCell<TableState>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<P, C>(&self, predicate: P, callback: C) -> SubscriptionId
    where
        P: Fn(&Exports) -> bool + 'static,
        C: FnOnce(&Exports) -> anyhow::Result<()> + 'static,
    {
        let mut state = self.state.borrow_mut();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            predicate: Rc::new(predicate),
            callback: Box::new(callback),
        });
        id
    }

    /// Drop a subscription that has not fired yet.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.take(id).is_some()
    }

    pub fn is_pending(&self, id: SubscriptionId) -> bool {
        self.state.borrow().entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, id: SubscriptionId) -> Option<Callback> {
        let mut state = self.state.borrow_mut();
        let pos = state.entries.iter().position(|e| e.id == id)?;
        Some(state.entries.remove(pos).callback)
    }

    /// Offer a module's exports to every pending subscription.
    ///
    /// Works on a snapshot: subscriptions added by a callback wait for the
    /// next module, and entries retired by a nested dispatch are skipped.
    /// Returns how many callbacks ran.
    pub fn dispatch(&self, module: &ModuleId, exports: &Exports) -> usize {
        let snapshot: Vec<(SubscriptionId, Predicate)> = self
            .state
            .borrow()
            .entries
            .iter()
            .map(|e| (e.id, Rc::clone(&e.predicate)))
            .collect();

        let mut fired = 0;
        for (id, predicate) in snapshot {
            if !self.is_pending(id) {
                continue;
            }
            let Some(target) = matching_export(exports, &*predicate) else {
                continue;
            };
            let Some(callback) = self.take(id) else {
                continue;
            };
            fired += 1;
            if let Err(err) = callback(&target) {
                let error = format!("{err:#}");
                tracing::error!(subscription = %id, module = %module, %error, "subscription callback failed");
            }
        }
        fired
    }
}

/// The exports themselves if they match, else their `default` export.
pub fn matching_export(exports: &Exports, predicate: &dyn Fn(&Exports) -> bool) -> Option<Exports> {
    if predicate(exports) {
        return Some(exports.clone());
    }
    let default = default_export(exports)?;
    predicate(&default).then_some(default)
}

fn default_export(exports: &Exports) -> Option<Exports> {
    let map = exports.read_lock::<Map>()?;
    map.get("default").filter(|d| !d.is_unit()).cloned()
}

/// Read access to modules the host has already executed.
pub trait ModuleCache {
    fn loaded(&self) -> Vec<(ModuleId, Exports)>;
}

/// First already-loaded module whose exports (or default export) match.
pub fn find(cache: &dyn ModuleCache, predicate: &dyn Fn(&Exports) -> bool) -> Option<Exports> {
    cache
        .loaded()
        .iter()
        .find_map(|(_, exports)| matching_export(exports, predicate))
}

/// Common predicates.
pub mod filters {
    use super::*;

    /// Exports is an object carrying every one of `props`.
    pub fn by_props(props: &[&str]) -> impl Fn(&Exports) -> bool + 'static {
        let props: Vec<String> = props.iter().map(|p| p.to_string()).collect();
        move |exports| match exports.read_lock::<Map>() {
            Some(map) => props.iter().all(|p| map.contains_key(p.as_str())),
            None => false,
        }
    }

    /// Exports has `key` and its value satisfies `test`.
    pub fn by_key<F>(key: &str, test: F) -> impl Fn(&Exports) -> bool + 'static
    where
        F: Fn(&Exports) -> bool + 'static,
    {
        let key = key.to_string();
        move |exports| {
            exports
                .read_lock::<Map>()
                .and_then(|map| map.get(key.as_str()).map(&test))
                .unwrap_or(false)
        }
    }
}
