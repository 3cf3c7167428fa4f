//! Middleware groups — named, hot-swappable middleware sequences
//!
//! A group is a named ordered middleware list shared across routes and
//! upstreams. Members can be replaced, added or deleted atomically while
//! requests are in flight; a request uses the member snapshot it loaded
//! when it entered the group.

use super::{sort_middlewares, Middleware};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A named ordered middleware list with atomic member replacement.
pub struct Group {
    name: String,
    lock: Mutex<()>,
    members: ArcSwap<Vec<Arc<dyn Middleware>>>,
}

impl Group {
    pub fn new(name: impl Into<String>, mut members: Vec<Arc<dyn Middleware>>) -> Self {
        sort_middlewares(&mut members);
        Self {
            name: name.into(),
            lock: Mutex::new(()),
            members: ArcSwap::from_pointee(members),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current member list. In-flight requests keep the snapshot they
    /// loaded even if the group is swapped underneath them.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Middleware>>> {
        self.members.load_full()
    }

    /// Replace all members.
    pub fn reset(&self, mut members: Vec<Arc<dyn Middleware>>) {
        sort_middlewares(&mut members);
        let _guard = self.lock.lock().expect("group lock poisoned");
        self.members.store(Arc::new(members));
    }

    /// Add members, replacing same-named ones.
    pub fn add(&self, members: Vec<Arc<dyn Middleware>>) {
        let _guard = self.lock.lock().expect("group lock poisoned");
        let mut next: Vec<Arc<dyn Middleware>> = self.members.load().as_ref().clone();
        for mw in members {
            match next.iter_mut().find(|m| m.name() == mw.name()) {
                Some(slot) => *slot = mw,
                None => next.push(mw),
            }
        }
        sort_middlewares(&mut next);
        self.members.store(Arc::new(next));
    }

    /// Delete members by name.
    pub fn del(&self, names: &[&str]) {
        let _guard = self.lock.lock().expect("group lock poisoned");
        let mut next: Vec<Arc<dyn Middleware>> = self.members.load().as_ref().clone();
        next.retain(|m| !names.contains(&m.name()));
        self.members.store(Arc::new(next));
    }
}

/// Lock-free readable map of middleware groups by name.
pub struct GroupManager {
    lock: Mutex<HashMap<String, Arc<Group>>>,
    view: ArcSwap<HashMap<String, Arc<Group>>>,
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(HashMap::new()),
            view: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.view.load().get(name).cloned()
    }

    pub fn groups(&self) -> Arc<HashMap<String, Arc<Group>>> {
        self.view.load_full()
    }

    /// Add the group; an existing same-named group is hot-swapped in place
    /// so routes referencing it pick up the new members.
    pub fn add(&self, name: impl Into<String>, members: Vec<Arc<dyn Middleware>>) {
        let name = name.into();
        let mut shadow = self.lock.lock().expect("group manager lock poisoned");
        match shadow.get(&name) {
            Some(existing) => existing.reset(members),
            None => {
                shadow.insert(name.clone(), Arc::new(Group::new(name, members)));
                self.view.store(Arc::new(shadow.clone()));
            }
        }
    }

    pub fn del(&self, name: &str) {
        let mut shadow = self.lock.lock().expect("group manager lock poisoned");
        if shadow.remove(name).is_some() {
            self.view.store(Arc::new(shadow.clone()));
        }
    }
}
