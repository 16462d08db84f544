//! Visible path catalog
//!
//! Maps every user-visible path to the catalog entry holding its data. A
//! path maps to one entry at a time; an entry may be reachable through
//! many paths (the links handed to clients that shared a recall).

use crate::store::CatalogStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tapestage_common::ReqId;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PathCatalog {
    by_path: BTreeMap<String, ReqId>,
    by_reqid: BTreeMap<ReqId, BTreeSet<String>>,
    store: Option<Arc<CatalogStore>>,
}

impl PathCatalog {
    #[must_use]
    pub fn new(store: Option<Arc<CatalogStore>>) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Load the persisted paths
    pub fn restore(&mut self, paths: Vec<(String, ReqId)>) {
        for (path, reqid) in paths {
            self.insert(path, reqid);
        }
    }

    /// Point `path` at `reqid`, replacing any previous mapping of the path.
    /// Returns the entry the path used to point at.
    pub fn register(&mut self, path: &str, reqid: ReqId) -> Option<ReqId> {
        let previous = self.insert(path.to_string(), reqid);
        if let Some(store) = &self.store {
            store.put_path(path, reqid);
        }
        debug!("Path {} -> {}", path, reqid);
        previous.filter(|p| *p != reqid)
    }

    fn insert(&mut self, path: String, reqid: ReqId) -> Option<ReqId> {
        let previous = self.by_path.insert(path.clone(), reqid);
        if let Some(old) = previous {
            self.unindex(old, &path);
        }
        self.by_reqid.entry(reqid).or_default().insert(path);
        previous
    }

    fn unindex(&mut self, reqid: ReqId, path: &str) {
        if let Some(set) = self.by_reqid.get_mut(&reqid) {
            set.remove(path);
            if set.is_empty() {
                self.by_reqid.remove(&reqid);
            }
        }
    }

    /// Forget a path. Returns the entry it pointed at.
    pub fn remove(&mut self, path: &str) -> Option<ReqId> {
        let reqid = self.by_path.remove(path)?;
        self.unindex(reqid, path);
        if let Some(store) = &self.store {
            store.delete_path(path);
        }
        Some(reqid)
    }

    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<ReqId> {
        self.by_path.get(path).copied()
    }

    /// All paths of an entry, in lexical order
    #[must_use]
    pub fn paths_of(&self, reqid: ReqId) -> Vec<String> {
        self.by_reqid
            .get(&reqid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn first_path(&self, reqid: ReqId) -> Option<String> {
        self.by_reqid
            .get(&reqid)
            .and_then(|set| set.first().cloned())
    }

    /// Forget every path of an entry and return them
    pub fn remove_all(&mut self, reqid: ReqId) -> Vec<String> {
        let paths = self.paths_of(reqid);
        for path in &paths {
            self.remove(path);
        }
        paths
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ReqId)> {
        self.by_path.iter().map(|(p, r)| (p.as_str(), *r))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
