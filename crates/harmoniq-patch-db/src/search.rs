use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::datasource::{DataSource, SourceTree};
use crate::patch::{equals, Patch, PatchPtr};
use crate::tags::TypedTags;
use crate::types::{SearchHandle, SourceType};

pub type SearchResults = HashSet<PatchPtr>;
pub type SearchCallback = Arc<dyn Fn(&Search) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Case-insensitive substring of the patch name.
    pub name: String,
    pub tags: TypedTags,
    pub source: Option<DataSource>,
    pub source_type: Option<SourceType>,
    /// Find patches with the same content as this one.
    pub patch: Option<PatchPtr>,
}

impl SearchRequest {
    pub fn for_source(source: DataSource) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn for_source_type(source_type: SourceType) -> Self {
        Self {
            source_type: Some(source_type),
            ..Self::default()
        }
    }

    pub fn for_tags(tags: TypedTags) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }

    pub fn for_patch(patch: PatchPtr) -> Self {
        Self {
            patch: Some(patch),
            ..Self::default()
        }
    }

    /// Source type this request is restricted to, if any.
    pub fn source_type(&self) -> Option<SourceType> {
        self.source
            .as_ref()
            .map(|source| source.source_type)
            .or(self.source_type)
    }

    pub fn matches(&self, patch: &Patch, tree: &SourceTree) -> bool {
        if let Some(target) = &self.patch {
            return matches_content(patch, target);
        }

        let Some(node) = tree.source_of(patch) else {
            return false;
        };

        if let Some(source) = &self.source {
            let Some(wanted) = tree.find(source) else {
                return false;
            };
            let inside = if source.source_type == SourceType::Folder {
                tree.is_within(node.id(), wanted)
            } else {
                node.id() == wanted
            };
            if !inside {
                return false;
            }
        } else if let Some(source_type) = self.source_type {
            if node.source().source_type != source_type {
                return false;
            }
        }

        if !self.name.is_empty() {
            let name = patch.name().to_lowercase();
            if !name.contains(&self.name.to_lowercase()) {
                return false;
            }
        }

        if self.tags.is_empty() {
            return true;
        }

        let tags = patch.tags();
        self.tags.iter().all(|(ty, wanted)| {
            wanted.added().iter().all(|tag| tags.contains_added(ty, tag))
                && wanted.removed().iter().all(|tag| !tags.contains_added(ty, tag))
        })
    }
}

/// Same content as `target`: equal hash, or same size and name with
/// identical bytes.
pub fn matches_content(patch: &Patch, target: &Patch) -> bool {
    if patch.hash() == target.hash() {
        return true;
    }
    patch.len() == target.len() && patch.name() == target.name() && equals(patch, target)
}

/// A standing query. Results are kept up to date while it is registered.
pub struct Search {
    handle: SearchHandle,
    request: SearchRequest,
    state: Mutex<SearchState>,
    results: RwLock<SearchResults>,
    callback: Option<SearchCallback>,
}

impl Search {
    pub(crate) fn new(
        handle: SearchHandle,
        request: SearchRequest,
        callback: Option<SearchCallback>,
    ) -> Self {
        Self {
            handle,
            request,
            state: Mutex::new(SearchState::Pending),
            results: RwLock::new(SearchResults::new()),
            callback,
        }
    }

    pub fn handle(&self) -> SearchHandle {
        self.handle
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    pub fn state(&self) -> SearchState {
        *self.state.lock()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == SearchState::Completed
    }

    pub(crate) fn set_state(&self, state: SearchState) {
        *self.state.lock() = state;
    }

    /// Marks the search completed unless it was cancelled meanwhile.
    pub(crate) fn finish(&self) -> SearchState {
        let mut state = self.state.lock();
        if *state != SearchState::Cancelled {
            *state = SearchState::Completed;
        }
        *state
    }

    /// Returns false if the search already completed.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SearchState::Completed {
            return false;
        }
        *state = SearchState::Cancelled;
        true
    }

    pub(crate) fn callback(&self) -> Option<SearchCallback> {
        self.callback.clone()
    }

    pub fn result_count(&self) -> usize {
        self.results.read().len()
    }

    pub fn results(&self) -> Vec<PatchPtr> {
        self.results.read().iter().cloned().collect()
    }

    pub fn contains(&self, patch: &PatchPtr) -> bool {
        self.results.read().contains(patch)
    }

    pub(crate) fn insert_result(&self, patch: PatchPtr) -> bool {
        self.results.write().insert(patch)
    }

    pub(crate) fn replace_results(&self, results: SearchResults) {
        *self.results.write() = results;
    }

    /// Re-evaluates `patches` against the request. Returns true if the
    /// number of results changed.
    pub(crate) fn update(&self, patches: &[PatchPtr], tree: &SourceTree) -> bool {
        let matches: Vec<bool> = patches
            .iter()
            .map(|patch| self.request.matches(patch, tree))
            .collect();
        let mut results = self.results.write();
        let before = results.len();
        for (patch, matched) in patches.iter().zip(matches) {
            if matched {
                results.insert(Arc::clone(patch));
            } else {
                results.remove(patch);
            }
        }
        results.len() != before
    }

    pub(crate) fn remove_results(&self, patches: &[PatchPtr]) -> bool {
        let mut results = self.results.write();
        let before = results.len();
        for patch in patches {
            results.remove(patch);
        }
        results.len() != before
    }
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("results", &self.result_count())
            .finish()
    }
}

/// Active searches plus the cancellations the loader has not seen yet.
#[derive(Debug, Default)]
pub(crate) struct SearchRegistry {
    pub active: HashMap<SearchHandle, Arc<Search>>,
    pub cancelled: HashSet<SearchHandle>,
}

impl SearchRegistry {
    pub fn live(&self) -> impl Iterator<Item = &Arc<Search>> {
        self.active.values()
    }

    /// Consumes a pending cancellation for `handle`.
    pub fn take_cancelled(&mut self, handle: SearchHandle) -> bool {
        self.cancelled.remove(&handle)
    }
}
