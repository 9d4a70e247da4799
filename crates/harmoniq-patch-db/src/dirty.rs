use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;

use crate::types::{SearchHandle, TagType};

/// What changed since the last poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dirty {
    pub data_sources: bool,
    pub patches: bool,
    pub tags: BTreeSet<TagType>,
    pub searches: BTreeSet<SearchHandle>,
    pub errors: Vec<String>,
}

impl Dirty {
    pub fn is_empty(&self) -> bool {
        !self.data_sources
            && !self.patches
            && self.tags.is_empty()
            && self.searches.is_empty()
            && self.errors.is_empty()
    }
}

pub(crate) type UiFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct UiState {
    dirty: Dirty,
    functions: Vec<UiFn>,
}

/// Accumulates dirty flags and deferred functions for the owning thread.
///
/// Producers only ever append; [`UiChannel::drain`] hands everything over in
/// one swap so each flag and each function is observed exactly once.
#[derive(Default)]
pub(crate) struct UiChannel {
    state: Mutex<UiState>,
}

impl UiChannel {
    pub fn mark(&self, f: impl FnOnce(&mut Dirty)) {
        f(&mut self.state.lock().dirty);
    }

    pub fn data_sources_changed(&self) {
        self.mark(|dirty| dirty.data_sources = true);
    }

    pub fn patches_changed(&self) {
        self.mark(|dirty| dirty.patches = true);
    }

    pub fn tag_changed(&self, ty: TagType) {
        self.mark(|dirty| {
            dirty.tags.insert(ty);
        });
    }

    pub fn search_changed(&self, handle: SearchHandle) {
        self.mark(|dirty| {
            dirty.searches.insert(handle);
        });
    }

    pub fn searches_changed(&self, handles: impl IntoIterator<Item = SearchHandle>) {
        let mut state = self.state.lock();
        state.dirty.searches.extend(handles);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.state.lock().dirty.errors.push(message);
    }

    pub fn run_on_ui(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().functions.push(Box::new(f));
    }

    /// Swaps everything out, runs the deferred functions and returns the
    /// accumulated flags.
    pub fn drain(&self) -> Dirty {
        let (dirty, functions) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.dirty),
                std::mem::take(&mut state.functions),
            )
        };
        for f in functions {
            f();
        }
        dirty
    }
}

impl fmt::Debug for UiChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UiChannel")
            .field("dirty", &state.dirty)
            .field("functions", &state.functions.len())
            .finish()
    }
}
